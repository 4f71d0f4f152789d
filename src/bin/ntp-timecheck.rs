//! Queries an NTP server and prints the measured offset
//!
//! ```text
//! cargo run --features cli -- pool.ntp.org
//! cargo run --features cli -- --time-only time.google.com
//! cargo run --features cli -- --drift-server ntp.example.com 0.pool.ntp.org
//! ```
//!
//! Exit code is `1` when the query fails and `2` when a drift check finds a clock out
//! of tolerance.
use ntp_query::drift::DriftCheck;
use ntp_query::{current_time, query, NtpResult, QueryOptions, Version, NTP_PORT};

use std::process::ExitCode;
use std::time::Duration;

use chrono::TimeDelta;
use clap::Parser;

#[derive(Parser)]
#[command(name = "ntp-timecheck")]
#[command(version)]
struct Cli {
    /// NTP server hostname (reference server with `--drift-server`)
    host: String,

    /// NTP server port
    #[arg(short, long, default_value_t = NTP_PORT)]
    port: u16,

    /// NTP protocol version put into the request
    #[arg(short = 'n', long, default_value = "4", value_parser = parse_version)]
    ntp_version: Version,

    /// Round-trip timeout in milliseconds
    #[arg(short, long, default_value = "5000")]
    timeout_ms: u64,

    /// TTL of the outgoing request
    #[arg(long)]
    ttl: Option<u32>,

    /// Local port to send the request from
    #[arg(long)]
    local_port: Option<u16>,

    /// Print only the corrected current time
    #[arg(long, conflicts_with = "drift_server")]
    time_only: bool,

    /// Compare this server and the local clock against `host`
    #[arg(long)]
    drift_server: Option<String>,

    /// Largest accepted drift in seconds
    #[arg(long, default_value = "60")]
    tolerance_secs: u32,

    /// Print library debug output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_version(s: &str) -> Result<Version, String> {
    let v: u8 = s.parse().map_err(|e| format!("{e}"))?;

    Version::try_from(v).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose || cfg!(debug_assertions) {
        log::Level::Trace
    } else {
        log::Level::Info
    };

    if let Err(e) = simple_logger::init_with_level(level) {
        eprintln!("Unable to initialize logger: {e}");
    }

    let mut options = QueryOptions::default()
        .with_version(cli.ntp_version)
        .with_port(cli.port)
        .with_timeout(Duration::from_millis(cli.timeout_ms));
    options.ttl = cli.ttl;
    options.local_port = cli.local_port;

    if let Some(server) = &cli.drift_server {
        let check = DriftCheck::new(cli.host.as_str(), server.as_str())
            .with_tolerance(TimeDelta::seconds(i64::from(cli.tolerance_secs)))
            .with_options(options);
        let report = check.run();

        print!("{report}");

        return if report.exceeds_tolerance() {
            ExitCode::from(2)
        } else {
            ExitCode::SUCCESS
        };
    }

    if cli.time_only && options == QueryOptions::default() {
        return match current_time(&cli.host) {
            Ok(time) => {
                println!("{}", time.to_rfc3339());
                ExitCode::SUCCESS
            }
            Err(e) => fail(&cli.host, &e),
        };
    }

    match query(&cli.host, &options) {
        Ok(result) if cli.time_only => {
            println!("{}", result.time.to_rfc3339());
            ExitCode::SUCCESS
        }
        Ok(result) => {
            print_result(&cli.host, &result);
            ExitCode::SUCCESS
        }
        Err(e) => fail(&cli.host, &e),
    }
}

fn fail(host: &str, e: &ntp_query::Error) -> ExitCode {
    if e.is_timeout() {
        eprintln!("No reply from {host}, result inconclusive");
    } else {
        eprintln!("Unable to query {host}: {e}");
    }

    ExitCode::FAILURE
}

fn print_result(host: &str, result: &NtpResult) {
    let rows = [
        ("Server", host.to_owned()),
        ("Time", result.time.to_rfc3339()),
        ("Offset", format!("{} us", micros(result.clock_offset))),
        ("Round trip", format!("{} us", micros(result.rtt))),
        ("Stratum", result.stratum.to_string()),
        ("Leap", result.leap.to_string()),
        (
            "Reference ID",
            result.reference_id.describe(result.stratum),
        ),
        ("Reference time", result.reference_time.to_rfc3339()),
        ("Poll", format!("{} s", result.poll.num_seconds())),
        ("Precision", format!("{} ns", nanos(result.precision))),
        ("Root delay", format!("{} us", micros(result.root_delay))),
        ("Root dispersion", format!("{} us", micros(result.root_dispersion))),
        ("Root distance", format!("{} us", micros(result.root_distance()))),
    ];
    let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);

    for (label, value) in rows {
        println!("{label:<width$} | {value}");
    }

    match result.validate() {
        Ok(()) => println!("{:<width$} | OK", "Status"),
        Err(e) => println!("{:<width$} | {e}", "Status"),
    }
}

fn micros(d: TimeDelta) -> i64 {
    d.num_microseconds().unwrap_or(i64::MAX)
}

fn nanos(d: TimeDelta) -> i64 {
    d.num_nanoseconds().unwrap_or(i64::MAX)
}
