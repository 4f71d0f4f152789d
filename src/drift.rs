//! Clock drift between the local host, a server and a reference
//!
//! Two independent queries are issued in parallel, one to the reference (usually a
//! public pool server) and one to the server being checked. Each reading is compared
//! with the others and with the local clock:
//!
//! ```text
//! NTP Server (0.pool.ntp.org) | 2024-05-01 10:00:00.120 UTC
//! Server                      | 2024-05-01 10:00:00.121 UTC
//! Client                      | 2024-05-01 10:00:00.119 UTC
//! Server Time Drift           | OK
//! Client Time Drift           | OK
//! Client to Server Time Drift | OK
//! ```
use core::fmt::{self, Display, Formatter};
use std::panic;
use std::thread;

use chrono::{DateTime, TimeDelta, Utc};

#[cfg(feature = "log")]
use crate::log::debug;
use crate::socket::{Clock, SystemClock};
use crate::timestamp::total_nanos;
use crate::types::{NtpResult, QueryOptions, Result};

/// Default largest accepted drift in seconds
pub const DEFAULT_DRIFT_TOLERANCE_SECS: i64 = 60;

/// Outcome of comparing two clocks
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DriftStatus {
    /// Drift within tolerance
    Ok(TimeDelta),
    /// Drift beyond tolerance
    Drift(TimeDelta),
    /// One of the readings is missing
    Unknown,
}

impl DriftStatus {
    fn classify(drift: Option<TimeDelta>, tolerance: TimeDelta) -> Self {
        match drift {
            Some(d) if d.abs() <= tolerance => DriftStatus::Ok(d),
            Some(d) => DriftStatus::Drift(d),
            None => DriftStatus::Unknown,
        }
    }

    /// Measured drift, if known
    #[must_use]
    pub fn drift(self) -> Option<TimeDelta> {
        match self {
            DriftStatus::Ok(d) | DriftStatus::Drift(d) => Some(d),
            DriftStatus::Unknown => None,
        }
    }

    #[must_use]
    pub fn is_drift(self) -> bool {
        matches!(self, DriftStatus::Drift(_))
    }
}

impl Display for DriftStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DriftStatus::Ok(_) => write!(f, "OK"),
            DriftStatus::Drift(d) => {
                write!(f, "{} (out of tolerance)", format_delta(*d))
            }
            DriftStatus::Unknown => write!(f, "unable to get time"),
        }
    }
}

/// Drift check between a reference host and a server
#[derive(Debug, Clone)]
pub struct DriftCheck {
    reference: String,
    server: String,
    tolerance: TimeDelta,
    options: QueryOptions,
}

impl DriftCheck {
    /// Check of `server` against `reference` with a 60 second tolerance and default
    /// query options
    #[must_use]
    pub fn new(reference: impl Into<String>, server: impl Into<String>) -> Self {
        DriftCheck {
            reference: reference.into(),
            server: server.into(),
            tolerance: TimeDelta::seconds(DEFAULT_DRIFT_TOLERANCE_SECS),
            options: QueryOptions::default(),
        }
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance: TimeDelta) -> Self {
        self.tolerance = tolerance.abs();
        self
    }

    /// Options applied to both queries
    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }

    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    #[must_use]
    pub fn tolerance(&self) -> TimeDelta {
        self.tolerance
    }

    #[must_use]
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Queries both hosts in parallel and compares the readings with the local clock
    #[must_use]
    pub fn run(&self) -> DriftReport {
        self.run_with_clock(&SystemClock)
    }

    /// Same as [`DriftCheck::run`] with the local time taken from `clock`
    #[must_use]
    pub fn run_with_clock<C: Clock + Sync>(&self, clock: &C) -> DriftReport {
        let (reference, server) = thread::scope(|s| {
            let reference = s.spawn(|| {
                crate::query_with_clock(&self.reference, &self.options, clock)
            });
            let server = s.spawn(|| {
                crate::query_with_clock(&self.server, &self.options, clock)
            });

            (join(reference), join(server))
        });

        self.report(reference, server, clock.now())
    }

    /// Builds the report out of readings obtained elsewhere
    #[must_use]
    pub fn report(
        &self,
        reference: Result<NtpResult>,
        server: Result<NtpResult>,
        client_time: DateTime<Utc>,
    ) -> DriftReport {
        let reference_offset = reference.as_ref().ok().map(|r| r.clock_offset);
        let server_offset = server.as_ref().ok().map(|r| r.clock_offset);

        let server_drift = server_offset
            .zip(reference_offset)
            .map(|(server, reference)| server - reference);
        let client_drift = reference_offset.map(|offset| -offset);
        let client_server_drift = server_offset.map(|offset| -offset);

        #[cfg(feature = "log")]
        debug!(
            "drift vs {}: server {server_drift:?}, client {client_drift:?}, \
             client to server {client_server_drift:?}",
            self.reference
        );

        DriftReport {
            reference_host: self.reference.clone(),
            server_host: self.server.clone(),
            reference,
            server,
            client_time,
            tolerance: self.tolerance,
            server_drift: DriftStatus::classify(server_drift, self.tolerance),
            client_drift: DriftStatus::classify(client_drift, self.tolerance),
            client_server_drift: DriftStatus::classify(
                client_server_drift,
                self.tolerance,
            ),
        }
    }
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, T>) -> T {
    handle
        .join()
        .unwrap_or_else(|payload| panic::resume_unwind(payload))
}

/// Readings and drift statuses of one [`DriftCheck`]
#[derive(Debug)]
pub struct DriftReport {
    pub reference_host: String,
    pub server_host: String,
    /// Reading of the reference host
    pub reference: Result<NtpResult>,
    /// Reading of the checked server
    pub server: Result<NtpResult>,
    /// Local clock once both readings are in
    pub client_time: DateTime<Utc>,
    pub tolerance: TimeDelta,
    /// Server clock minus reference clock
    pub server_drift: DriftStatus,
    /// Local clock minus reference clock
    pub client_drift: DriftStatus,
    /// Local clock minus server clock
    pub client_server_drift: DriftStatus,
}

impl DriftReport {
    /// Whether any of the compared clocks is out of tolerance
    #[must_use]
    pub fn exceeds_tolerance(&self) -> bool {
        [self.server_drift, self.client_drift, self.client_server_drift]
            .iter()
            .any(|status| status.is_drift())
    }

    fn rows(&self) -> Vec<(String, String)> {
        vec![
            (
                format!("NTP Server ({})", self.reference_host),
                reading(&self.reference),
            ),
            ("Server".to_owned(), reading(&self.server)),
            ("Client".to_owned(), format_time(self.client_time)),
            ("Server Time Drift".to_owned(), self.server_drift.to_string()),
            ("Client Time Drift".to_owned(), self.client_drift.to_string()),
            (
                "Client to Server Time Drift".to_owned(),
                self.client_server_drift.to_string(),
            ),
        ]
    }
}

impl Display for DriftReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let rows = self.rows();
        let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);

        for (label, value) in rows {
            writeln!(f, "{label:<width$} | {value}")?;
        }

        Ok(())
    }
}

fn reading(result: &Result<NtpResult>) -> String {
    match result {
        Ok(r) => format_time(r.time),
        Err(e) => format!("unable to get time: {e}"),
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string()
}

fn format_delta(d: TimeDelta) -> String {
    let nanos = total_nanos(d);
    let sign = if nanos < 0 { "-" } else { "+" };
    let millis = nanos.unsigned_abs() / 1_000_000;

    format!("{sign}{}.{:03}s", millis / 1000, millis % 1000)
}
