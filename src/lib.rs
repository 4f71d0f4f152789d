//! Rust NTP query client
//!
//! # Overview
//!
//! This crate sends a single request to an NTP server, times the exchange with the four
//! protocol timestamps and reports the local clock offset, the round-trip time and the
//! server's header fields. Supported protocol versions: 2, 3 and 4
//! ([NTPv4](https://datatracker.ietf.org/doc/html/rfc5905)).
//!
//! # Usage
//!
//! Put this in your `Cargo.toml`:
//! ```cargo
//! [dependencies]
//! ntp-query = "0.1"
//! ```
//!
//! ## Features
//!
//! - `log`: enables library debug output during execution (enabled by default)
//! - `tokio`: adds the [`async_impl`] module built on `tokio::net::UdpSocket`
//! - `cli`: builds the `ntp-timecheck` command line tool
//!
//! # Details
//!
//! Every query is an independent exchange over its own UDP socket which is closed before
//! the call returns. Nothing is retried, every failure is returned to the caller as an
//! [`Error`]:
//! - [`query`] returns the full [`NtpResult`]
//! - [`current_time`] returns only the corrected current time
//! - [`query_over`] runs the exchange over a caller-provided [`NtpUdpSocket`] and
//!   [`Clock`], which is useful when the transport needs to be replaced
//! - [`drift::DriftCheck`] compares the local clock with two servers at once
//!
//! The query is a measurement primitive: stratum, leap indicator and dispersion are
//! reported as received. [`NtpResult::validate`] applies the usual sanity checks when a
//! caller wants them.
//!
//! ## Logging support
//!
//! Library debug logs can be enabled in executables by enabling `log` feature. Server
//! addresses, decoded replies and the computed offset will be printed.
//!
//! # Example
//!
//! ```no_run
//! use ntp_query::{query, QueryOptions, Version};
//! use std::time::Duration;
//!
//! let options = QueryOptions::default()
//!     .with_version(Version::V4)
//!     .with_timeout(Duration::from_secs(2));
//!
//! match query("pool.ntp.org", &options) {
//!     Ok(result) => println!(
//!         "offset {} ms, rtt {} ms, stratum {}",
//!         result.clock_offset.num_milliseconds(),
//!         result.rtt.num_milliseconds(),
//!         result.stratum,
//!     ),
//!     Err(e) if e.is_timeout() => println!("no answer, result inconclusive"),
//!     Err(e) => eprintln!("query failed: {e}"),
//! }
//! ```

mod log;
mod types;

pub mod drift;
pub mod packet;
pub mod socket;
pub mod timestamp;

#[cfg(feature = "tokio")]
pub mod async_impl;

use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};

#[cfg(feature = "log")]
use crate::log::debug;
use crate::packet::{decode_response, encode_request, NtpPacket};
pub use crate::socket::{Clock, NtpUdpSocket, SystemClock};
use crate::timestamp::{log2_interval, total_nanos, NSEC_IN_SEC};
pub use crate::types::*;

/// Queries `host` once and returns the measured result
///
/// The host is resolved, a fresh UDP socket is opened according to `options`, one
/// request is sent and one reply is awaited until `options.timeout` runs out.
///
/// # Errors
///
/// - [`Error::HostUnresolvable`] if `host` has no address
/// - [`Error::Socket`] on bind, TTL, send or receive failures
/// - [`Error::Timeout`] if no reply arrives in time
/// - [`Error::MalformedPacket`] if the reply is not a 48-byte NTP header
pub fn query(host: &str, options: &QueryOptions) -> Result<NtpResult> {
    query_with_clock(host, options, &SystemClock)
}

/// Same as [`query`] with the local time taken from `clock`
///
/// # Errors
///
/// See [`query`]
pub fn query_with_clock<C: Clock>(
    host: &str,
    options: &QueryOptions,
    clock: &C,
) -> Result<NtpResult> {
    let deadline = socket::deadline_after(options.timeout);
    let addr = socket::resolve(host, options.port)?;
    #[cfg(feature = "log")]
    debug!("query {host} - Address: {addr}, version {}", u8::from(options.version));

    let udp = socket::open(addr, options)?;

    run_exchange(&udp, options.version, deadline, clock)
}

/// Runs one exchange over an already connected `socket`
///
/// Only `version` and `timeout` of `options` apply, the socket is used as is.
///
/// # Errors
///
/// See [`query`], except for [`Error::HostUnresolvable`]
pub fn query_over<U, C>(
    socket: &U,
    options: &QueryOptions,
    clock: &C,
) -> Result<NtpResult>
where
    U: NtpUdpSocket,
    C: Clock,
{
    let deadline = socket::deadline_after(options.timeout);

    run_exchange(socket, options.version, deadline, clock)
}

/// Queries `host` with default options and returns the corrected current time
///
/// # Errors
///
/// See [`query`]
pub fn current_time(host: &str) -> Result<DateTime<Utc>> {
    query(host, &QueryOptions::default()).map(|result| result.time)
}

/// Clock offset and round-trip time from the four exchange timestamps
///
/// `t1` is the client send time, `t2` the server receive time, `t3` the server
/// transmit time and `t4` the client receive time. A positive offset means the
/// server clock reads later than the local one. The halving of the offset rounds
/// towards negative infinity at nanosecond resolution.
#[must_use]
pub fn offset_and_rtt(
    t1: DateTime<Utc>,
    t2: DateTime<Utc>,
    t3: DateTime<Utc>,
    t4: DateTime<Utc>,
) -> (TimeDelta, TimeDelta) {
    let offset = half_floor((t2 - t1) + (t3 - t4));
    let rtt = (t4 - t1) - (t3 - t2);

    (offset, rtt)
}

fn half_floor(d: TimeDelta) -> TimeDelta {
    let half = total_nanos(d).div_euclid(2);
    let nsec = i128::from(NSEC_IN_SEC);

    TimeDelta::seconds(half.div_euclid(nsec) as i64)
        + TimeDelta::nanoseconds(half.rem_euclid(nsec) as i64)
}

fn run_exchange<U, C>(
    socket: &U,
    version: Version,
    deadline: Instant,
    clock: &C,
) -> Result<NtpResult>
where
    U: NtpUdpSocket,
    C: Clock,
{
    let t1 = clock.now();
    let request = encode_request(version, t1);
    let reply = socket::exchange_on(socket, &request, deadline, clock)?;
    let packet = decode_response(reply.payload())?;

    #[cfg(feature = "log")]
    debug_ntp_packet(&packet, reply.destination);

    let result = build_result(&packet, t1, reply.destination, clock);
    #[cfg(feature = "log")]
    debug!(
        "offset {} us, rtt {} us",
        total_nanos(result.clock_offset) / 1000,
        total_nanos(result.rtt) / 1000
    );

    Ok(result)
}

pub(crate) fn build_result<C: Clock>(
    packet: &NtpPacket,
    t1: DateTime<Utc>,
    t4: DateTime<Utc>,
    clock: &C,
) -> NtpResult {
    let t2 = packet.receive_timestamp.to_datetime();
    let t3 = packet.transmit_timestamp.to_datetime();
    let (clock_offset, rtt) = offset_and_rtt(t1, t2, t3, t4);

    NtpResult {
        time: clock.now() + clock_offset,
        clock_offset,
        rtt,
        stratum: packet.stratum,
        leap: packet.leap,
        poll: log2_interval(packet.poll),
        precision: log2_interval(packet.precision),
        reference_id: packet.reference_id,
        root_delay: packet.root_delay.to_duration(),
        root_dispersion: packet.root_dispersion.to_duration(),
        reference_time: packet.reference_timestamp.to_datetime(),
    }
}

#[cfg(feature = "log")]
pub(crate) fn debug_ntp_packet(packet: &NtpPacket, destination: DateTime<Utc>) {
    let delimiter = "=".repeat(64);

    debug!("{delimiter}");
    debug!("| Mode:\t\t{:?}", packet.mode);
    debug!("| Version:\t{}", packet.version);
    debug!("| Leap:\t\t{}", packet.leap);
    debug!("| Stratum:\t{}", packet.stratum);
    debug!("| Poll:\t\t{}", packet.poll);
    debug!("| Precision:\t\t{}", packet.precision);
    debug!("| Root delay:\t\t{:#010x}", packet.root_delay.0);
    debug!("| Root dispersion:\t{:#010x}", packet.root_dispersion.0);
    debug!(
        "| Reference ID:\t\t{}",
        packet.reference_id.describe(packet.stratum)
    );
    debug!(
        "| Origin timestamp    (client):\t{}",
        packet.origin_timestamp.to_datetime()
    );
    debug!(
        "| Receive timestamp   (server):\t{}",
        packet.receive_timestamp.to_datetime()
    );
    debug!(
        "| Transmit timestamp  (server):\t{}",
        packet.transmit_timestamp.to_datetime()
    );
    debug!("| Receive timestamp   (client):\t{destination}");
    debug!(
        "| Reference timestamp (server):\t{}",
        packet.reference_timestamp.to_datetime()
    );
    debug!("{delimiter}");
}

#[cfg(test)]
mod query_tests {
    use super::*;
    use crate::packet::{LeapIndicator, Mode, RawNtpPacket, NTP_PACKET_SIZE};
    use crate::timestamp::{NtpShortTime, NtpTime};

    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::io;
    use std::net::UdpSocket;
    use std::thread;
    use std::time::Duration;

    /// Local time rounded through the wire format so that it survives encoding
    fn wire_now() -> DateTime<Utc> {
        NtpTime::from(Utc::now()).to_datetime()
    }

    fn secs(s: i64) -> TimeDelta {
        TimeDelta::seconds(s)
    }

    struct ScriptedClock {
        readings: RefCell<VecDeque<DateTime<Utc>>>,
    }

    impl ScriptedClock {
        fn new(readings: &[DateTime<Utc>]) -> Self {
            ScriptedClock {
                readings: RefCell::new(readings.iter().copied().collect()),
            }
        }
    }

    impl Clock for ScriptedClock {
        fn now(&self) -> DateTime<Utc> {
            self.readings
                .borrow_mut()
                .pop_front()
                .expect("clock read more often than scripted")
        }
    }

    struct MockSocket {
        reply: RefCell<Option<io::Result<Vec<u8>>>>,
        sent: RefCell<Vec<u8>>,
        recv_calls: Cell<usize>,
    }

    impl MockSocket {
        fn replying(reply: io::Result<Vec<u8>>) -> Self {
            MockSocket {
                reply: RefCell::new(Some(reply)),
                sent: RefCell::new(Vec::new()),
                recv_calls: Cell::new(0),
            }
        }
    }

    impl NtpUdpSocket for MockSocket {
        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            self.sent.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn recv(&self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            self.recv_calls.set(self.recv_calls.get() + 1);
            let payload = self
                .reply
                .borrow_mut()
                .take()
                .expect("one reply per exchange")?;
            buf[..payload.len()].copy_from_slice(&payload);
            Ok(payload.len())
        }
    }

    fn server_reply(
        origin: DateTime<Utc>,
        receive: DateTime<Utc>,
        transmit: DateTime<Utc>,
    ) -> NtpPacket {
        NtpPacket {
            leap: LeapIndicator::NoWarning,
            version: 4,
            mode: Mode::Server,
            stratum: 2,
            poll: 6,
            precision: -20,
            root_delay: NtpShortTime(0x0000_8000),
            root_dispersion: NtpShortTime(0x0000_4000),
            reference_id: ReferenceId(u32::from_be_bytes([192, 0, 2, 1])),
            reference_timestamp: NtpTime::from(receive - secs(30)),
            origin_timestamp: NtpTime::from(origin),
            receive_timestamp: NtpTime::from(receive),
            transmit_timestamp: NtpTime::from(transmit),
        }
    }

    #[test]
    fn test_offset_calculate() {
        let now = wire_now();
        let (offset, rtt) =
            offset_and_rtt(now, now + secs(20), now + secs(21), now + secs(5));

        assert_eq!(offset, secs(18));
        assert_eq!(rtt, secs(4));

        let (offset, _) = offset_and_rtt(
            now + secs(101),
            now + secs(102),
            now + secs(103),
            now + secs(105),
        );

        assert_eq!(offset, TimeDelta::milliseconds(-500));
    }

    #[test]
    fn test_offset_halving_rounds_down() {
        let now = wire_now();
        let ns = TimeDelta::nanoseconds;

        let (offset, rtt) = offset_and_rtt(now, now, now, now + ns(1));
        assert_eq!(offset, ns(-1));
        assert_eq!(rtt, ns(1));

        let (offset, _) = offset_and_rtt(now, now + ns(1), now + ns(1), now + ns(1));
        assert_eq!(offset, TimeDelta::zero());

        let (offset, _) = offset_and_rtt(now, now + ns(3), now + ns(3), now + ns(2));
        assert_eq!(offset, ns(2));
    }

    #[test]
    fn test_offset_captured_exchanges() {
        // (T1, T2, T3, T4, expected offset in microseconds)
        let exchanges: [(u64, u64, u64, u64, i64); 4] = [
            (
                16_893_142_954_672_769_962,
                16_893_142_959_053_084_959,
                16_893_142_959_053_112_968,
                16_893_142_954_793_063_406,
                1_005_870,
            ),
            (
                16_893_362_966_131_575_843,
                16_893_362_966_715_800_791,
                16_893_362_966_715_869_584,
                16_893_362_967_084_349_913,
                25_115,
            ),
            (
                16_893_399_716_399_327_198,
                16_893_399_716_453_045_029,
                16_893_399_716_453_098_083,
                16_893_399_716_961_924_964,
                -52_981,
            ),
            (
                9_487_534_663_484_046_772,
                16_882_120_099_581_835_046,
                16_882_120_099_583_884_144,
                9_487_534_663_651_464_597,
                1_721_686_086_620_926,
            ),
        ];

        for (t1, t2, t3, t4, expected) in exchanges {
            let (offset, _) = offset_and_rtt(
                NtpTime(t1).to_datetime(),
                NtpTime(t2).to_datetime(),
                NtpTime(t3).to_datetime(),
                NtpTime(t4).to_datetime(),
            );

            assert_eq!(offset.num_microseconds(), Some(expected), "t1 = {t1}");
        }
    }

    #[test]
    fn test_query_over_scripted_exchange() {
        let t1 = wire_now();
        let t4 = t1 + secs(5);
        let after = t1 + secs(6);
        let reply = server_reply(t1, t1 + secs(20), t1 + secs(21));
        let socket = MockSocket::replying(Ok(reply.to_bytes().0.to_vec()));
        let clock = ScriptedClock::new(&[t1, t4, after]);

        let result = query_over(&socket, &QueryOptions::default(), &clock).unwrap();

        assert_eq!(result.clock_offset, secs(18));
        assert_eq!(result.rtt, secs(4));
        assert_eq!(result.time, after + secs(18));
        assert_eq!(result.stratum, 2);
        assert_eq!(result.leap, LeapIndicator::NoWarning);
        assert_eq!(result.poll, secs(64));
        assert_eq!(result.precision, TimeDelta::nanoseconds(953));
        assert_eq!(result.root_delay, TimeDelta::milliseconds(500));
        assert_eq!(result.root_dispersion, TimeDelta::milliseconds(250));
        assert_eq!(result.reference_id.describe(result.stratum), "192.0.2.1");
        assert_eq!(result.reference_time, t1 + secs(20) - secs(30));

        let sent = socket.sent.borrow();
        let request = NtpPacket::from_bytes(&sent).unwrap();
        assert_eq!(request.mode, Mode::Client);
        assert_eq!(request.version, 4);
        assert_eq!(request.transmit_timestamp, NtpTime::from(t1));
    }

    #[test]
    fn test_query_over_uses_requested_version() {
        let t1 = wire_now();
        let reply = server_reply(t1, t1, t1);
        let socket = MockSocket::replying(Ok(reply.to_bytes().0.to_vec()));
        let clock = ScriptedClock::new(&[t1, t1, t1]);
        let options = QueryOptions::default().with_version(Version::V2);

        query_over(&socket, &options, &clock).unwrap();

        assert_eq!(socket.sent.borrow()[0], (2 << 3) | 3);
    }

    #[test]
    fn test_query_over_short_reply() {
        let t1 = wire_now();
        let socket = MockSocket::replying(Ok(vec![0x24; 47]));
        let clock = ScriptedClock::new(&[t1, t1]);

        let result = query_over(&socket, &QueryOptions::default(), &clock);

        assert!(matches!(result, Err(Error::MalformedPacket(47))));
    }

    #[test]
    fn test_query_over_oversized_reply() {
        let t1 = wire_now();
        let socket = MockSocket::replying(Ok(vec![0x24; NTP_PACKET_SIZE + 20]));
        let clock = ScriptedClock::new(&[t1, t1]);

        let result = query_over(&socket, &QueryOptions::default(), &clock);

        assert!(matches!(result, Err(Error::MalformedPacket(68))));
    }

    #[test]
    fn test_query_over_io_errors() {
        let t1 = wire_now();

        for (kind, timeout) in [
            (io::ErrorKind::WouldBlock, true),
            (io::ErrorKind::TimedOut, true),
            (io::ErrorKind::ConnectionRefused, false),
        ] {
            let socket = MockSocket::replying(Err(io::Error::from(kind)));
            let clock = ScriptedClock::new(&[t1]);
            let result = query_over(&socket, &QueryOptions::default(), &clock);

            match result {
                Err(Error::Timeout) => assert!(timeout, "{kind:?}"),
                Err(Error::Socket(e)) => {
                    assert!(!timeout, "{kind:?}");
                    assert_eq!(e.kind(), kind);
                }
                other => panic!("unexpected result {other:?} for {kind:?}"),
            }
            assert_eq!(socket.recv_calls.get(), 1);
        }
    }

    #[test]
    fn test_query_over_zero_timeout_never_receives() {
        let t1 = wire_now();
        let socket = MockSocket::replying(Ok(vec![0u8; NTP_PACKET_SIZE]));
        let clock = ScriptedClock::new(&[t1]);
        let options = QueryOptions::default().with_timeout(Duration::ZERO);

        let result = query_over(&socket, &options, &clock);

        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(socket.recv_calls.get(), 0);
    }

    /// One-shot server on the loopback interface answering with its own clock
    fn spawn_loopback_server() -> (u16, thread::JoinHandle<()>) {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        server
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; NTP_PACKET_SIZE];
            let Ok((_, peer)) = server.recv_from(&mut buf) else {
                return;
            };
            let request = NtpPacket::from(&RawNtpPacket(buf));
            let receive = Utc::now();
            let mut reply = server_reply(Utc::now(), receive, Utc::now());
            reply.version = request.version;
            reply.origin_timestamp = request.transmit_timestamp;
            server.send_to(&reply.to_bytes().0, peer).unwrap();
        });

        (port, handle)
    }

    #[test]
    fn test_query_loopback_server() {
        let (port, handle) = spawn_loopback_server();
        let options = QueryOptions::default()
            .with_port(port)
            .with_timeout(Duration::from_secs(2));

        let result = query("127.0.0.1", &options).unwrap();
        handle.join().unwrap();

        assert_eq!(result.stratum, 2);
        assert!(result.rtt >= TimeDelta::zero());
        assert!(result.clock_offset.abs() < secs(1));
        assert!((result.time - Utc::now()).abs() < secs(1));
    }

    #[test]
    fn test_query_loopback_nanosecond_timeout() {
        let (port, handle) = spawn_loopback_server();
        let options = QueryOptions::default()
            .with_port(port)
            .with_timeout(Duration::from_nanos(1));

        let result = query("127.0.0.1", &options);
        handle.join().unwrap();

        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn test_query_closed_port() {
        let closed = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let options = QueryOptions::default()
            .with_port(port)
            .with_timeout(Duration::from_millis(500));
        let started = Instant::now();

        assert!(query("127.0.0.1", &options).is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_query_unresolvable_host() {
        let result = query("asdf.asdf.invalid", &QueryOptions::default());

        assert!(matches!(result, Err(Error::HostUnresolvable(_))));
    }

    #[test]
    #[ignore = "requires access to pool.ntp.org"]
    fn test_ntp_request_versions() {
        for version in [Version::V2, Version::V3, Version::V4] {
            let options = QueryOptions::default().with_version(version);
            let result = query("pool.ntp.org", &options).unwrap();

            assert!((1..=16).contains(&result.stratum), "{version:?}");
            assert!(result.rtt >= TimeDelta::zero());
            assert!((result.time - Utc::now()).abs() < secs(1));
        }
    }

    #[test]
    #[ignore = "requires access to pool.ntp.org"]
    fn test_ntp_request_ttl() {
        let options = QueryOptions::default().with_timeout(Duration::from_secs(2));

        assert!(query("pool.ntp.org", &options.clone().with_ttl(1)).is_err());
        assert!(query("pool.ntp.org", &options.with_ttl(255)).is_ok());
    }

    #[test]
    #[ignore = "requires access to pool.ntp.org"]
    fn test_ntp_request_wrong_port() {
        let options = QueryOptions::default()
            .with_port(9)
            .with_timeout(Duration::from_secs(1));
        let started = Instant::now();

        assert!(query("pool.ntp.org", &options).is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    #[ignore = "requires access to pool.ntp.org"]
    fn test_ntp_request_nanosecond_timeout() {
        let options = QueryOptions::default().with_timeout(Duration::from_nanos(1));

        assert!(matches!(
            query("pool.ntp.org", &options),
            Err(Error::Timeout)
        ));
    }

    #[test]
    #[ignore = "requires network access"]
    fn test_ntp_request_unreachable_link_local() {
        let options = QueryOptions::default().with_timeout(Duration::from_secs(1));

        assert!(query("169.254.122.229", &options).is_err());
    }

    #[test]
    #[ignore = "requires access to pool.ntp.org"]
    fn test_current_time() {
        let time = current_time("pool.ntp.org").unwrap();

        assert!((time - Utc::now()).abs() < secs(1));
    }
}
