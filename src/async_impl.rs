//! Asynchronous queries on top of [`tokio::net::UdpSocket`]
//!
//! The functions mirror the blocking API: one socket per query, one request, one reply
//! awaited until the configured timeout.
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout_at;

#[cfg(feature = "log")]
use crate::log::debug;
use crate::drift::{DriftCheck, DriftReport};
use crate::packet::{decode_response, encode_request};
use crate::socket::{self, Clock, SystemClock, RECV_BUFFER_SIZE};
use crate::types::{Error, NtpResult, QueryOptions, Result};

/// Queries `host` once and returns the measured result
///
/// # Errors
///
/// See [`crate::query`]
pub async fn query(host: &str, options: &QueryOptions) -> Result<NtpResult> {
    query_with_clock(host, options, &SystemClock).await
}

/// Same as [`query`] with the local time taken from `clock`
///
/// # Errors
///
/// See [`crate::query`]
pub async fn query_with_clock<C: Clock>(
    host: &str,
    options: &QueryOptions,
    clock: &C,
) -> Result<NtpResult> {
    let deadline = socket::deadline_after(options.timeout);
    let addr = lookup_host((host, options.port))
        .await
        .map_err(Error::HostUnresolvable)?
        .next()
        .ok_or_else(|| socket::no_address(host))?;
    #[cfg(feature = "log")]
    debug!("query {host} - Address: {addr}, version {}", u8::from(options.version));

    let std_socket = socket::open(addr, options)?;
    std_socket.set_nonblocking(true).map_err(Error::Socket)?;
    let udp = UdpSocket::from_std(std_socket).map_err(Error::Socket)?;

    let t1 = clock.now();
    let request = encode_request(options.version, t1);
    let sent = udp.send(&request.0).await.map_err(Error::Socket)?;

    if sent != request.0.len() {
        return Err(Error::Socket(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!("sent {sent} of {} bytes", request.0.len()),
        )));
    }

    let mut buf = [0u8; RECV_BUFFER_SIZE];
    let len = match timeout_at(deadline.into(), udp.recv(&mut buf)).await {
        Ok(Ok(len)) => len,
        Ok(Err(e)) if socket::is_timeout(&e) => return Err(Error::Timeout),
        Ok(Err(e)) => return Err(Error::Socket(e)),
        Err(_) => return Err(Error::Timeout),
    };
    let t4 = clock.now();

    if Instant::now() > deadline {
        return Err(Error::Timeout);
    }

    let packet = decode_response(&buf[..len])?;
    #[cfg(feature = "log")]
    crate::debug_ntp_packet(&packet, t4);

    Ok(crate::build_result(&packet, t1, t4, clock))
}

/// Queries `host` with default options and returns the corrected current time
///
/// # Errors
///
/// See [`crate::query`]
pub async fn current_time(host: &str) -> Result<DateTime<Utc>> {
    query(host, &QueryOptions::default())
        .await
        .map(|result| result.time)
}

/// Runs `check` with both queries in flight at the same time
pub async fn check_drift(check: &DriftCheck) -> DriftReport {
    let (reference, server) = tokio::join!(
        query(check.reference(), check.options()),
        query(check.server(), check.options()),
    );

    check.report(reference, server, SystemClock.now())
}
