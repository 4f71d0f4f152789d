//! UDP transport for a single request/reply exchange
//!
//! A fresh socket is opened for each query and dropped on every exit path. The socket
//! is connected to the server, so the OS filters out datagrams from other peers and
//! reports ICMP errors back on the receive call.
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use socket2::{Domain, Protocol, Socket, Type};

#[cfg(feature = "log")]
use crate::log::trace;
use crate::packet::RawNtpPacket;
use crate::types::{Error, QueryOptions, Result};

/// Receive buffer size. Larger than an NTP header so that oversized replies are
/// detected instead of silently truncated.
pub(crate) const RECV_BUFFER_SIZE: usize = 512;

/// A trait encapsulating the UDP socket operations required for an NTP exchange
///
/// The socket is expected to be connected to the server already.
pub trait NtpUdpSocket {
    /// Sends `buf` as a single datagram. On success, returns the number of bytes
    /// written.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an underlying UDP send fails
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receives a single datagram, waiting at most `timeout`. On success, returns the
    /// number of bytes read.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an underlying UDP receive fails. Running out of time is
    /// reported with [`io::ErrorKind::WouldBlock`] or [`io::ErrorKind::TimedOut`].
    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

impl NtpUdpSocket for UdpSocket {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf)
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.set_read_timeout(Some(timeout))?;
        UdpSocket::recv(self, buf)
    }
}

/// A source of the local wall-clock time used to stamp requests and replies
pub trait Clock {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system real-time clock
#[derive(Debug, Copy, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Reply datagram together with its local arrival time (T4)
pub(crate) struct Reply {
    buf: [u8; RECV_BUFFER_SIZE],
    len: usize,
    pub(crate) destination: DateTime<Utc>,
}

impl Reply {
    pub(crate) fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Resolves `host` and picks the first address
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(Error::HostUnresolvable)?
        .next()
        .ok_or_else(|| no_address(host))
}

pub(crate) fn no_address(host: &str) -> Error {
    Error::HostUnresolvable(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no address found for {host}"),
    ))
}

/// Unspecified local address of the same family as `target`
pub(crate) fn bind_addr_for(
    target: &SocketAddr,
    local_port: Option<u16>,
) -> SocketAddr {
    let port = local_port.unwrap_or(0);

    match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
    }
}

/// Creates a UDP socket for `addr`: binds it, applies the TTL and connects it
pub(crate) fn open(addr: SocketAddr, options: &QueryOptions) -> Result<UdpSocket> {
    let bind_addr = bind_addr_for(&addr, options.local_port);
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    #[cfg(feature = "log")]
    trace!("bind {bind_addr} for {addr}, ttl {:?}", options.ttl);

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(Error::Socket)?;

    if let Some(ttl) = options.ttl {
        let applied = if addr.is_ipv4() {
            socket.set_ttl(ttl)
        } else {
            socket.set_unicast_hops_v6(ttl)
        };
        applied.map_err(Error::Socket)?;
    }

    socket.bind(&bind_addr.into()).map_err(Error::Socket)?;
    socket.connect(&addr.into()).map_err(Error::Socket)?;

    Ok(socket.into())
}

/// Point in time `timeout` from now
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();

    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(u64::from(u32::MAX)))
}

/// Whether an I/O error means the receive ran out of time
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Sends `request` and waits for one reply until `deadline`.
///
/// The arrival time is read from `clock` right after the receive returns. A reply
/// that shows up after the deadline counts as a timeout.
pub(crate) fn exchange_on<U, C>(
    socket: &U,
    request: &RawNtpPacket,
    deadline: Instant,
    clock: &C,
) -> Result<Reply>
where
    U: NtpUdpSocket,
    C: Clock,
{
    let sent = socket.send(&request.0).map_err(Error::Socket)?;

    if sent != request.0.len() {
        return Err(Error::Socket(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("sent {sent} of {} bytes", request.0.len()),
        )));
    }

    let remaining = deadline.saturating_duration_since(Instant::now());

    if remaining.is_zero() {
        return Err(Error::Timeout);
    }

    let mut buf = [0u8; RECV_BUFFER_SIZE];

    match socket.recv(&mut buf, remaining) {
        Ok(len) => {
            let destination = clock.now();

            if Instant::now() > deadline {
                return Err(Error::Timeout);
            }

            Ok(Reply {
                buf,
                len,
                destination,
            })
        }
        Err(e) if is_timeout(&e) => Err(Error::Timeout),
        Err(e) => Err(Error::Socket(e)),
    }
}
