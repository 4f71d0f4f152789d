use core::fmt::{self, Display, Formatter};
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::packet::LeapIndicator;

/// Default NTP server port
pub const NTP_PORT: u16 = 123;
/// Default round-trip timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Highest stratum value, marks an unsynchronized server
pub const MAX_STRATUM: u8 = 16;
/// Longest accepted age of a server's reference time in seconds (2^17)
pub const MAX_POLL_INTERVAL_SECS: i64 = 1 << 17;
/// Largest accepted root dispersion budget in seconds
pub const MAX_DISPERSION_SECS: i64 = 16;

/// NTP client library result type
pub type Result<T> = core::result::Result<T, Error>;

/// The error type for the NTP client
///
/// Errors originate while resolving the server, on the network layer, or while
/// parsing the server's reply. None of them are retried by the library.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The server host name can not be resolved to an address
    HostUnresolvable(io::Error),
    /// Binding, configuring, sending on or receiving from the UDP socket failed.
    /// Unreachable destinations (including TTL exhaustion) usually surface here.
    Socket(io::Error),
    /// No reply arrived before the configured deadline
    Timeout,
    /// A reply arrived but is not a 48-byte NTP frame. Holds the received length.
    MalformedPacket(usize),
}

impl Error {
    /// Whether the query ran out of time. A timeout is inconclusive rather than a
    /// sign of a broken setup, public servers often drop requests.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::HostUnresolvable(e) => write!(f, "unable to resolve host: {e}"),
            Error::Socket(e) => write!(f, "socket error: {e}"),
            Error::Timeout => write!(f, "no reply before deadline"),
            Error::MalformedPacket(len) => {
                write!(f, "malformed NTP packet of {len} bytes")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::HostUnresolvable(e) | Error::Socket(e) => Some(e),
            Error::Timeout | Error::MalformedPacket(_) => None,
        }
    }
}

/// Rejected protocol version number
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InvalidVersion(pub u8);

impl Display for InvalidVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported NTP version {}, expected 2, 3 or 4", self.0)
    }
}

impl std::error::Error for InvalidVersion {}

/// NTP protocol version placed in requests
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum Version {
    V2,
    V3,
    #[default]
    V4,
}

impl From<Version> for u8 {
    fn from(v: Version) -> Self {
        match v {
            Version::V2 => 2,
            Version::V3 => 3,
            Version::V4 => 4,
        }
    }
}

impl TryFrom<u8> for Version {
    type Error = InvalidVersion;

    fn try_from(v: u8) -> core::result::Result<Self, Self::Error> {
        match v {
            2 => Ok(Version::V2),
            3 => Ok(Version::V3),
            4 => Ok(Version::V4),
            other => Err(InvalidVersion(other)),
        }
    }
}

/// Options of a single query
///
/// Defaults: version 4, port 123, 5 second timeout, OS default TTL, ephemeral local
/// port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// Protocol version put into the request
    pub version: Version,
    /// Server port
    pub port: u16,
    /// Deadline for the whole exchange, from socket setup until the reply arrives
    pub timeout: Duration,
    /// TTL (hop limit for IPv6) of the outgoing datagram
    pub ttl: Option<u32>,
    /// Local port to bind instead of an ephemeral one. A pinned port can only be
    /// used by one query at a time.
    pub local_port: Option<u16>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            version: Version::default(),
            port: NTP_PORT,
            timeout: DEFAULT_TIMEOUT,
            ttl: None,
            local_port: None,
        }
    }
}

impl QueryOptions {
    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }
}

/// Reference identifier of a server
///
/// Stratum 0 carries a kiss code, stratum 1 a reference clock source name, and
/// higher strata the IPv4 address (or an IPv6 address hash) of the upstream server.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct ReferenceId(pub u32);

impl ReferenceId {
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Renders the identifier the way `stratum` defines it
    #[must_use]
    pub fn describe(self, stratum: u8) -> String {
        match stratum {
            0 | 1 => self.ascii(),
            _ => Ipv4Addr::from(self.to_bytes()).to_string(),
        }
    }

    fn ascii(self) -> String {
        self.to_bytes()
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| if b.is_ascii_graphic() { char::from(*b) } else { '?' })
            .collect()
    }
}

impl Display for ReferenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Reasons a reply should not be trusted as a time reference
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// Stratum 0 reply, the server asks the client to back off. Holds the kiss code.
    KissOfDeath(String),
    /// Stratum above 16
    InvalidStratum(u8),
    /// Server clock is not synchronized (stratum 16 or leap `NotInSync`)
    Unsynchronized,
    /// Server reference time is older than 2^17 seconds
    StaleReference,
    /// Root delay / 2 + root dispersion exceeds 16 seconds
    InvalidDispersion,
    /// Server time is earlier than its own reference time
    InvalidTime,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::KissOfDeath(code) => {
                write!(f, "kiss of death received: {code}")
            }
            ValidationError::InvalidStratum(s) => write!(f, "invalid stratum {s}"),
            ValidationError::Unsynchronized => {
                write!(f, "server clock not synchronized")
            }
            ValidationError::StaleReference => {
                write!(f, "server reference clock is stale")
            }
            ValidationError::InvalidDispersion => {
                write!(f, "server root dispersion too large")
            }
            ValidationError::InvalidTime => {
                write!(f, "server time precedes its reference time")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Result of one NTP query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtpResult {
    /// Local clock corrected by `clock_offset`
    pub time: DateTime<Utc>,
    /// Estimated difference between the server clock and the local clock. Positive
    /// when the server clock reads later than the local one.
    pub clock_offset: TimeDelta,
    /// Network round trip without the server's processing time
    pub rtt: TimeDelta,
    /// Server stratum
    pub stratum: u8,
    /// Leap second warning
    pub leap: LeapIndicator,
    /// Server poll interval
    pub poll: TimeDelta,
    /// Server clock precision
    pub precision: TimeDelta,
    /// Server reference identifier
    pub reference_id: ReferenceId,
    /// Server estimate of the round trip to its reference clock
    pub root_delay: TimeDelta,
    /// Server estimate of its error relative to its reference clock
    pub root_dispersion: TimeDelta,
    /// Time the server clock was last set or corrected
    pub reference_time: DateTime<Utc>,
}

impl NtpResult {
    /// Kiss code of a stratum 0 reply
    #[must_use]
    pub fn kiss_code(&self) -> Option<String> {
        (self.stratum == 0).then(|| self.reference_id.ascii())
    }

    /// Upper bound of the error of `time` relative to the server's reference clock
    #[must_use]
    pub fn root_distance(&self) -> TimeDelta {
        self.rtt / 2 + self.root_delay / 2 + self.root_dispersion
    }

    /// Checks whether the server looks usable as a time reference.
    ///
    /// The query itself never applies these checks, they are a policy of the caller.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found
    pub fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.stratum == 0 {
            return Err(ValidationError::KissOfDeath(
                self.kiss_code().unwrap_or_default(),
            ));
        }

        if self.stratum > MAX_STRATUM {
            return Err(ValidationError::InvalidStratum(self.stratum));
        }

        if self.stratum == MAX_STRATUM || self.leap == LeapIndicator::NotInSync {
            return Err(ValidationError::Unsynchronized);
        }

        if self.time - self.reference_time > TimeDelta::seconds(MAX_POLL_INTERVAL_SECS) {
            return Err(ValidationError::StaleReference);
        }

        if self.root_delay / 2 + self.root_dispersion
            > TimeDelta::seconds(MAX_DISPERSION_SECS)
        {
            return Err(ValidationError::InvalidDispersion);
        }

        if self.time < self.reference_time {
            return Err(ValidationError::InvalidTime);
        }

        Ok(())
    }
}
