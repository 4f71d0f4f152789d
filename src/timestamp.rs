//! Fixed-point NTP time representations
//!
//! NTP carries time in two unsigned fixed-point formats:
//! - the 32-bit "short" format (16 bits of seconds, 16 bits of fraction) used for
//!   root delay and root dispersion
//! - the 64-bit "long" format (32 bits of seconds, 32 bits of fraction) counted from
//!   the NTP epoch, `1900-01-01 00:00:00 UTC`, used for every packet timestamp
//!
//! Conversions to [`chrono`] types truncate anything below one nanosecond. Conversion
//! back into the long format rounds the fraction up, so an instant survives
//! `NtpTime::from(instant).to_datetime()` unchanged.
use chrono::{DateTime, TimeDelta, Utc};

/// Seconds between the NTP epoch (1900) and the UNIX epoch (1970)
pub(crate) const NTP_TIMESTAMP_DELTA: i64 = 2_208_988_800;
/// Nanoseconds in one second
pub(crate) const NSEC_IN_SEC: u64 = 1_000_000_000;
/// Long timestamp seconds mask
pub(crate) const SECONDS_MASK: u64 = 0xffff_ffff_0000_0000;
/// Long timestamp seconds fraction mask
pub(crate) const SECONDS_FRAC_MASK: u64 = 0xffff_ffff;
/// Short timestamp seconds fraction mask
const SHORT_FRAC_MASK: u32 = 0xffff;
/// Largest exponent converted by [`log2_interval`]
const MAX_INTERVAL_EXP: i8 = 32;

/// NTP short format timestamp: 16.16 fixed-point seconds
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NtpShortTime(pub u32);

impl NtpShortTime {
    /// Whole seconds part
    #[must_use]
    pub fn seconds(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Fraction part in 1/65536 second units
    #[must_use]
    pub fn fraction(self) -> u16 {
        (self.0 & SHORT_FRAC_MASK) as u16
    }

    /// Converts the value into a duration, truncating to whole nanoseconds
    #[must_use]
    pub fn to_duration(self) -> TimeDelta {
        let nanos = (u64::from(self.fraction()) * NSEC_IN_SEC) >> 16;

        TimeDelta::seconds(i64::from(self.seconds()))
            + TimeDelta::nanoseconds(nanos as i64)
    }
}

impl From<u32> for NtpShortTime {
    fn from(v: u32) -> Self {
        NtpShortTime(v)
    }
}

impl From<NtpShortTime> for TimeDelta {
    fn from(v: NtpShortTime) -> Self {
        v.to_duration()
    }
}

/// NTP long format timestamp: 32.32 fixed-point seconds since the NTP epoch
///
/// The value is treated as a raw 64-bit number. No era disambiguation is done, so
/// every bit pattern maps to an instant between 1900 and 2036.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NtpTime(pub u64);

impl NtpTime {
    /// Whole seconds since the NTP epoch
    #[must_use]
    pub fn seconds(self) -> u32 {
        ((self.0 & SECONDS_MASK) >> 32) as u32
    }

    /// Fraction part in 1/2^32 second units
    #[must_use]
    pub fn fraction(self) -> u32 {
        (self.0 & SECONDS_FRAC_MASK) as u32
    }

    /// Converts the timestamp into an absolute UTC instant, truncating the fraction
    /// to whole nanoseconds
    #[must_use]
    pub fn to_datetime(self) -> DateTime<Utc> {
        let nanos = (u64::from(self.fraction()) * NSEC_IN_SEC) >> 32;

        ntp_epoch()
            + TimeDelta::seconds(i64::from(self.seconds()))
            + TimeDelta::nanoseconds(nanos as i64)
    }

    /// Converts an absolute instant into a timestamp. Seconds wrap modulo 2^32 and
    /// the fraction is rounded up to the next representable value.
    #[must_use]
    pub fn from_datetime(time: DateTime<Utc>) -> NtpTime {
        let nanos = total_nanos(time - ntp_epoch());
        let seconds = nanos.div_euclid(i128::from(NSEC_IN_SEC)) as u64;
        let subsec = nanos.rem_euclid(i128::from(NSEC_IN_SEC)) as u64;
        let fraction = ((subsec << 32) + NSEC_IN_SEC - 1) / NSEC_IN_SEC;

        NtpTime((seconds << 32) | fraction)
    }
}

impl From<u64> for NtpTime {
    fn from(v: u64) -> Self {
        NtpTime(v)
    }
}

impl From<DateTime<Utc>> for NtpTime {
    fn from(v: DateTime<Utc>) -> Self {
        NtpTime::from_datetime(v)
    }
}

impl From<NtpTime> for DateTime<Utc> {
    fn from(v: NtpTime) -> Self {
        v.to_datetime()
    }
}

/// The NTP epoch, `1900-01-01 00:00:00 UTC`
#[must_use]
pub fn ntp_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH - TimeDelta::seconds(NTP_TIMESTAMP_DELTA)
}

/// Converts a signed log2 seconds exponent (poll, precision) into a duration.
///
/// Positive exponents are clamped at 2^32 seconds.
#[must_use]
pub fn log2_interval(exp: i8) -> TimeDelta {
    if exp >= 0 {
        TimeDelta::seconds(1i64 << exp.min(MAX_INTERVAL_EXP))
    } else {
        let shift = exp.unsigned_abs().min(63);

        TimeDelta::nanoseconds((NSEC_IN_SEC as i64) >> shift)
    }
}

/// Exact signed nanosecond count of a duration
pub(crate) fn total_nanos(d: TimeDelta) -> i128 {
    i128::from(d.num_seconds()) * i128::from(NSEC_IN_SEC)
        + i128::from(d.subsec_nanos())
}
