//! NTP packet header and its 48-byte wire representation
use core::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};

use crate::timestamp::{NtpShortTime, NtpTime};
use crate::types::{Error, ReferenceId, Result, Version};

/// NTP mode value bit mask
pub(crate) const MODE_MASK: u8 = 0b0000_0111;
/// NTP mode bit mask shift value
pub(crate) const MODE_SHIFT: u8 = 0;
/// NTP version value bit mask
pub(crate) const VERSION_MASK: u8 = 0b0011_1000;
/// NTP version bit mask shift value
pub(crate) const VERSION_SHIFT: u8 = 3;
/// NTP LI (leap indicator) bit mask value
pub(crate) const LI_MASK: u8 = 0b1100_0000;
/// NTP LI bit mask shift value
pub(crate) const LI_SHIFT: u8 = 6;

/// Size of the NTP header without extension fields
pub const NTP_PACKET_SIZE: usize = 48;

/// Leap second warning carried in the two top bits of the first header byte
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum LeapIndicator {
    /// No leap second pending
    #[default]
    NoWarning,
    /// Last minute of the day has 61 seconds
    AddSecond,
    /// Last minute of the day has 59 seconds
    DelSecond,
    /// Clock is not synchronized
    NotInSync,
}

impl LeapIndicator {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => LeapIndicator::NoWarning,
            1 => LeapIndicator::AddSecond,
            2 => LeapIndicator::DelSecond,
            _ => LeapIndicator::NotInSync,
        }
    }

    fn bits(self) -> u8 {
        match self {
            LeapIndicator::NoWarning => 0,
            LeapIndicator::AddSecond => 1,
            LeapIndicator::DelSecond => 2,
            LeapIndicator::NotInSync => 3,
        }
    }
}

impl Display for LeapIndicator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeapIndicator::NoWarning => "no warning",
            LeapIndicator::AddSecond => "insert second",
            LeapIndicator::DelSecond => "delete second",
            LeapIndicator::NotInSync => "not in sync",
        };

        write!(f, "{s}")
    }
}

/// Association mode, the low three bits of the first header byte
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Mode {
    Reserved,
    SymmetricActive,
    SymmetricPassive,
    Client,
    Server,
    Broadcast,
    Control,
    Private,
}

impl Mode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0 => Mode::Reserved,
            1 => Mode::SymmetricActive,
            2 => Mode::SymmetricPassive,
            3 => Mode::Client,
            4 => Mode::Server,
            5 => Mode::Broadcast,
            6 => Mode::Control,
            _ => Mode::Private,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Mode::Reserved => 0,
            Mode::SymmetricActive => 1,
            Mode::SymmetricPassive => 2,
            Mode::Client => 3,
            Mode::Server => 4,
            Mode::Broadcast => 5,
            Mode::Control => 6,
            Mode::Private => 7,
        }
    }
}

/// Decoded NTP header
///
/// `version` holds the raw 3-bit field since a reply may carry any value there.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NtpPacket {
    pub leap: LeapIndicator,
    pub version: u8,
    pub mode: Mode,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: NtpShortTime,
    pub root_dispersion: NtpShortTime,
    pub reference_id: ReferenceId,
    pub reference_timestamp: NtpTime,
    pub origin_timestamp: NtpTime,
    pub receive_timestamp: NtpTime,
    pub transmit_timestamp: NtpTime,
}

impl NtpPacket {
    /// Builds a client request stamped with `now` as its transmit timestamp.
    /// Every other field is zero.
    #[must_use]
    pub fn request(version: Version, now: DateTime<Utc>) -> NtpPacket {
        NtpPacket {
            leap: LeapIndicator::NoWarning,
            version: version.into(),
            mode: Mode::Client,
            stratum: 0,
            poll: 0,
            precision: 0,
            root_delay: NtpShortTime::default(),
            root_dispersion: NtpShortTime::default(),
            reference_id: ReferenceId::default(),
            reference_timestamp: NtpTime::default(),
            origin_timestamp: NtpTime::default(),
            receive_timestamp: NtpTime::default(),
            transmit_timestamp: NtpTime::from(now),
        }
    }

    /// Parses a received payload. No semantic checks are done on the fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPacket`] unless `buf` is exactly
    /// [`NTP_PACKET_SIZE`] bytes long
    pub fn from_bytes(buf: &[u8]) -> Result<NtpPacket> {
        let raw: &[u8; NTP_PACKET_SIZE] = buf
            .try_into()
            .map_err(|_| Error::MalformedPacket(buf.len()))?;

        Ok(NtpPacket::from(&RawNtpPacket(*raw)))
    }

    /// Serializes the header into its wire form
    #[must_use]
    pub fn to_bytes(&self) -> RawNtpPacket {
        RawNtpPacket::from(self)
    }

    pub(crate) fn li_vn_mode(&self) -> u8 {
        (self.leap.bits() << LI_SHIFT)
            | ((self.version << VERSION_SHIFT) & VERSION_MASK)
            | (self.mode.bits() << MODE_SHIFT)
    }
}

/// Wire form of [`NtpPacket`], big-endian
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RawNtpPacket(pub [u8; NTP_PACKET_SIZE]);

impl Default for RawNtpPacket {
    fn default() -> Self {
        RawNtpPacket([0u8; NTP_PACKET_SIZE])
    }
}

impl AsRef<[u8]> for RawNtpPacket {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&RawNtpPacket> for NtpPacket {
    #[allow(clippy::cast_possible_wrap)]
    fn from(val: &RawNtpPacket) -> Self {
        let b = &val.0;
        let u32_at = |at: usize| {
            u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
        };
        let u64_at =
            |at: usize| (u64::from(u32_at(at)) << 32) | u64::from(u32_at(at + 4));

        NtpPacket {
            leap: LeapIndicator::from_bits(shifter(b[0], LI_MASK, LI_SHIFT)),
            version: shifter(b[0], VERSION_MASK, VERSION_SHIFT),
            mode: Mode::from_bits(shifter(b[0], MODE_MASK, MODE_SHIFT)),
            stratum: b[1],
            poll: b[2] as i8,
            precision: b[3] as i8,
            root_delay: NtpShortTime(u32_at(4)),
            root_dispersion: NtpShortTime(u32_at(8)),
            reference_id: ReferenceId(u32_at(12)),
            reference_timestamp: NtpTime(u64_at(16)),
            origin_timestamp: NtpTime(u64_at(24)),
            receive_timestamp: NtpTime(u64_at(32)),
            transmit_timestamp: NtpTime(u64_at(40)),
        }
    }
}

impl From<&NtpPacket> for RawNtpPacket {
    #[allow(clippy::cast_sign_loss)]
    fn from(val: &NtpPacket) -> Self {
        let mut tmp_buf = [0u8; NTP_PACKET_SIZE];

        tmp_buf[0] = val.li_vn_mode();
        tmp_buf[1] = val.stratum;
        tmp_buf[2] = val.poll as u8;
        tmp_buf[3] = val.precision as u8;
        tmp_buf[4..8].copy_from_slice(&val.root_delay.0.to_be_bytes());
        tmp_buf[8..12].copy_from_slice(&val.root_dispersion.0.to_be_bytes());
        tmp_buf[12..16].copy_from_slice(&val.reference_id.0.to_be_bytes());
        tmp_buf[16..24]
            .copy_from_slice(&val.reference_timestamp.0.to_be_bytes());
        tmp_buf[24..32].copy_from_slice(&val.origin_timestamp.0.to_be_bytes());
        tmp_buf[32..40]
            .copy_from_slice(&val.receive_timestamp.0.to_be_bytes());
        tmp_buf[40..48]
            .copy_from_slice(&val.transmit_timestamp.0.to_be_bytes());

        RawNtpPacket(tmp_buf)
    }
}

/// Encodes a client request for `version` stamped with `now`
#[must_use]
pub fn encode_request(version: Version, now: DateTime<Utc>) -> RawNtpPacket {
    NtpPacket::request(version, now).to_bytes()
}

/// Decodes a server reply
///
/// # Errors
///
/// Returns [`Error::MalformedPacket`] if `buf` is not a 48-byte frame
pub fn decode_response(buf: &[u8]) -> Result<NtpPacket> {
    NtpPacket::from_bytes(buf)
}

fn shifter(val: u8, mask: u8, shift: u8) -> u8 {
    (val & mask) >> shift
}
