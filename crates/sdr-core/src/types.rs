//! Board-agnostic value types shared by the capability tables.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Channels
// =============================================================================

/// Sample flow direction of a channel or stream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Rx,
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "RX"),
            Direction::Tx => write!(f, "TX"),
        }
    }
}

/// One RF channel: a direction plus an index within that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Channel {
    direction: Direction,
    index: u8,
}

impl Channel {
    pub const RX0: Channel = Channel::rx(0);
    pub const RX1: Channel = Channel::rx(1);
    pub const TX0: Channel = Channel::tx(0);
    pub const TX1: Channel = Channel::tx(1);

    pub const fn rx(index: u8) -> Self {
        Self {
            direction: Direction::Rx,
            index,
        }
    }

    pub const fn tx(index: u8) -> Self {
        Self {
            direction: Direction::Tx,
            index,
        }
    }

    pub const fn direction(self) -> Direction {
        self.direction
    }

    pub const fn index(self) -> u8 {
        self.index
    }

    pub fn is_rx(self) -> bool {
        self.direction == Direction::Rx
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.direction, self.index)
    }
}

/// Channel arrangement of a stream. All layouts of one direction share the
/// same transport endpoint, so at most one stream per direction is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
    RxX1,
    TxX1,
    RxX2,
    TxX2,
}

impl ChannelLayout {
    pub fn direction(self) -> Direction {
        match self {
            ChannelLayout::RxX1 | ChannelLayout::RxX2 => Direction::Rx,
            ChannelLayout::TxX1 | ChannelLayout::TxX2 => Direction::Tx,
        }
    }

    /// Number of interleaved channels carried by the stream.
    pub fn channel_count(self) -> usize {
        match self {
            ChannelLayout::RxX1 | ChannelLayout::TxX1 => 1,
            ChannelLayout::RxX2 | ChannelLayout::TxX2 => 2,
        }
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChannelLayout::RxX1 => "RX_X1",
            ChannelLayout::TxX1 => "TX_X1",
            ChannelLayout::RxX2 => "RX_X2",
            ChannelLayout::TxX2 => "TX_X2",
        };
        write!(f, "{}", label)
    }
}

// =============================================================================
// Sample formats
// =============================================================================

/// Wire format of stream samples.
///
/// `*Meta` variants carry timestamp metadata; the sync interface only
/// reports or honors [`crate::Metadata`] when one of them is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// 16-bit I/Q pairs, Q11 fixed point.
    #[default]
    Sc16Q11,
    /// [`SampleFormat::Sc16Q11`] with timestamp metadata.
    Sc16Q11Meta,
    /// 8-bit I/Q pairs, Q7 fixed point.
    Sc8Q7,
    /// [`SampleFormat::Sc8Q7`] with timestamp metadata.
    Sc8Q7Meta,
}

impl SampleFormat {
    /// Bytes occupied by one complex sample.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Sc16Q11 | SampleFormat::Sc16Q11Meta => 4,
            SampleFormat::Sc8Q7 | SampleFormat::Sc8Q7Meta => 2,
        }
    }

    pub fn has_metadata(self) -> bool {
        matches!(self, SampleFormat::Sc16Q11Meta | SampleFormat::Sc8Q7Meta)
    }
}

// =============================================================================
// Properties
// =============================================================================

/// Exact sample or clock rate as `integer + num/den` Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RationalRate {
    pub integer: u64,
    pub num: u64,
    pub den: u64,
}

impl RationalRate {
    pub fn from_integer(integer: u64) -> Self {
        Self {
            integer,
            num: 0,
            den: 1,
        }
    }

    /// Nearest whole rate in Hz (fraction rounded half up).
    pub fn rounded(&self) -> u64 {
        if self.den == 0 {
            return self.integer;
        }
        self.integer + (self.num * 2 + self.den) / (self.den * 2)
    }

    /// Reduce `num/den` so that `num < den` and the fraction is in lowest terms.
    pub fn normalized(self) -> Self {
        if self.den == 0 {
            return self;
        }
        let integer = self.integer + self.num / self.den;
        let num = self.num % self.den;
        let g = gcd(num, self.den).max(1);
        Self {
            integer,
            num: num / g,
            den: self.den / g,
        }
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl fmt::Display for RationalRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{} Hz", self.integer, self.num, self.den)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainMode {
    Default,
    Manual,
    FastAttackAgc,
    SlowAttackAgc,
    HybridAgc,
}

/// IQ imbalance / DC offset correction knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correction {
    DcOffsetI,
    DcOffsetQ,
    Phase,
    Gain,
}

impl Correction {
    /// Inclusive range accepted by the hardware.
    pub fn range(self) -> (i16, i16) {
        match self {
            Correction::DcOffsetI | Correction::DcOffsetQ => (-2048, 2047),
            Correction::Phase | Correction::Gain => (-4096, 4096),
        }
    }
}

/// Role of the SMB reference-clock connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmbMode {
    Disabled,
    Output,
    Input,
    Unavailable,
}

/// ADC sampling path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    Unknown,
    Internal,
    External,
}

/// Source multiplexed into the RX sample FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RxMux {
    Baseband,
    Counter12Bit,
    Counter32Bit,
    DigitalLoopback,
}

/// Where RF tuning computations execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningMode {
    Host,
    Fpga,
}

/// Expansion board identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Xb {
    None,
    Xb100,
    Xb200,
    Xb300,
}

impl fmt::Display for Xb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Xb::None => "none",
            Xb::Xb100 => "XB-100",
            Xb::Xb200 => "XB-200",
            Xb::Xb300 => "XB-300",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FpgaSize {
    Unknown,
    Kle40,
    Kle115,
    A4,
    A5,
    A9,
}

/// Negotiated bus speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevSpeed {
    Unknown,
    High,
    Super,
}

/// Firmware or FPGA version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub describe: String,
}

impl Version {
    pub fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
            describe: format!("{}.{}.{}", major, minor, patch),
        }
    }

    /// `true` when `self` is at least `major.minor.patch`.
    pub fn at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe)
    }
}

bitflags! {
    /// Feature bits a board driver reports through `get_capabilities`.
    ///
    /// The device handle consults these before dispatching feature-gated
    /// entries so that a missing feature surfaces as "unsupported" without
    /// touching the board.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u64 {
        const TIMESTAMPS       = 1 << 0;
        const SCHEDULED_RETUNE = 1 << 1;
        const QUICK_TUNE       = 1 << 2;
        const TRIGGERS         = 1 << 3;
        const FPGA_TUNING      = 1 << 4;
        const EXPANSION        = 1 << 5;
        const SMB_CLOCK        = 1 << 6;
        const MIMO             = 1 << 7;
        const RX_MUX           = 1 << 8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_display() {
        assert_eq!(Channel::RX0.to_string(), "RX0");
        assert_eq!(Channel::tx(1).to_string(), "TX1");
        assert!(Channel::RX1.is_rx());
        assert_eq!(Channel::TX0.direction(), Direction::Tx);
    }

    #[test]
    fn test_layout_direction() {
        assert_eq!(ChannelLayout::RxX2.direction(), Direction::Rx);
        assert_eq!(ChannelLayout::TxX1.direction(), Direction::Tx);
        assert_eq!(ChannelLayout::TxX2.channel_count(), 2);
    }

    #[test]
    fn test_rational_rate() {
        let rate = RationalRate {
            integer: 1_000_000,
            num: 3,
            den: 2,
        };
        let norm = rate.normalized();
        assert_eq!(norm.integer, 1_000_001);
        assert_eq!(norm.num, 1);
        assert_eq!(norm.den, 2);
        assert_eq!(norm.rounded(), 1_000_002);

        let rate = RationalRate {
            integer: 10,
            num: 2,
            den: 8,
        };
        assert_eq!(rate.normalized().den, 4);
        assert_eq!(rate.rounded(), 10);
    }

    #[test]
    fn test_version_ordering() {
        let v = Version::new(2, 4, 0);
        assert!(v.at_least(2, 3, 9));
        assert!(!v.at_least(2, 4, 1));
        assert_eq!(v.to_string(), "2.4.0");
    }
}
