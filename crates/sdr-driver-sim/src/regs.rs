//! Register map of the simulated FPGA and RF front end.
//!
//! Config space holds board-wide GPIO-style registers. RF space holds one
//! register per channel slot for each property, at `base + slot` where the
//! slot is `direction * 2 + index`. Trigger space uses
//! [`sdr_core::trigger::register_address`].

use sdr_core::{
    Channel, Direction, FpgaSize, GainMode, RxMux, Sampling, SmbMode, TuningMode, Xb,
};

/// Config space addresses.
pub mod config {
    /// One enable bit per channel slot.
    pub const ENABLE: u16 = 0x00;
    pub const RX_MUX: u16 = 0x01;
    pub const SMB_MODE: u16 = 0x02;
    pub const SMB_FREQ_INT: u16 = 0x03;
    pub const SMB_FREQ_NUM: u16 = 0x04;
    pub const SMB_FREQ_DEN: u16 = 0x05;
    pub const SAMPLING: u16 = 0x06;
    pub const TUNING_MODE: u16 = 0x07;
    pub const XB_SELECT: u16 = 0x08;
    pub const XB_GPIO: u16 = 0x09;
    /// Read-only: FPGA part fitted.
    pub const FPGA_SIZE: u16 = 0x0a;
}

/// RF space bases; add [`slot`] for the channel's register.
pub mod rf {
    pub const FREQUENCY: u16 = 0x100;
    pub const GAIN: u16 = 0x110;
    pub const GAIN_MODE: u16 = 0x120;
    pub const SAMPLE_RATE_INT: u16 = 0x130;
    pub const SAMPLE_RATE_NUM: u16 = 0x140;
    pub const SAMPLE_RATE_DEN: u16 = 0x150;
    pub const BANDWIDTH: u16 = 0x160;
    pub const BAND: u16 = 0x170;

    // Quick-tune encoding of the applied tune, LMS family.
    pub const QT_FREQSEL: u16 = 0x180;
    pub const QT_VCOCAP: u16 = 0x190;
    pub const QT_NINT: u16 = 0x1a0;
    pub const QT_NFRAC: u16 = 0x1b0;
    pub const QT_FLAGS: u16 = 0x1c0;

    // Quick-tune encoding of the applied tune, RFIC family.
    pub const QT_PROFILE: u16 = 0x1d0;
    pub const QT_RFFE: u16 = 0x1e0;
    /// `port | spdt << 8`
    pub const QT_PORT: u16 = 0x1f0;

    /// Four correction registers per slot at `CORRECTION + slot * 4`.
    pub const CORRECTION: u16 = 0x200;

    /// Firmware profile table; entry `n` holds the profile's frequency.
    pub const PROFILE: u16 = 0x400;
    pub const PROFILE_SLOTS: u16 = 64;
}

/// Register slot of `channel` (0..4).
pub fn slot(channel: Channel) -> u16 {
    let dir = match channel.direction() {
        Direction::Rx => 0,
        Direction::Tx => 1,
    };
    dir * 2 + u16::from(channel.index() & 1)
}

/// Address of `base`'s register for `channel`.
pub fn rf_addr(base: u16, channel: Channel) -> u16 {
    base + slot(channel)
}

/// Bit of `channel` in [`config::ENABLE`].
pub fn enable_bit(channel: Channel) -> u64 {
    1 << slot(channel)
}

/// Mask of every [`config::ENABLE`] bit belonging to `direction`.
pub fn enable_mask(direction: Direction) -> u64 {
    match direction {
        Direction::Rx => 0b0011,
        Direction::Tx => 0b1100,
    }
}

pub fn correction_addr(channel: Channel, index: u16) -> u16 {
    rf::CORRECTION + slot(channel) * 4 + index
}

/// Enum values stored in registers.
pub trait RegCode: Sized {
    fn to_reg(self) -> u64;
    fn from_reg(value: u64) -> Option<Self>;
}

macro_rules! reg_code {
    ($ty:ty { $($variant:path = $code:literal),+ $(,)? }) => {
        impl RegCode for $ty {
            fn to_reg(self) -> u64 {
                match self {
                    $($variant => $code,)+
                }
            }

            fn from_reg(value: u64) -> Option<Self> {
                match value {
                    $($code => Some($variant),)+
                    _ => None,
                }
            }
        }
    };
}

reg_code!(RxMux {
    RxMux::Baseband = 0,
    RxMux::Counter12Bit = 1,
    RxMux::Counter32Bit = 2,
    RxMux::DigitalLoopback = 4,
});

reg_code!(SmbMode {
    SmbMode::Disabled = 0,
    SmbMode::Output = 1,
    SmbMode::Input = 2,
    SmbMode::Unavailable = 3,
});

reg_code!(Sampling {
    Sampling::Unknown = 0,
    Sampling::Internal = 1,
    Sampling::External = 2,
});

reg_code!(TuningMode {
    TuningMode::Host = 0,
    TuningMode::Fpga = 1,
});

reg_code!(GainMode {
    GainMode::Default = 0,
    GainMode::Manual = 1,
    GainMode::FastAttackAgc = 2,
    GainMode::SlowAttackAgc = 3,
    GainMode::HybridAgc = 4,
});

reg_code!(Xb {
    Xb::None = 0,
    Xb::Xb100 = 1,
    Xb::Xb200 = 2,
    Xb::Xb300 = 3,
});

reg_code!(FpgaSize {
    FpgaSize::Unknown = 0,
    FpgaSize::Kle40 = 40,
    FpgaSize::Kle115 = 115,
    FpgaSize::A4 = 49,
    FpgaSize::A5 = 77,
    FpgaSize::A9 = 301,
});

/// Signed values are stored as their 32-bit two's complement.
pub fn encode_i32(value: i32) -> u64 {
    u64::from(value as u32)
}

pub fn decode_i32(value: u64) -> i32 {
    value as u32 as i32
}
