//! Control-plane properties, forwarded to the board under the control lock.

use super::Device;
use sdr_core::{
    Capabilities, Channel, Correction, DevSpeed, FpgaSize, GainMode, RationalRate, Result, RxMux,
    Sampling, SdrError, SmbMode, TuningMode, Version,
};

/// `pub fn name(&self, args..) -> Result<T>` calling the board entry of the
/// same name, optionally gated on a capability.
macro_rules! forward {
    ($(#[$meta:meta])* $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        $(#[$meta])*
        pub fn $name(&self, $($arg: $ty),*) -> Result<$ret> {
            self.with_board(stringify!($name), |board| board.$name($($arg),*))
        }
    };
    ($(#[$meta:meta])* [$cap:ident] $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        $(#[$meta])*
        pub fn $name(&self, $($arg: $ty),*) -> Result<$ret> {
            self.with_capability(stringify!($name), Capabilities::$cap, |bound| {
                bound.board.$name($($arg),*)
            })
        }
    };
}

impl Device {
    // =========================================================================
    // Identity and versions
    // =========================================================================

    forward!(device_speed() -> DevSpeed);
    forward!(get_serial() -> String);
    forward!(get_fpga_size() -> FpgaSize);
    forward!(is_fpga_configured() -> bool);
    forward!(get_fpga_version() -> Version);
    forward!(get_fw_version() -> Version);

    /// Features the board currently offers. Can change after
    /// [`Device::load_fpga`] or [`Device::device_reset`].
    pub fn get_capabilities(&self) -> Result<Capabilities> {
        self.with_board("get_capabilities", |board| Ok(board.get_capabilities()))
    }

    forward!(
        /// Power a channel's RF chain up or down. Streams on a disabled
        /// channel do not move samples.
        enable_module(channel: Channel, enable: bool) -> ()
    );

    // =========================================================================
    // RF
    // =========================================================================

    forward!(
        /// Out-of-range gains are clamped by the board.
        set_gain(channel: Channel, gain_db: i32) -> ()
    );
    forward!(get_gain(channel: Channel) -> i32);
    forward!(set_gain_mode(channel: Channel, mode: GainMode) -> ());
    forward!(get_gain_mode(channel: Channel) -> GainMode);

    forward!(
        /// Returns the rate actually applied, rounded to an integer.
        set_sample_rate(channel: Channel, rate: u32) -> u32
    );
    forward!(get_sample_rate(channel: Channel) -> u32);
    forward!(set_rational_sample_rate(channel: Channel, rate: RationalRate) -> RationalRate);
    forward!(get_rational_sample_rate(channel: Channel) -> RationalRate);

    forward!(
        /// Returns the filter bandwidth actually selected.
        set_bandwidth(channel: Channel, bandwidth: u32) -> u32
    );
    forward!(get_bandwidth(channel: Channel) -> u32);

    forward!(set_frequency(channel: Channel, frequency: u64) -> ());
    forward!(get_frequency(channel: Channel) -> u64);
    forward!(select_band(channel: Channel, frequency: u64) -> ());

    forward!(get_correction(channel: Channel, correction: Correction) -> i16);
    forward!(set_correction(channel: Channel, correction: Correction, value: i16) -> ());

    // =========================================================================
    // Board-wide modes
    // =========================================================================

    forward!([SMB_CLOCK] get_smb_mode() -> SmbMode);
    forward!([SMB_CLOCK] set_smb_mode(mode: SmbMode) -> ());
    forward!([SMB_CLOCK] get_smb_frequency() -> u32);
    forward!([SMB_CLOCK] set_smb_frequency(frequency: u32) -> u32);
    forward!([SMB_CLOCK] get_rational_smb_frequency() -> RationalRate);
    forward!([SMB_CLOCK] set_rational_smb_frequency(rate: RationalRate) -> RationalRate);

    forward!(get_sampling() -> Sampling);
    forward!(set_sampling(sampling: Sampling) -> ());

    forward!([RX_MUX] get_rx_mux() -> RxMux);
    forward!([RX_MUX] set_rx_mux(mux: RxMux) -> ());

    forward!(get_tuning_mode() -> TuningMode);
    forward!(set_tuning_mode(mode: TuningMode) -> ());

    // =========================================================================
    // Images and reset
    // =========================================================================

    forward!(
        /// Load an FPGA bitstream into the running device. Capabilities are
        /// re-read afterwards.
        load_fpga(image: &[u8]) -> ()
    );
    forward!(
        /// Store an FPGA bitstream for autoload at power-up.
        flash_fpga(image: &[u8]) -> ()
    );
    forward!(erase_stored_fpga() -> ());
    forward!(flash_firmware(image: &[u8]) -> ());

    /// Reset the device to power-on state.
    ///
    /// Refused while a stream is active. Trigger bindings and the attached
    /// expansion board do not survive a reset.
    pub fn device_reset(&self) -> Result<()> {
        self.with_bound("device_reset", |bound| {
            if let Some(direction) = self.inner.streams.lock().active_direction() {
                return Err(SdrError::invalid_state(
                    "device_reset",
                    format!("{} stream is active", direction),
                ));
            }
            bound.board.device_reset()?;
            bound.triggers.clear();
            bound.xb = sdr_core::Xb::None;
            Ok(())
        })
    }
}
