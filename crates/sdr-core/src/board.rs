//! Board driver capability table.
//!
//! A [`BoardDriver`] implements one hardware revision's semantics (tuning,
//! gain, sample rate, trigger electrical protocol, retune resolution,
//! stream construction) on top of a [`TransportBackend`]. The device handle
//! owns exactly one driver and calls it with the control lock held, so every
//! entry takes `&mut self`.
//!
//! Every entry has a default body that reports [`SdrError::Unsupported`];
//! a board overrides exactly the entries its hardware provides. The device
//! handle never needs to know which ones those are.

use crate::devinfo::DevInfo;
use crate::error::{Result, SdrError};
use crate::retune::QuickTune;
use crate::stream::{StreamCallback, StreamConfig, Stream, SyncStream};
use crate::transport::TransportBackend;
use crate::trigger::{Trigger, TriggerSignal, TriggerState};
use crate::types::{
    Capabilities, Channel, ChannelLayout, Correction, DevSpeed, Direction, FpgaSize, GainMode,
    RationalRate, RxMux, Sampling, SmbMode, TuningMode, Version, Xb,
};
use std::sync::Arc;
use std::time::Duration;

/// Generates default bodies for the entries every board may leave out.
macro_rules! unsupported {
    ($self:ident, $op:literal) => {
        Err(SdrError::unsupported($op, $self.name()))
    };
}

/// Board-specific operations for one open device.
#[allow(unused_variables)]
pub trait BoardDriver: Send {
    /// Board family name used in logs and errors.
    fn name(&self) -> &str;

    /// Release board state. Called once, after streams are drained.
    fn close(&mut self) -> Result<()>;

    // =========================================================================
    // Identity and housekeeping
    // =========================================================================

    fn get_capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn device_speed(&mut self) -> Result<DevSpeed> {
        unsupported!(self, "device_speed")
    }

    fn get_serial(&mut self) -> Result<String> {
        unsupported!(self, "get_serial")
    }

    fn get_fpga_size(&mut self) -> Result<FpgaSize> {
        unsupported!(self, "get_fpga_size")
    }

    fn is_fpga_configured(&mut self) -> Result<bool> {
        unsupported!(self, "is_fpga_configured")
    }

    fn get_fpga_version(&mut self) -> Result<Version> {
        unsupported!(self, "get_fpga_version")
    }

    fn get_fw_version(&mut self) -> Result<Version> {
        unsupported!(self, "get_fw_version")
    }

    fn enable_module(&mut self, channel: Channel, enable: bool) -> Result<()> {
        unsupported!(self, "enable_module")
    }

    // =========================================================================
    // Gain
    // =========================================================================

    fn set_gain(&mut self, channel: Channel, gain_db: i32) -> Result<()> {
        unsupported!(self, "set_gain")
    }

    fn get_gain(&mut self, channel: Channel) -> Result<i32> {
        unsupported!(self, "get_gain")
    }

    fn set_gain_mode(&mut self, channel: Channel, mode: GainMode) -> Result<()> {
        unsupported!(self, "set_gain_mode")
    }

    fn get_gain_mode(&mut self, channel: Channel) -> Result<GainMode> {
        unsupported!(self, "get_gain_mode")
    }

    // =========================================================================
    // Sample rate and bandwidth
    // =========================================================================

    /// Returns the rate actually applied.
    fn set_sample_rate(&mut self, channel: Channel, rate: u32) -> Result<u32> {
        unsupported!(self, "set_sample_rate")
    }

    fn get_sample_rate(&mut self, channel: Channel) -> Result<u32> {
        unsupported!(self, "get_sample_rate")
    }

    fn set_rational_sample_rate(
        &mut self,
        channel: Channel,
        rate: RationalRate,
    ) -> Result<RationalRate> {
        unsupported!(self, "set_rational_sample_rate")
    }

    fn get_rational_sample_rate(&mut self, channel: Channel) -> Result<RationalRate> {
        unsupported!(self, "get_rational_sample_rate")
    }

    /// Returns the bandwidth actually applied.
    fn set_bandwidth(&mut self, channel: Channel, bandwidth: u32) -> Result<u32> {
        unsupported!(self, "set_bandwidth")
    }

    fn get_bandwidth(&mut self, channel: Channel) -> Result<u32> {
        unsupported!(self, "get_bandwidth")
    }

    // =========================================================================
    // Frequency and scheduled tuning
    // =========================================================================

    fn set_frequency(&mut self, channel: Channel, frequency: u64) -> Result<()> {
        unsupported!(self, "set_frequency")
    }

    fn get_frequency(&mut self, channel: Channel) -> Result<u64> {
        unsupported!(self, "get_frequency")
    }

    fn select_band(&mut self, channel: Channel, frequency: u64) -> Result<()> {
        unsupported!(self, "select_band")
    }

    /// Resolved tuning parameters of the channel's current frequency.
    fn get_quick_tune(&mut self, channel: Channel) -> Result<QuickTune> {
        unsupported!(self, "get_quick_tune")
    }

    /// Queue a retune at device `timestamp`. A supplied quick tune is used
    /// verbatim; otherwise parameters are resolved from `frequency`.
    fn schedule_retune(
        &mut self,
        channel: Channel,
        timestamp: u64,
        frequency: u64,
        quick_tune: Option<&QuickTune>,
    ) -> Result<()> {
        unsupported!(self, "schedule_retune")
    }

    /// Remove every unapplied retune for `channel`; returns how many.
    fn cancel_scheduled_retunes(&mut self, channel: Channel) -> Result<usize> {
        unsupported!(self, "cancel_scheduled_retunes")
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Prepare the hardware for `signal` on `channel`'s direction.
    fn trigger_init(&mut self, channel: Channel, signal: TriggerSignal) -> Result<()> {
        unsupported!(self, "trigger_init")
    }

    /// Arm or disarm. Reserved values are passed through and never rejected.
    fn trigger_arm(&mut self, trigger: &Trigger, arm: bool, resv1: u64, resv2: u64) -> Result<()> {
        unsupported!(self, "trigger_arm")
    }

    fn trigger_fire(&mut self, trigger: &Trigger) -> Result<()> {
        unsupported!(self, "trigger_fire")
    }

    fn trigger_state(&mut self, trigger: &Trigger) -> Result<TriggerState> {
        unsupported!(self, "trigger_state")
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    fn init_stream(
        &mut self,
        layout: ChannelLayout,
        config: StreamConfig,
        callback: Box<dyn StreamCallback>,
    ) -> Result<Stream> {
        unsupported!(self, "init_stream")
    }

    fn sync_config(&mut self, layout: ChannelLayout, config: StreamConfig) -> Result<SyncStream> {
        unsupported!(self, "sync_config")
    }

    fn set_stream_timeout(&mut self, direction: Direction, timeout: Duration) -> Result<()> {
        unsupported!(self, "set_stream_timeout")
    }

    fn get_stream_timeout(&mut self, direction: Direction) -> Result<Duration> {
        unsupported!(self, "get_stream_timeout")
    }

    /// Free-running sample counter, readable whether or not a stream runs.
    fn get_timestamp(&mut self, direction: Direction) -> Result<u64> {
        unsupported!(self, "get_timestamp")
    }

    // =========================================================================
    // SMB clock
    // =========================================================================

    fn get_smb_mode(&mut self) -> Result<SmbMode> {
        unsupported!(self, "get_smb_mode")
    }

    fn set_smb_mode(&mut self, mode: SmbMode) -> Result<()> {
        unsupported!(self, "set_smb_mode")
    }

    fn get_smb_frequency(&mut self) -> Result<u32> {
        unsupported!(self, "get_smb_frequency")
    }

    fn set_smb_frequency(&mut self, frequency: u32) -> Result<u32> {
        unsupported!(self, "set_smb_frequency")
    }

    fn get_rational_smb_frequency(&mut self) -> Result<RationalRate> {
        unsupported!(self, "get_rational_smb_frequency")
    }

    fn set_rational_smb_frequency(&mut self, rate: RationalRate) -> Result<RationalRate> {
        unsupported!(self, "set_rational_smb_frequency")
    }

    // =========================================================================
    // Corrections and misc modes
    // =========================================================================

    fn get_correction(&mut self, channel: Channel, correction: Correction) -> Result<i16> {
        unsupported!(self, "get_correction")
    }

    fn set_correction(&mut self, channel: Channel, correction: Correction, value: i16) -> Result<()> {
        unsupported!(self, "set_correction")
    }

    fn get_sampling(&mut self) -> Result<Sampling> {
        unsupported!(self, "get_sampling")
    }

    fn set_sampling(&mut self, sampling: Sampling) -> Result<()> {
        unsupported!(self, "set_sampling")
    }

    fn get_rx_mux(&mut self) -> Result<RxMux> {
        unsupported!(self, "get_rx_mux")
    }

    fn set_rx_mux(&mut self, mux: RxMux) -> Result<()> {
        unsupported!(self, "set_rx_mux")
    }

    fn get_tuning_mode(&mut self) -> Result<TuningMode> {
        unsupported!(self, "get_tuning_mode")
    }

    fn set_tuning_mode(&mut self, mode: TuningMode) -> Result<()> {
        unsupported!(self, "set_tuning_mode")
    }

    // =========================================================================
    // Images
    // =========================================================================

    fn load_fpga(&mut self, image: &[u8]) -> Result<()> {
        unsupported!(self, "load_fpga")
    }

    fn flash_fpga(&mut self, image: &[u8]) -> Result<()> {
        unsupported!(self, "flash_fpga")
    }

    fn erase_stored_fpga(&mut self) -> Result<()> {
        unsupported!(self, "erase_stored_fpga")
    }

    fn flash_firmware(&mut self, image: &[u8]) -> Result<()> {
        unsupported!(self, "flash_firmware")
    }

    fn device_reset(&mut self) -> Result<()> {
        unsupported!(self, "device_reset")
    }

    // =========================================================================
    // Expansion boards
    // =========================================================================

    fn expansion_attach(&mut self, xb: Xb) -> Result<()> {
        unsupported!(self, "expansion_attach")
    }

    fn expansion_get_attached(&mut self) -> Result<Xb> {
        unsupported!(self, "expansion_get_attached")
    }

    /// Power down an attached expansion board before close.
    fn expansion_detach(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds board drivers for the devices it recognizes.
pub trait BoardFactory: Send + Sync {
    fn name(&self) -> &str;

    /// `true` if this board family drives `info`'s hardware.
    fn matches(&self, info: &DevInfo) -> bool;

    /// Bind a driver to an opened backend.
    fn open(&self, backend: Arc<dyn TransportBackend>, info: &DevInfo) -> Result<Box<dyn BoardDriver>>;
}
