//! Dual-channel board with an RFIC transceiver.
//!
//! Tuning goes through the RFIC firmware's profile table: every tune is
//! stored in a profile slot first and then selected, so a scheduled
//! retune only needs to carry the slot ([`QuickTune::Rfic`]). There is no
//! SMB clock, sampling selection or expansion header on this board.

use super::common::{fpga_capabilities, BoardCore};
use crate::hardware::SimProduct;
use crate::regs::{rf, RegCode};
use sdr_core::{
    BoardDriver, BoardFactory, Capabilities, Channel, ChannelLayout, Correction, DevInfo,
    DevSpeed, Direction, FpgaSize, GainMode, QuickTune, RationalRate, RegisterSpace, Result,
    RficQuickTune, RxMux, SdrError, Stream, StreamCallback, StreamConfig, SyncStream,
    TransportBackend, Trigger, TriggerSignal, TriggerState, TuningMode, Version,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const NAME: &str = "sim-rev2";

const FREQUENCY_MIN: u64 = 70_000_000;
const FREQUENCY_MAX: u64 = 6_000_000_000;
/// RF port B above this frequency.
const PORT_CROSSOVER: u64 = 3_000_000_000;

const SAMPLE_RATE_RANGE: (u64, u64) = (520_834, 61_440_000);
const BANDWIDTH_RANGE: (u32, u32) = (200_000, 56_000_000);
const RX_GAIN_RANGE: (i32, i32) = (0, 60);
const TX_GAIN_RANGE: (i32, i32) = (-89, 0);

/// Board driver for [`SimProduct::Rev2`] devices.
pub struct Rev2Board {
    core: BoardCore,
    caps: Capabilities,
    next_profile: u16,
}

impl Rev2Board {
    pub fn open(backend: Arc<dyn TransportBackend>, info: &DevInfo) -> Result<Self> {
        let core = BoardCore::new(NAME, backend, info);
        let version = core.loaded_fpga_version()?;
        let caps = Self::capabilities_for(version.as_ref());
        info!(
            board = NAME,
            serial = %core.info.serial,
            fpga = ?version.as_ref().map(ToString::to_string),
            capabilities = ?caps,
            "Board attached"
        );
        Ok(Self {
            core,
            caps,
            next_profile: 0,
        })
    }

    fn capabilities_for(version: Option<&Version>) -> Capabilities {
        Capabilities::QUICK_TUNE | Capabilities::MIMO | Capabilities::RX_MUX | fpga_capabilities(version)
    }

    fn check_channel(&self, channel: Channel) -> Result<()> {
        if channel.index() > 1 {
            return Err(SdrError::invalid_argument(
                "channel",
                format!("{} has no channel {}", NAME, channel),
            ));
        }
        Ok(())
    }

    fn check_frequency(frequency: u64) -> Result<()> {
        if !(FREQUENCY_MIN..=FREQUENCY_MAX).contains(&frequency) {
            return Err(SdrError::invalid_argument(
                "set_frequency",
                format!(
                    "{} Hz is outside {}..={} Hz",
                    frequency, FREQUENCY_MIN, FREQUENCY_MAX
                ),
            ));
        }
        Ok(())
    }

    /// Store `frequency` in the next free profile slot.
    fn store_profile(&mut self, frequency: u64) -> Result<RficQuickTune> {
        Self::check_frequency(frequency)?;
        let slot = self.next_profile;
        self.next_profile = (slot + 1) % rf::PROFILE_SLOTS;
        self.core
            .backend
            .register_write(RegisterSpace::RfFrontEnd, rf::PROFILE + slot, frequency)?;
        let port = u8::from(frequency > PORT_CROSSOVER);
        Ok(RficQuickTune {
            nios_profile: slot,
            rffe_profile: slot as u8,
            port,
            spdt: port,
        })
    }

    fn write_tune(&self, channel: Channel, qt: &RficQuickTune, frequency: u64) -> Result<()> {
        let core = &self.core;
        core.rf_write(rf::QT_PROFILE, channel, u64::from(qt.nios_profile))?;
        core.rf_write(rf::QT_RFFE, channel, u64::from(qt.rffe_profile))?;
        core.rf_write(
            rf::QT_PORT,
            channel,
            u64::from(qt.port) | u64::from(qt.spdt) << 8,
        )?;
        core.rf_write(rf::FREQUENCY, channel, frequency)
    }
}

impl BoardDriver for Rev2Board {
    fn name(&self) -> &str {
        NAME
    }

    fn close(&mut self) -> Result<()> {
        self.core.close()
    }

    fn get_capabilities(&self) -> Capabilities {
        self.caps
    }

    fn device_speed(&mut self) -> Result<DevSpeed> {
        self.core.device_speed()
    }

    fn get_serial(&mut self) -> Result<String> {
        self.core.serial()
    }

    fn get_fpga_size(&mut self) -> Result<FpgaSize> {
        self.core.fpga_size()
    }

    fn is_fpga_configured(&mut self) -> Result<bool> {
        self.core.backend.is_fpga_configured()
    }

    fn get_fpga_version(&mut self) -> Result<Version> {
        self.core.backend.get_fpga_version()
    }

    fn get_fw_version(&mut self) -> Result<Version> {
        self.core.backend.get_fw_version()
    }

    fn enable_module(&mut self, channel: Channel, enable: bool) -> Result<()> {
        self.check_channel(channel)?;
        self.core.enable_module(channel, enable)
    }

    fn set_gain(&mut self, channel: Channel, gain_db: i32) -> Result<()> {
        self.check_channel(channel)?;
        let range = match channel.direction() {
            Direction::Rx => RX_GAIN_RANGE,
            Direction::Tx => TX_GAIN_RANGE,
        };
        self.core.set_gain(channel, gain_db, range)
    }

    fn get_gain(&mut self, channel: Channel) -> Result<i32> {
        self.check_channel(channel)?;
        self.core.get_gain(channel)
    }

    fn set_gain_mode(&mut self, channel: Channel, mode: GainMode) -> Result<()> {
        self.check_channel(channel)?;
        if channel.direction() == Direction::Tx {
            return Err(SdrError::unsupported("TX gain modes", NAME));
        }
        self.core.rf_write(rf::GAIN_MODE, channel, mode.to_reg())?;
        debug!(board = NAME, channel = %channel, mode = ?mode, "Gain mode set");
        Ok(())
    }

    fn get_gain_mode(&mut self, channel: Channel) -> Result<GainMode> {
        self.check_channel(channel)?;
        if channel.direction() == Direction::Tx {
            return Err(SdrError::unsupported("TX gain modes", NAME));
        }
        let raw = self.core.rf_read(rf::GAIN_MODE, channel)?;
        Ok(GainMode::from_reg(raw).unwrap_or(GainMode::Default))
    }

    fn set_sample_rate(&mut self, channel: Channel, rate: u32) -> Result<u32> {
        let applied =
            self.set_rational_sample_rate(channel, RationalRate::from_integer(u64::from(rate)))?;
        Ok(applied.rounded() as u32)
    }

    fn get_sample_rate(&mut self, channel: Channel) -> Result<u32> {
        Ok(self.get_rational_sample_rate(channel)?.rounded() as u32)
    }

    fn set_rational_sample_rate(
        &mut self,
        channel: Channel,
        rate: RationalRate,
    ) -> Result<RationalRate> {
        self.check_channel(channel)?;
        self.core
            .set_rational_sample_rate(channel, rate, SAMPLE_RATE_RANGE)
    }

    fn get_rational_sample_rate(&mut self, channel: Channel) -> Result<RationalRate> {
        self.check_channel(channel)?;
        self.core.get_rational_sample_rate(channel)
    }

    fn set_bandwidth(&mut self, channel: Channel, bandwidth: u32) -> Result<u32> {
        self.check_channel(channel)?;
        let applied = bandwidth.clamp(BANDWIDTH_RANGE.0, BANDWIDTH_RANGE.1);
        self.core.set_bandwidth(channel, applied)?;
        Ok(applied)
    }

    fn get_bandwidth(&mut self, channel: Channel) -> Result<u32> {
        self.check_channel(channel)?;
        self.core.get_bandwidth(channel)
    }

    fn set_frequency(&mut self, channel: Channel, frequency: u64) -> Result<()> {
        self.check_channel(channel)?;
        let qt = self.store_profile(frequency)?;
        self.select_band(channel, frequency)?;
        self.write_tune(channel, &qt, frequency)?;
        debug!(board = NAME, channel = %channel, frequency, profile = qt.nios_profile, "Tuned");
        Ok(())
    }

    fn get_frequency(&mut self, channel: Channel) -> Result<u64> {
        self.check_channel(channel)?;
        self.core.rf_read(rf::FREQUENCY, channel)
    }

    fn select_band(&mut self, channel: Channel, frequency: u64) -> Result<()> {
        self.check_channel(channel)?;
        Self::check_frequency(frequency)?;
        self.core
            .rf_write(rf::BAND, channel, u64::from(frequency > PORT_CROSSOVER))
    }

    fn get_quick_tune(&mut self, channel: Channel) -> Result<QuickTune> {
        self.check_channel(channel)?;
        let core = &self.core;
        if core.rf_read(rf::FREQUENCY, channel)? == 0 {
            return Err(SdrError::invalid_state(
                "get_quick_tune",
                format!("{} has not been tuned", channel),
            ));
        }
        let port = core.rf_read(rf::QT_PORT, channel)?;
        Ok(QuickTune::Rfic(RficQuickTune {
            nios_profile: core.rf_read(rf::QT_PROFILE, channel)? as u16,
            rffe_profile: core.rf_read(rf::QT_RFFE, channel)? as u8,
            port: (port & 0xff) as u8,
            spdt: (port >> 8) as u8,
        }))
    }

    fn schedule_retune(
        &mut self,
        channel: Channel,
        timestamp: u64,
        frequency: u64,
        quick_tune: Option<&QuickTune>,
    ) -> Result<()> {
        self.check_channel(channel)?;
        let qt = match quick_tune {
            Some(QuickTune::Rfic(qt)) => *qt,
            Some(other) => {
                return Err(SdrError::invalid_argument(
                    "schedule_retune",
                    format!("{} cannot apply a {} quick tune", NAME, other.family()),
                ))
            }
            None => self.store_profile(frequency)?,
        };
        self.core
            .schedule_retune(channel, timestamp, &QuickTune::Rfic(qt))
    }

    fn cancel_scheduled_retunes(&mut self, channel: Channel) -> Result<usize> {
        self.check_channel(channel)?;
        self.core.cancel_scheduled_retunes(channel)
    }

    fn trigger_init(&mut self, channel: Channel, signal: TriggerSignal) -> Result<()> {
        self.check_channel(channel)?;
        self.core.trigger_init(channel, signal, |s| {
            matches!(s, TriggerSignal::J51_1 | TriggerSignal::MiniExp1) || s.is_user()
        })
    }

    fn trigger_arm(&mut self, trigger: &Trigger, arm: bool, _resv1: u64, _resv2: u64) -> Result<()> {
        self.core.trigger_arm(trigger, arm)
    }

    fn trigger_fire(&mut self, trigger: &Trigger) -> Result<()> {
        self.core.trigger_fire(trigger)
    }

    fn trigger_state(&mut self, trigger: &Trigger) -> Result<TriggerState> {
        self.core.trigger_state(trigger)
    }

    fn init_stream(
        &mut self,
        layout: ChannelLayout,
        config: StreamConfig,
        callback: Box<dyn StreamCallback>,
    ) -> Result<Stream> {
        self.core.init_stream(layout, config, callback, self.caps)
    }

    fn sync_config(&mut self, layout: ChannelLayout, config: StreamConfig) -> Result<SyncStream> {
        self.core.sync_config(layout, config, self.caps)
    }

    fn set_stream_timeout(&mut self, direction: Direction, timeout: Duration) -> Result<()> {
        self.core.set_stream_timeout(direction, timeout);
        Ok(())
    }

    fn get_stream_timeout(&mut self, direction: Direction) -> Result<Duration> {
        Ok(self.core.stream_timeout(direction))
    }

    fn get_timestamp(&mut self, direction: Direction) -> Result<u64> {
        self.core.backend.get_timestamp(direction)
    }

    fn get_correction(&mut self, channel: Channel, correction: Correction) -> Result<i16> {
        self.check_channel(channel)?;
        self.core.get_correction(channel, correction)
    }

    fn set_correction(&mut self, channel: Channel, correction: Correction, value: i16) -> Result<()> {
        self.check_channel(channel)?;
        self.core.set_correction(channel, correction, value)
    }

    fn get_rx_mux(&mut self) -> Result<RxMux> {
        self.core.get_rx_mux()
    }

    fn set_rx_mux(&mut self, mux: RxMux) -> Result<()> {
        self.core.set_rx_mux(mux)
    }

    fn get_tuning_mode(&mut self) -> Result<TuningMode> {
        Ok(TuningMode::Host)
    }

    fn set_tuning_mode(&mut self, mode: TuningMode) -> Result<()> {
        match mode {
            TuningMode::Host => Ok(()),
            TuningMode::Fpga => Err(SdrError::unsupported("FPGA tuning mode", NAME)),
        }
    }

    fn load_fpga(&mut self, image: &[u8]) -> Result<()> {
        self.core.backend.load_fpga(image)?;
        let version = self.core.loaded_fpga_version()?;
        self.caps = Self::capabilities_for(version.as_ref());
        Ok(())
    }

    fn flash_fpga(&mut self, image: &[u8]) -> Result<()> {
        self.core.backend.flash_fpga(image)
    }

    fn erase_stored_fpga(&mut self) -> Result<()> {
        self.core.erase_stored_fpga()
    }

    fn flash_firmware(&mut self, image: &[u8]) -> Result<()> {
        self.core.backend.flash_firmware(image)
    }

    fn device_reset(&mut self) -> Result<()> {
        self.core.backend.device_reset()?;
        self.next_profile = 0;
        let version = self.core.loaded_fpga_version()?;
        self.caps = Self::capabilities_for(version.as_ref());
        Ok(())
    }
}

/// Claims [`SimProduct::Rev2`] devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct Rev2Factory;

impl BoardFactory for Rev2Factory {
    fn name(&self) -> &str {
        NAME
    }

    fn matches(&self, info: &DevInfo) -> bool {
        info.product == SimProduct::Rev2.product_name()
    }

    fn open(
        &self,
        backend: Arc<dyn TransportBackend>,
        info: &DevInfo,
    ) -> Result<Box<dyn BoardDriver>> {
        Ok(Box::new(Rev2Board::open(backend, info)?))
    }
}
