//! Single-channel board with an LMS-style transceiver.
//!
//! One RX and one TX channel, SMB reference clock, selectable ADC
//! sampling path and expansion board support. Scheduled retunes carry the
//! synthesizer settings themselves ([`QuickTune::Lms`]).

use super::common::{fpga_capabilities, BoardCore};
use crate::hardware::SimProduct;
use crate::lms;
use crate::regs::{config, rf, RegCode};
use sdr_core::{
    BoardDriver, BoardFactory, Capabilities, Channel, ChannelLayout, Correction, DevInfo,
    DevSpeed, Direction, FpgaSize, GainMode, LmsQuickTune, QuickTune, RationalRate, Result,
    RxMux, Sampling, SdrError, SmbMode, Stream, StreamCallback, StreamConfig, SyncStream,
    TransportBackend, Trigger, TriggerSignal, TriggerState, TuningMode, Version, Xb,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const NAME: &str = "sim-rev1";

const FREQUENCY_MIN: u64 = 237_500_000;
const FREQUENCY_MIN_XB200: u64 = 60_000_000;
const FREQUENCY_MAX: u64 = 3_800_000_000;
/// Below this the XB-200 transverter path is used, when fitted.
const XB200_CROSSOVER: u64 = 300_000_000;

const SAMPLE_RATE_RANGE: (u64, u64) = (160_000, 40_000_000);
const RX_GAIN_RANGE: (i32, i32) = (5, 60);
const TX_GAIN_RANGE: (i32, i32) = (-35, -4);
const SMB_FREQUENCY_RANGE: (u64, u64) = (2_000_000, 200_000_000);

/// Low-pass filter settings of the transceiver, Hz.
const BANDWIDTHS: [u32; 16] = [
    1_500_000, 1_750_000, 2_500_000, 2_750_000, 3_000_000, 3_840_000, 5_000_000, 5_500_000,
    6_000_000, 7_000_000, 8_750_000, 10_000_000, 12_000_000, 14_000_000, 20_000_000, 28_000_000,
];

/// Smallest filter that passes `bandwidth`, or the widest one.
fn pick_bandwidth(bandwidth: u32) -> u32 {
    BANDWIDTHS
        .iter()
        .copied()
        .find(|bw| *bw >= bandwidth)
        .unwrap_or(BANDWIDTHS[BANDWIDTHS.len() - 1])
}

/// Board driver for [`SimProduct::Rev1`] devices.
pub struct Rev1Board {
    core: BoardCore,
    caps: Capabilities,
    xb: Xb,
}

impl Rev1Board {
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
            xb: Xb::None,
        })
    }

    fn capabilities_for(version: Option<&Version>) -> Capabilities {
        Capabilities::SMB_CLOCK
            | Capabilities::EXPANSION
            | Capabilities::RX_MUX
            | Capabilities::QUICK_TUNE
            | fpga_capabilities(version)
    }

    fn check_channel(&self, channel: Channel) -> Result<()> {
        if channel.index() != 0 {
            return Err(SdrError::invalid_argument(
                "channel",
                format!("{} has no channel {}", NAME, channel),
            ));
        }
        Ok(())
    }

    fn check_layout(&self, layout: ChannelLayout) -> Result<()> {
        if layout.channel_count() != 1 {
            return Err(SdrError::invalid_argument(
                "stream_layout",
                format!("{} supports single-channel layouts only, not {}", NAME, layout),
            ));
        }
        Ok(())
    }

    fn frequency_min(&self) -> u64 {
        if self.xb == Xb::Xb200 {
            FREQUENCY_MIN_XB200
        } else {
            FREQUENCY_MIN
        }
    }

    /// Synthesizer settings for `frequency`, through the XB-200 if needed.
    fn resolve(&self, frequency: u64) -> Result<LmsQuickTune> {
        if frequency < self.frequency_min() || frequency > FREQUENCY_MAX {
            return Err(SdrError::invalid_argument(
                "set_frequency",
                format!(
                    "{} Hz is outside {}..={} Hz",
                    frequency,
                    self.frequency_min(),
                    FREQUENCY_MAX
                ),
            ));
        }
        if self.xb == Xb::Xb200 && frequency < XB200_CROSSOVER {
            let mut qt = lms::quick_tune(frequency + lms::XB200_LO_HZ)?;
            qt.flags |= lms::FLAG_XB200_MIX | lms::FLAG_LOW_BAND;
            qt.xb_gpio = if frequency < 150_000_000 { 0b01 } else { 0b10 };
            Ok(qt)
        } else {
            lms::quick_tune(frequency)
        }
    }

    fn write_tune(&self, channel: Channel, qt: &LmsQuickTune, frequency: u64) -> Result<()> {
        let core = &self.core;
        core.rf_write(rf::QT_FREQSEL, channel, u64::from(qt.freqsel))?;
        core.rf_write(rf::QT_VCOCAP, channel, u64::from(qt.vcocap))?;
        core.rf_write(rf::QT_NINT, channel, u64::from(qt.nint))?;
        core.rf_write(rf::QT_NFRAC, channel, u64::from(qt.nfrac))?;
        core.rf_write(rf::QT_FLAGS, channel, u64::from(qt.flags))?;
        if self.xb == Xb::Xb200 {
            core.config_write(config::XB_GPIO, u64::from(qt.xb_gpio))?;
        }
        core.rf_write(rf::FREQUENCY, channel, frequency)
    }

    fn set_smb(&self, rate: RationalRate) -> Result<RationalRate> {
        if rate.den == 0 {
            return Err(SdrError::invalid_argument(
                "set_smb_frequency",
                "denominator must be non-zero",
            ));
        }
        let rate = rate.normalized();
        if rate.integer < SMB_FREQUENCY_RANGE.0 || rate.integer > SMB_FREQUENCY_RANGE.1 {
            return Err(SdrError::invalid_argument(
                "set_smb_frequency",
                format!("{} is outside the SMB clock range", rate),
            ));
        }
        self.core.config_write(config::SMB_FREQ_INT, rate.integer)?;
        self.core.config_write(config::SMB_FREQ_NUM, rate.num)?;
        self.core.config_write(config::SMB_FREQ_DEN, rate.den)?;
        self.core.config_write(config::SMB_MODE, SmbMode::Output.to_reg())?;
        Ok(rate)
    }
}

impl BoardDriver for Rev1Board {
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
        match mode {
            GainMode::Default | GainMode::Manual => {
                self.core.rf_write(rf::GAIN_MODE, channel, mode.to_reg())
            }
            _ => Err(SdrError::invalid_argument(
                "set_gain_mode",
                format!("{} has no automatic gain control", NAME),
            )),
        }
    }

    fn get_gain_mode(&mut self, channel: Channel) -> Result<GainMode> {
        self.check_channel(channel)?;
        let raw = self.core.rf_read(rf::GAIN_MODE, channel)?;
        Ok(GainMode::from_reg(raw).unwrap_or(GainMode::Default))
    }

    fn set_sample_rate(&mut self, channel: Channel, rate: u32) -> Result<u32> {
        let applied = self.set_rational_sample_rate(channel, RationalRate::from_integer(u64::from(rate)))?;
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
        let applied = pick_bandwidth(bandwidth);
        self.core.set_bandwidth(channel, applied)?;
        Ok(applied)
    }

    fn get_bandwidth(&mut self, channel: Channel) -> Result<u32> {
        self.check_channel(channel)?;
        self.core.get_bandwidth(channel)
    }

    fn set_frequency(&mut self, channel: Channel, frequency: u64) -> Result<()> {
        self.check_channel(channel)?;
        let qt = self.resolve(frequency)?;
        self.select_band(channel, frequency)?;
        self.write_tune(channel, &qt, frequency)?;
        debug!(board = NAME, channel = %channel, frequency, "Tuned");
        Ok(())
    }

    fn get_frequency(&mut self, channel: Channel) -> Result<u64> {
        self.check_channel(channel)?;
        self.core.rf_read(rf::FREQUENCY, channel)
    }

    fn select_band(&mut self, channel: Channel, frequency: u64) -> Result<()> {
        self.check_channel(channel)?;
        let low = frequency < lms::LOW_BAND_MAX_HZ;
        self.core.rf_write(rf::BAND, channel, u64::from(!low))
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
        Ok(QuickTune::Lms(LmsQuickTune {
            freqsel: core.rf_read(rf::QT_FREQSEL, channel)? as u8,
            vcocap: core.rf_read(rf::QT_VCOCAP, channel)? as u8,
            nint: core.rf_read(rf::QT_NINT, channel)? as u16,
            nfrac: core.rf_read(rf::QT_NFRAC, channel)? as u32,
            flags: core.rf_read(rf::QT_FLAGS, channel)? as u8,
            xb_gpio: core.config_read(config::XB_GPIO)? as u8,
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
            Some(QuickTune::Lms(qt)) => *qt,
            Some(other) => {
                return Err(SdrError::invalid_argument(
                    "schedule_retune",
                    format!("{} cannot apply a {} quick tune", NAME, other.family()),
                ))
            }
            None => self.resolve(frequency)?,
        };
        self.core
            .schedule_retune(channel, timestamp, &QuickTune::Lms(qt))
    }

    fn cancel_scheduled_retunes(&mut self, channel: Channel) -> Result<usize> {
        self.check_channel(channel)?;
        self.core.cancel_scheduled_retunes(channel)
    }

    fn trigger_init(&mut self, channel: Channel, signal: TriggerSignal) -> Result<()> {
        self.check_channel(channel)?;
        self.core.trigger_init(channel, signal, |s| {
            s == TriggerSignal::J71_4 || s.is_user()
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
        self.check_layout(layout)?;
        self.core.init_stream(layout, config, callback, self.caps)
    }

    fn sync_config(&mut self, layout: ChannelLayout, config: StreamConfig) -> Result<SyncStream> {
        self.check_layout(layout)?;
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

    fn get_smb_mode(&mut self) -> Result<SmbMode> {
        self.core.config_enum(config::SMB_MODE, "get_smb_mode")
    }

    fn set_smb_mode(&mut self, mode: SmbMode) -> Result<()> {
        if mode == SmbMode::Unavailable {
            return Err(SdrError::invalid_argument(
                "set_smb_mode",
                "Unavailable is a reported state, not a mode",
            ));
        }
        self.core.config_write(config::SMB_MODE, mode.to_reg())
    }

    fn get_smb_frequency(&mut self) -> Result<u32> {
        Ok(self.get_rational_smb_frequency()?.rounded() as u32)
    }

    fn set_smb_frequency(&mut self, frequency: u32) -> Result<u32> {
        let applied = self.set_smb(RationalRate::from_integer(u64::from(frequency)))?;
        Ok(applied.rounded() as u32)
    }

    fn get_rational_smb_frequency(&mut self) -> Result<RationalRate> {
        Ok(RationalRate {
            integer: self.core.config_read(config::SMB_FREQ_INT)?,
            num: self.core.config_read(config::SMB_FREQ_NUM)?,
            den: self.core.config_read(config::SMB_FREQ_DEN)?.max(1),
        })
    }

    fn set_rational_smb_frequency(&mut self, rate: RationalRate) -> Result<RationalRate> {
        self.set_smb(rate)
    }

    fn get_correction(&mut self, channel: Channel, correction: Correction) -> Result<i16> {
        self.check_channel(channel)?;
        self.core.get_correction(channel, correction)
    }

    fn set_correction(&mut self, channel: Channel, correction: Correction, value: i16) -> Result<()> {
        self.check_channel(channel)?;
        self.core.set_correction(channel, correction, value)
    }

    fn get_sampling(&mut self) -> Result<Sampling> {
        self.core.config_enum(config::SAMPLING, "get_sampling")
    }

    fn set_sampling(&mut self, sampling: Sampling) -> Result<()> {
        if sampling == Sampling::Unknown {
            return Err(SdrError::invalid_argument(
                "set_sampling",
                "sampling path must be Internal or External",
            ));
        }
        self.core.config_write(config::SAMPLING, sampling.to_reg())
    }

    fn get_rx_mux(&mut self) -> Result<RxMux> {
        self.core.get_rx_mux()
    }

    fn set_rx_mux(&mut self, mux: RxMux) -> Result<()> {
        self.core.set_rx_mux(mux)
    }

    fn get_tuning_mode(&mut self) -> Result<TuningMode> {
        self.core.config_enum(config::TUNING_MODE, "get_tuning_mode")
    }

    fn set_tuning_mode(&mut self, mode: TuningMode) -> Result<()> {
        if mode == TuningMode::Fpga && !self.caps.contains(Capabilities::FPGA_TUNING) {
            return Err(SdrError::unsupported("FPGA tuning mode", NAME));
        }
        self.core.config_write(config::TUNING_MODE, mode.to_reg())
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
        self.xb = Xb::None;
        let version = self.core.loaded_fpga_version()?;
        self.caps = Self::capabilities_for(version.as_ref());
        Ok(())
    }

    fn expansion_attach(&mut self, xb: Xb) -> Result<()> {
        if xb == Xb::None {
            return Err(SdrError::invalid_argument(
                "expansion_attach",
                "no expansion board given",
            ));
        }
        if self.xb != Xb::None {
            return Err(SdrError::invalid_state(
                "expansion_attach",
                format!("{} is already attached", self.xb),
            ));
        }
        self.core.config_write(config::XB_SELECT, xb.to_reg())?;
        self.xb = xb;
        info!(board = NAME, xb = %xb, "Expansion board attached");
        Ok(())
    }

    fn expansion_get_attached(&mut self) -> Result<Xb> {
        Ok(self.xb)
    }

    fn expansion_detach(&mut self) -> Result<()> {
        if self.xb == Xb::None {
            return Ok(());
        }
        self.core.config_write(config::XB_GPIO, 0)?;
        self.core.config_write(config::XB_SELECT, Xb::None.to_reg())?;
        debug!(board = NAME, xb = %self.xb, "Expansion board detached");
        self.xb = Xb::None;
        Ok(())
    }
}

/// Claims [`SimProduct::Rev1`] devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct Rev1Factory;

impl BoardFactory for Rev1Factory {
    fn name(&self) -> &str {
        NAME
    }

    fn matches(&self, info: &DevInfo) -> bool {
        info.product == SimProduct::Rev1.product_name()
    }

    fn open(
        &self,
        backend: Arc<dyn TransportBackend>,
        info: &DevInfo,
    ) -> Result<Box<dyn BoardDriver>> {
        Ok(Box::new(Rev1Board::open(backend, info)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bandwidth_selection() {
        assert_eq!(pick_bandwidth(1), 1_500_000);
        assert_eq!(pick_bandwidth(5_000_000), 5_000_000);
        assert_eq!(pick_bandwidth(5_000_001), 5_500_000);
        assert_eq!(pick_bandwidth(u32::MAX), 28_000_000);
    }

    #[test]
    fn test_capabilities_follow_fpga_version() {
        let old = Rev1Board::capabilities_for(Some(&Version::new(0, 1, 5)));
        assert!(old.contains(Capabilities::TIMESTAMPS));
        assert!(!old.contains(Capabilities::SCHEDULED_RETUNE));
        assert!(!old.contains(Capabilities::TRIGGERS));

        let none = Rev1Board::capabilities_for(None);
        assert!(none.contains(Capabilities::SMB_CLOCK));
        assert!(!none.contains(Capabilities::TIMESTAMPS));

        let current = Rev1Board::capabilities_for(Some(&Version::new(0, 15, 0)));
        assert!(current.contains(Capabilities::TRIGGERS | Capabilities::FPGA_TUNING));
        assert!(!current.contains(Capabilities::MIMO));
    }
}
