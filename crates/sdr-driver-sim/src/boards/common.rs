//! Register-level plumbing shared by the simulated board drivers.

use crate::regs::{self, config, rf, RegCode};
use sdr_core::transport::request;
use sdr_core::trigger::{self, reg};
use sdr_core::{
    Capabilities, Channel, ChannelLayout, ControlRequest, Correction, DevInfo, DevSpeed,
    Direction, FpgaSize, QuickTune, RationalRate, RegisterSpace, Result, RxMux, SdrError, Stream,
    StreamCallback, StreamConfig, SyncStream, TransportBackend, Trigger, TriggerRole,
    TriggerSignal, TriggerState, Version, RETUNE_NOW,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Flash region reserved for the autoloaded FPGA image.
const FPGA_FLASH_OFFSET: u32 = 0x0004_0000;
const FPGA_FLASH_LEN: u32 = 0x0037_0000;

/// Features unlocked by the loaded FPGA's version.
pub(crate) fn fpga_capabilities(version: Option<&Version>) -> Capabilities {
    let Some(v) = version else {
        return Capabilities::empty();
    };
    let mut caps = Capabilities::empty();
    if v.at_least(0, 1, 0) {
        caps |= Capabilities::TIMESTAMPS;
    }
    if v.at_least(0, 2, 0) {
        caps |= Capabilities::SCHEDULED_RETUNE;
    }
    if v.at_least(0, 6, 0) {
        caps |= Capabilities::TRIGGERS;
    }
    if v.at_least(0, 10, 0) {
        caps |= Capabilities::FPGA_TUNING;
    }
    caps
}

/// Transport access plus the state every board keeps.
pub(crate) struct BoardCore {
    pub name: &'static str,
    pub backend: Arc<dyn TransportBackend>,
    pub info: DevInfo,
    timeouts: [Duration; 2],
}

fn dir_index(direction: Direction) -> usize {
    match direction {
        Direction::Rx => 0,
        Direction::Tx => 1,
    }
}

impl BoardCore {
    pub fn new(name: &'static str, backend: Arc<dyn TransportBackend>, info: &DevInfo) -> Self {
        let default_timeout = StreamConfig::default().timeout;
        Self {
            name,
            backend,
            info: info.clone(),
            timeouts: [default_timeout; 2],
        }
    }

    // =========================================================================
    // Register access
    // =========================================================================

    pub fn config_read(&self, addr: u16) -> Result<u64> {
        self.backend.register_read(RegisterSpace::Config, addr)
    }

    pub fn config_write(&self, addr: u16, value: u64) -> Result<()> {
        self.backend.register_write(RegisterSpace::Config, addr, value)
    }

    pub fn rf_read(&self, base: u16, channel: Channel) -> Result<u64> {
        self.backend
            .register_read(RegisterSpace::RfFrontEnd, regs::rf_addr(base, channel))
    }

    pub fn rf_write(&self, base: u16, channel: Channel, value: u64) -> Result<()> {
        self.backend
            .register_write(RegisterSpace::RfFrontEnd, regs::rf_addr(base, channel), value)
    }

    /// Read an enum-valued config register.
    pub fn config_enum<T: RegCode>(&self, addr: u16, operation: &'static str) -> Result<T> {
        let raw = self.config_read(addr)?;
        T::from_reg(raw).ok_or_else(|| {
            SdrError::transport(operation, format!("register {:#x} holds {}", addr, raw))
        })
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub fn device_speed(&self) -> Result<DevSpeed> {
        self.backend.device_speed()
    }

    pub fn serial(&self) -> Result<String> {
        let mut data = [0u8; 64];
        let n = self.backend.control_transfer(
            ControlRequest {
                request: request::GET_STRING,
                value: request::STRING_SERIAL,
                index: 0,
            },
            &mut data,
        )?;
        Ok(String::from_utf8_lossy(&data[..n]).into_owned())
    }

    pub fn fpga_size(&self) -> Result<FpgaSize> {
        self.config_enum(config::FPGA_SIZE, "get_fpga_size")
    }

    /// FPGA version, or `None` while no FPGA is configured.
    pub fn loaded_fpga_version(&self) -> Result<Option<Version>> {
        if self.backend.is_fpga_configured()? {
            self.backend.get_fpga_version().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn enable_module(&self, channel: Channel, enable: bool) -> Result<()> {
        let current = self.config_read(config::ENABLE)?;
        let bit = regs::enable_bit(channel);
        let next = if enable { current | bit } else { current & !bit };
        debug!(board = self.name, channel = %channel, enable, "Module enable");
        self.config_write(config::ENABLE, next)
    }

    // =========================================================================
    // Gain, rate, bandwidth, corrections
    // =========================================================================

    /// Apply `gain_db` clamped to `range`.
    pub fn set_gain(&self, channel: Channel, gain_db: i32, range: (i32, i32)) -> Result<()> {
        let applied = gain_db.clamp(range.0, range.1);
        if applied != gain_db {
            debug!(board = self.name, channel = %channel, requested = gain_db, applied, "Gain clamped");
        }
        self.rf_write(rf::GAIN, channel, regs::encode_i32(applied))
    }

    pub fn get_gain(&self, channel: Channel) -> Result<i32> {
        Ok(regs::decode_i32(self.rf_read(rf::GAIN, channel)?))
    }

    /// Write a rational sample rate after checking `range` (whole Hz).
    pub fn set_rational_sample_rate(
        &self,
        channel: Channel,
        rate: RationalRate,
        range: (u64, u64),
    ) -> Result<RationalRate> {
        if rate.den == 0 {
            return Err(SdrError::invalid_argument(
                "set_rational_sample_rate",
                "denominator must be non-zero",
            ));
        }
        let rate = rate.normalized();
        if rate.integer < range.0 || rate.integer > range.1 {
            return Err(SdrError::invalid_argument(
                "set_rational_sample_rate",
                format!("{} is outside {}..={} Hz", rate, range.0, range.1),
            ));
        }
        self.rf_write(rf::SAMPLE_RATE_INT, channel, rate.integer)?;
        self.rf_write(rf::SAMPLE_RATE_NUM, channel, rate.num)?;
        self.rf_write(rf::SAMPLE_RATE_DEN, channel, rate.den)?;
        Ok(rate)
    }

    pub fn get_rational_sample_rate(&self, channel: Channel) -> Result<RationalRate> {
        Ok(RationalRate {
            integer: self.rf_read(rf::SAMPLE_RATE_INT, channel)?,
            num: self.rf_read(rf::SAMPLE_RATE_NUM, channel)?,
            den: self.rf_read(rf::SAMPLE_RATE_DEN, channel)?.max(1),
        })
    }

    pub fn set_bandwidth(&self, channel: Channel, bandwidth: u32) -> Result<()> {
        self.rf_write(rf::BANDWIDTH, channel, u64::from(bandwidth))
    }

    pub fn get_bandwidth(&self, channel: Channel) -> Result<u32> {
        Ok(self.rf_read(rf::BANDWIDTH, channel)? as u32)
    }

    fn correction_index(correction: Correction) -> u16 {
        match correction {
            Correction::DcOffsetI => 0,
            Correction::DcOffsetQ => 1,
            Correction::Phase => 2,
            Correction::Gain => 3,
        }
    }

    pub fn get_correction(&self, channel: Channel, correction: Correction) -> Result<i16> {
        let addr = regs::correction_addr(channel, Self::correction_index(correction));
        let raw = self.backend.register_read(RegisterSpace::RfFrontEnd, addr)?;
        Ok(regs::decode_i32(raw) as i16)
    }

    pub fn set_correction(&self, channel: Channel, correction: Correction, value: i16) -> Result<()> {
        let (min, max) = correction.range();
        if value < min || value > max {
            return Err(SdrError::invalid_argument(
                "set_correction",
                format!("{:?} value {} is outside {}..={}", correction, value, min, max),
            ));
        }
        let addr = regs::correction_addr(channel, Self::correction_index(correction));
        self.backend.register_write(
            RegisterSpace::RfFrontEnd,
            addr,
            regs::encode_i32(i32::from(value)),
        )
    }

    pub fn get_rx_mux(&self) -> Result<RxMux> {
        self.config_enum(config::RX_MUX, "get_rx_mux")
    }

    pub fn set_rx_mux(&self, mux: RxMux) -> Result<()> {
        self.config_write(config::RX_MUX, mux.to_reg())
    }

    // =========================================================================
    // Scheduled retunes
    // =========================================================================

    pub fn schedule_retune(&self, channel: Channel, timestamp: u64, qt: &QuickTune) -> Result<()> {
        let now = self.backend.get_timestamp(channel.direction())?;
        if timestamp != RETUNE_NOW && timestamp <= now {
            warn!(
                board = self.name,
                channel = %channel,
                timestamp,
                now,
                "Retune timestamp already passed; applying as soon as possible"
            );
        }
        self.backend.retune(channel, timestamp, qt)
    }

    pub fn cancel_scheduled_retunes(&self, channel: Channel) -> Result<usize> {
        let removed = self.backend.clear_retune_queue(channel)?;
        debug!(board = self.name, channel = %channel, removed, "Cancelled scheduled retunes");
        Ok(removed)
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    fn trigger_addr(trigger: &Trigger) -> u16 {
        trigger::register_address(trigger.channel, trigger.signal)
    }

    pub fn trigger_init(
        &self,
        channel: Channel,
        signal: TriggerSignal,
        allowed: impl Fn(TriggerSignal) -> bool,
    ) -> Result<()> {
        if !allowed(signal) {
            return Err(SdrError::invalid_argument(
                "trigger_init",
                format!("{} is not routed on {}", signal, self.name),
            ));
        }
        self.backend.register_write(
            RegisterSpace::Trigger,
            trigger::register_address(channel, signal),
            0,
        )
    }

    pub fn trigger_arm(&self, trigger: &Trigger, arm: bool) -> Result<()> {
        let value = if arm {
            match trigger.role {
                TriggerRole::Master => reg::ARM | reg::MASTER,
                TriggerRole::Slave => reg::ARM,
                TriggerRole::Disabled => {
                    return Err(SdrError::invalid_argument(
                        "trigger_arm",
                        "a trigger with role Disabled cannot be armed",
                    ))
                }
            }
        } else {
            0
        };
        self.backend
            .register_write(RegisterSpace::Trigger, Self::trigger_addr(trigger), value)
    }

    pub fn trigger_fire(&self, trigger: &Trigger) -> Result<()> {
        let addr = Self::trigger_addr(trigger);
        let value = self.backend.register_read(RegisterSpace::Trigger, addr)?;
        if value & reg::ARM == 0 || value & reg::MASTER == 0 {
            return Err(SdrError::invalid_state(
                "trigger_fire",
                "only an armed master can fire",
            ));
        }
        self.backend
            .register_write(RegisterSpace::Trigger, addr, value | reg::FIRE)
    }

    pub fn trigger_state(&self, trigger: &Trigger) -> Result<TriggerState> {
        let value = self
            .backend
            .register_read(RegisterSpace::Trigger, Self::trigger_addr(trigger))?;
        Ok(trigger::decode_state(value))
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    fn check_stream(&self, config: &StreamConfig, caps: Capabilities) -> Result<()> {
        if config.format.has_metadata() && !caps.contains(Capabilities::TIMESTAMPS) {
            return Err(SdrError::unsupported("metadata sample format", self.name));
        }
        Ok(())
    }

    pub fn init_stream(
        &mut self,
        layout: ChannelLayout,
        config: StreamConfig,
        callback: Box<dyn StreamCallback>,
        caps: Capabilities,
    ) -> Result<Stream> {
        self.check_stream(&config, caps)?;
        let timeout = config.timeout;
        let stream = Stream::new(Arc::clone(&self.backend), layout, config, callback)?;
        self.timeouts[dir_index(layout.direction())] = timeout;
        Ok(stream)
    }

    pub fn sync_config(
        &mut self,
        layout: ChannelLayout,
        config: StreamConfig,
        caps: Capabilities,
    ) -> Result<SyncStream> {
        self.check_stream(&config, caps)?;
        let timeout = config.timeout;
        let stream = SyncStream::new(Arc::clone(&self.backend), layout, config)?;
        self.timeouts[dir_index(layout.direction())] = timeout;
        Ok(stream)
    }

    pub fn set_stream_timeout(&mut self, direction: Direction, timeout: Duration) {
        self.timeouts[dir_index(direction)] = timeout;
    }

    pub fn stream_timeout(&self, direction: Direction) -> Duration {
        self.timeouts[dir_index(direction)]
    }

    // =========================================================================
    // Images
    // =========================================================================

    pub fn erase_stored_fpga(&self) -> Result<()> {
        self.backend.erase_flash(FPGA_FLASH_OFFSET, FPGA_FLASH_LEN)
    }

    /// Disable every channel before the backend goes away.
    pub fn close(&self) -> Result<()> {
        self.config_write(config::ENABLE, 0)
    }
}
