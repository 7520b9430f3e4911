//! Simulated device hardware.
//!
//! A [`SimDevice`] is the physical unit on the simulated bus: register
//! banks, free-running RX and TX sample counters, the per-channel retune
//! queues executed by the firmware, trigger lines and flash. Transport
//! backends open it; tests inspect it directly.

use crate::bus::SignalBus;
use crate::common::FaultPlan;
use crate::lms;
use crate::regs::{self, config, rf, RegCode};
use parking_lot::Mutex;
use sdr_core::trigger::{self, reg};
use sdr_core::transport::request;
use sdr_core::{
    BackendKind, Channel, ControlRequest, DevInfo, DevSpeed, Direction, FpgaSize, QuickTune,
    RegisterSpace, Result, RetuneQueue, RxMux, SampleFormat, SdrError, TriggerSignal, Version,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace};

/// Board family of a simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimProduct {
    /// Single channel per direction, LMS transceiver.
    Rev1,
    /// Two channels per direction, RFIC transceiver.
    Rev2,
}

impl SimProduct {
    /// Product string reported in [`DevInfo::product`].
    pub fn product_name(self) -> &'static str {
        match self {
            SimProduct::Rev1 => "sim-rev1",
            SimProduct::Rev2 => "sim-rev2",
        }
    }
}

pub const MANUFACTURER: &str = "sdrhal";

/// Power-on description of a simulated device.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub serial: String,
    pub product: SimProduct,
    pub usb_bus: u8,
    pub usb_addr: u8,
    pub speed: DevSpeed,
    pub fpga_size: FpgaSize,
    pub fw_version: Version,
    pub fpga_version: Version,
    /// FPGA configured at power-on (autoload).
    pub fpga_loaded: bool,
    pub faults: FaultPlan,
}

impl DeviceSpec {
    pub fn rev1(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            product: SimProduct::Rev1,
            usb_bus: 1,
            usb_addr: 1,
            speed: DevSpeed::Super,
            fpga_size: FpgaSize::Kle115,
            fw_version: Version::new(2, 4, 0),
            fpga_version: Version::new(0, 15, 0),
            fpga_loaded: true,
            faults: FaultPlan::none(),
        }
    }

    pub fn rev2(serial: impl Into<String>) -> Self {
        Self {
            product: SimProduct::Rev2,
            fpga_size: FpgaSize::A4,
            fpga_version: Version::new(0, 15, 0),
            ..Self::rev1(serial)
        }
    }

    pub fn with_usb_address(mut self, bus: u8, addr: u8) -> Self {
        self.usb_bus = bus;
        self.usb_addr = addr;
        self
    }

    pub fn with_fpga_version(mut self, version: Version) -> Self {
        self.fpga_version = version;
        self
    }

    pub fn with_fpga_loaded(mut self, loaded: bool) -> Self {
        self.fpga_loaded = loaded;
        self
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }
}

/// One host register write, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub space: RegisterSpace,
    pub addr: u16,
    pub value: u64,
}

/// A scheduled retune the firmware executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedRetune {
    pub channel: Channel,
    /// Timestamp the entry was scheduled for.
    pub scheduled: u64,
    /// Counter value when it was applied.
    pub applied_at: u64,
    pub frequency: u64,
}

/// One TX transfer as it left the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRecord {
    /// Requested start time, if the transfer carried one.
    pub timestamp: Option<u64>,
    /// Counter value when the first sample went out.
    pub started_at: u64,
    pub bytes: usize,
}

fn dir_index(direction: Direction) -> usize {
    match direction {
        Direction::Rx => 0,
        Direction::Tx => 1,
    }
}

/// Channel and signal addressed by a trigger register.
fn trigger_target(addr: u16) -> Option<(Direction, TriggerSignal)> {
    let direction = match addr >> 8 {
        0 => Direction::Rx,
        1 => Direction::Tx,
        _ => return None,
    };
    let code = (addr & 0xff) as u8;
    TriggerSignal::ALL
        .iter()
        .find(|s| s.code() == code)
        .map(|s| (direction, *s))
}

fn trigger_addr(direction: Direction, signal: TriggerSignal) -> u16 {
    let channel = match direction {
        Direction::Rx => Channel::RX0,
        Direction::Tx => Channel::TX0,
    };
    trigger::register_address(channel, signal)
}

// =============================================================================
// Hardware state
// =============================================================================

#[derive(Debug, Default)]
struct Hardware {
    regs: HashMap<(RegisterSpace, u16), u64>,
    write_log: Vec<RegisterWrite>,
    clocks: [u64; 2],
    retunes: HashMap<Channel, RetuneQueue>,
    applied: Vec<AppliedRetune>,
    fired_at: HashMap<(Direction, TriggerSignal), u64>,
    fpga_loaded: bool,
    fpga_flash: Option<Vec<u8>>,
    firmware: Option<Vec<u8>>,
    loopback: Vec<u8>,
    tx_log: Vec<TxRecord>,
    resets: u32,
}

impl Hardware {
    fn power_on(spec: &DeviceSpec) -> Self {
        let mut hw = Self {
            fpga_loaded: spec.fpga_loaded,
            ..Self::default()
        };
        hw.load_defaults(spec);
        hw
    }

    fn load_defaults(&mut self, spec: &DeviceSpec) {
        self.regs.clear();
        self.set(RegisterSpace::Config, config::FPGA_SIZE, spec.fpga_size.to_reg());
        self.set(RegisterSpace::Config, config::SAMPLING, sdr_core::Sampling::Internal.to_reg());
        for channel in [Channel::RX0, Channel::RX1, Channel::TX0, Channel::TX1] {
            self.set(
                RegisterSpace::RfFrontEnd,
                regs::rf_addr(rf::SAMPLE_RATE_INT, channel),
                1_000_000,
            );
            self.set(
                RegisterSpace::RfFrontEnd,
                regs::rf_addr(rf::SAMPLE_RATE_DEN, channel),
                1,
            );
        }
    }

    fn get(&self, space: RegisterSpace, addr: u16) -> u64 {
        self.regs.get(&(space, addr)).copied().unwrap_or(0)
    }

    fn set(&mut self, space: RegisterSpace, addr: u16, value: u64) {
        self.regs.insert((space, addr), value);
    }

    fn gated(&self, direction: Direction) -> bool {
        self.regs.iter().any(|((space, addr), value)| {
            *space == RegisterSpace::Trigger
                && trigger_target(*addr).is_some_and(|(d, _)| d == direction)
                && value & reg::ARM != 0
                && value & reg::LINE == 0
        })
    }

    fn advance(&mut self, direction: Direction, samples: u64) {
        self.clocks[dir_index(direction)] += samples;
        self.process_retunes(direction);
    }

    /// Apply every queued retune of `direction` whose time has come.
    fn process_retunes(&mut self, direction: Direction) {
        let now = self.clocks[dir_index(direction)];
        let mut due = Vec::new();
        let mut channels: Vec<Channel> = self
            .retunes
            .keys()
            .filter(|c| c.direction() == direction)
            .copied()
            .collect();
        channels.sort();
        for channel in channels {
            if let Some(queue) = self.retunes.get_mut(&channel) {
                while let Some(entry) = queue.pop_due(now) {
                    due.push((channel, entry));
                }
            }
        }
        for (channel, entry) in due {
            let frequency = self.apply_tune(channel, &entry.quick_tune);
            trace!(
                channel = %channel,
                scheduled = entry.timestamp,
                applied_at = now,
                frequency,
                "Retune applied"
            );
            self.applied.push(AppliedRetune {
                channel,
                scheduled: entry.timestamp,
                applied_at: now,
                frequency,
            });
        }
    }

    /// Load `qt` into the front end; returns the resulting frequency.
    fn apply_tune(&mut self, channel: Channel, qt: &QuickTune) -> u64 {
        let rf_space = RegisterSpace::RfFrontEnd;
        let frequency = match qt {
            QuickTune::Lms(lms_qt) => {
                self.set(rf_space, regs::rf_addr(rf::QT_FREQSEL, channel), u64::from(lms_qt.freqsel));
                self.set(rf_space, regs::rf_addr(rf::QT_VCOCAP, channel), u64::from(lms_qt.vcocap));
                self.set(rf_space, regs::rf_addr(rf::QT_NINT, channel), u64::from(lms_qt.nint));
                self.set(rf_space, regs::rf_addr(rf::QT_NFRAC, channel), u64::from(lms_qt.nfrac));
                self.set(rf_space, regs::rf_addr(rf::QT_FLAGS, channel), u64::from(lms_qt.flags));
                self.set(RegisterSpace::Config, config::XB_GPIO, u64::from(lms_qt.xb_gpio));
                lms::frequency(lms_qt)
            }
            QuickTune::Rfic(rfic_qt) => {
                self.set(rf_space, regs::rf_addr(rf::QT_PROFILE, channel), u64::from(rfic_qt.nios_profile));
                self.set(rf_space, regs::rf_addr(rf::QT_RFFE, channel), u64::from(rfic_qt.rffe_profile));
                self.set(
                    rf_space,
                    regs::rf_addr(rf::QT_PORT, channel),
                    u64::from(rfic_qt.port) | u64::from(rfic_qt.spdt) << 8,
                );
                self.get(rf_space, rf::PROFILE + rfic_qt.nios_profile % rf::PROFILE_SLOTS)
            }
        };
        self.set(rf_space, regs::rf_addr(rf::FREQUENCY, channel), frequency);
        frequency
    }
}

// =============================================================================
// SimDevice
// =============================================================================

/// A simulated device attached to a [`crate::SimFleet`].
pub struct SimDevice {
    spec: DeviceSpec,
    instance: u32,
    hw: Mutex<Hardware>,
    bus: Arc<SignalBus>,
    claimed: AtomicBool,
    me: Weak<SimDevice>,
}

impl SimDevice {
    pub(crate) fn new(spec: DeviceSpec, instance: u32, bus: Arc<SignalBus>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            hw: Mutex::new(Hardware::power_on(&spec)),
            spec,
            instance,
            bus,
            claimed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn serial(&self) -> &str {
        &self.spec.serial
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.spec.faults
    }

    pub fn info(&self) -> DevInfo {
        DevInfo {
            backend: BackendKind::Sim,
            serial: self.spec.serial.clone(),
            usb_bus: Some(self.spec.usb_bus),
            usb_addr: Some(self.spec.usb_addr),
            instance: Some(self.instance),
            manufacturer: MANUFACTURER.to_string(),
            product: self.spec.product.product_name().to_string(),
        }
    }

    /// `true` while a backend holds the device open.
    pub fn is_open(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub(crate) fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    // =========================================================================
    // Registers
    // =========================================================================

    /// Current register value, bypassing the transport.
    pub fn register(&self, space: RegisterSpace, addr: u16) -> u64 {
        self.hw.lock().get(space, addr)
    }

    pub(crate) fn register_write(&self, space: RegisterSpace, addr: u16, value: u64) -> Result<()> {
        if space == RegisterSpace::Trigger {
            return self.trigger_write(addr, value);
        }
        if space == RegisterSpace::Config && addr == config::FPGA_SIZE {
            return Err(SdrError::invalid_argument(
                "register_write",
                format!("config register {:#x} is read-only", addr),
            ));
        }
        let mut hw = self.hw.lock();
        hw.set(space, addr, value);
        hw.write_log.push(RegisterWrite { space, addr, value });
        Ok(())
    }

    /// Host register writes in arrival order.
    pub fn write_log(&self) -> Vec<RegisterWrite> {
        self.hw.lock().write_log.clone()
    }

    pub fn clear_write_log(&self) {
        self.hw.lock().write_log.clear();
    }

    // =========================================================================
    // Clocks and retunes
    // =========================================================================

    pub fn clock(&self, direction: Direction) -> u64 {
        self.hw.lock().clocks[dir_index(direction)]
    }

    /// Let `samples` sample periods elapse on `direction`'s counter.
    pub fn advance_clock(&self, direction: Direction, samples: u64) {
        self.hw.lock().advance(direction, samples);
    }

    pub(crate) fn retune(&self, channel: Channel, timestamp: u64, qt: &QuickTune) -> Result<()> {
        let mut hw = self.hw.lock();
        hw.retunes
            .entry(channel)
            .or_insert_with(|| RetuneQueue::new(channel))
            .push(timestamp, *qt)?;
        hw.process_retunes(channel.direction());
        Ok(())
    }

    pub(crate) fn clear_retunes(&self, channel: Channel) -> usize {
        self.hw
            .lock()
            .retunes
            .get_mut(&channel)
            .map_or(0, RetuneQueue::clear)
    }

    pub fn pending_retunes(&self, channel: Channel) -> usize {
        self.hw.lock().retunes.get(&channel).map_or(0, RetuneQueue::len)
    }

    /// Retunes applied so far, oldest first.
    pub fn applied_retunes(&self) -> Vec<AppliedRetune> {
        self.hw.lock().applied.clone()
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    fn trigger_write(&self, addr: u16, value: u64) -> Result<()> {
        let (direction, signal) = trigger_target(addr).ok_or_else(|| {
            SdrError::invalid_argument("register_write", format!("no trigger at {:#x}", addr))
        })?;
        let armed = value & reg::ARM != 0;
        let master = value & reg::MASTER != 0;

        if armed {
            self.bus
                .join(signal, &self.spec.serial, direction, master, self.me.clone())?;
        } else {
            self.bus.leave(signal, &self.spec.serial, direction);
        }

        let drive = {
            let mut hw = self.hw.lock();
            let old = hw.get(RegisterSpace::Trigger, addr);
            let mut new = value & (reg::ARM | reg::FIRE | reg::MASTER);
            if armed && old & reg::ARM != 0 {
                new |= old & reg::LINE;
            }
            if !armed {
                hw.fired_at.remove(&(direction, signal));
            }
            hw.set(RegisterSpace::Trigger, addr, new);
            hw.write_log.push(RegisterWrite {
                space: RegisterSpace::Trigger,
                addr,
                value,
            });
            armed && master && value & reg::FIRE != 0 && old & reg::FIRE == 0
        };

        if drive {
            self.bus.drive(signal);
        }
        Ok(())
    }

    /// The line `signal` was asserted; latch it if `direction` is armed.
    pub(crate) fn latch(&self, signal: TriggerSignal, direction: Direction) {
        let addr = trigger_addr(direction, signal);
        let mut hw = self.hw.lock();
        let value = hw.get(RegisterSpace::Trigger, addr);
        if value & reg::ARM != 0 && value & reg::LINE == 0 {
            let now = hw.clocks[dir_index(direction)];
            hw.set(RegisterSpace::Trigger, addr, value | reg::LINE);
            hw.fired_at.insert((direction, signal), now);
            debug!(serial = %self.spec.serial, signal = %signal, timestamp = now, "Trigger latched");
        }
    }

    /// Counter value at which `direction` observed `signal`.
    pub fn fired_at(&self, direction: Direction, signal: TriggerSignal) -> Option<u64> {
        self.hw.lock().fired_at.get(&(direction, signal)).copied()
    }

    // =========================================================================
    // Sample flow
    // =========================================================================

    /// `true` if `direction` may move samples: a channel is enabled and no
    /// armed trigger is waiting for its line.
    pub(crate) fn flowing(&self, direction: Direction) -> bool {
        let hw = self.hw.lock();
        hw.fpga_loaded
            && hw.get(RegisterSpace::Config, config::ENABLE) & regs::enable_mask(direction) != 0
            && !hw.gated(direction)
    }

    /// Fill `buf` with received samples; returns the first sample's
    /// timestamp.
    pub(crate) fn receive(
        &self,
        buf: &mut [u8],
        format: SampleFormat,
        channels: usize,
        samples: usize,
    ) -> u64 {
        let mut hw = self.hw.lock();
        let ts = hw.clocks[0];
        let mux = RxMux::from_reg(hw.get(RegisterSpace::Config, config::RX_MUX))
            .unwrap_or(RxMux::Baseband);
        let bps = format.bytes_per_sample();

        match mux {
            RxMux::DigitalLoopback => {
                if hw.loopback.is_empty() {
                    buf.fill(0);
                } else {
                    for (dst, src) in buf.iter_mut().zip(hw.loopback.iter().cycle()) {
                        *dst = *src;
                    }
                }
            }
            RxMux::Counter32Bit => {
                for (i, sample) in buf.chunks_exact_mut(bps).enumerate() {
                    let value = (ts + i as u64) as u32;
                    sample.copy_from_slice(&value.to_le_bytes()[..bps]);
                }
            }
            RxMux::Counter12Bit => {
                for (i, sample) in buf.chunks_exact_mut(bps).enumerate() {
                    let n = ((ts + i as u64) & 0x7ff) as i16;
                    write_sample(sample, format, n, -n);
                }
            }
            RxMux::Baseband => {
                for (i, sample) in buf.chunks_exact_mut(bps).enumerate() {
                    let level = if ((ts + i as u64) / 16) % 2 == 0 { 1024 } else { -1024 };
                    write_sample(sample, format, level, 0);
                }
            }
        }

        hw.advance(Direction::Rx, (samples / channels.max(1)) as u64);
        ts
    }

    /// Transmit `data`; returns the counter value of the first sample.
    pub(crate) fn transmit(
        &self,
        data: &[u8],
        channels: usize,
        samples: usize,
        timestamp: Option<u64>,
    ) -> u64 {
        let mut hw = self.hw.lock();
        let now = hw.clocks[1];
        let start = timestamp.map_or(now, |t| t.max(now));
        hw.tx_log.push(TxRecord {
            timestamp,
            started_at: start,
            bytes: data.len(),
        });
        hw.loopback.clear();
        hw.loopback.extend_from_slice(data);
        let periods = (samples / channels.max(1)) as u64;
        hw.advance(Direction::Tx, start - now + periods);
        start
    }

    pub fn tx_log(&self) -> Vec<TxRecord> {
        self.hw.lock().tx_log.clone()
    }

    // =========================================================================
    // Control requests and images
    // =========================================================================

    pub(crate) fn control(&self, req: ControlRequest, data: &mut [u8]) -> Result<usize> {
        let reply = match req.request {
            request::GET_STRING if req.value == request::STRING_SERIAL => {
                self.spec.serial.clone().into_bytes()
            }
            request::QUERY_VERSION => {
                let version = match req.index {
                    0 => &self.spec.fw_version,
                    _ if !self.hw.lock().fpga_loaded => {
                        return Err(SdrError::invalid_state(
                            "control_transfer",
                            "FPGA is not configured",
                        ))
                    }
                    _ => &self.spec.fpga_version,
                };
                version.describe.clone().into_bytes()
            }
            request::QUERY_FPGA_STATUS => vec![u8::from(self.hw.lock().fpga_loaded)],
            other => {
                return Err(SdrError::invalid_argument(
                    "control_transfer",
                    format!("unknown request {:#04x}", other),
                ))
            }
        };
        let n = reply.len().min(data.len());
        data[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }

    pub(crate) fn load_fpga(&self, image: &[u8]) -> Result<()> {
        check_image("load_fpga", image)?;
        self.hw.lock().fpga_loaded = true;
        info!(serial = %self.spec.serial, bytes = image.len(), "FPGA configured");
        Ok(())
    }

    pub(crate) fn flash_fpga(&self, image: &[u8]) -> Result<()> {
        check_image("flash_fpga", image)?;
        self.hw.lock().fpga_flash = Some(image.to_vec());
        Ok(())
    }

    pub(crate) fn erase_flash(&self) {
        self.hw.lock().fpga_flash = None;
    }

    pub(crate) fn flash_firmware(&self, image: &[u8]) -> Result<()> {
        check_image("flash_firmware", image)?;
        self.hw.lock().firmware = Some(image.to_vec());
        Ok(())
    }

    /// Image currently stored for FPGA autoload.
    pub fn stored_fpga(&self) -> Option<Vec<u8>> {
        self.hw.lock().fpga_flash.clone()
    }

    pub fn stored_firmware(&self) -> Option<Vec<u8>> {
        self.hw.lock().firmware.clone()
    }

    pub fn is_fpga_loaded(&self) -> bool {
        self.hw.lock().fpga_loaded
    }

    /// Power-cycle the device. Registers, counters and queues return to
    /// their power-on state; a stored FPGA image is autoloaded.
    pub(crate) fn reset(&self) {
        let armed: Vec<(Direction, TriggerSignal)> = {
            let mut hw = self.hw.lock();
            let armed = hw
                .regs
                .iter()
                .filter(|((space, _), value)| {
                    *space == RegisterSpace::Trigger && *value & reg::ARM != 0
                })
                .filter_map(|((_, addr), _)| trigger_target(*addr))
                .collect();
            hw.load_defaults(&self.spec);
            hw.clocks = [0, 0];
            hw.retunes.clear();
            hw.fired_at.clear();
            hw.loopback.clear();
            hw.fpga_loaded = self.spec.fpga_loaded || hw.fpga_flash.is_some();
            hw.resets += 1;
            armed
        };
        for (direction, signal) in armed {
            self.bus.leave(signal, &self.spec.serial, direction);
        }
        info!(serial = %self.spec.serial, "Device reset");
    }

    pub fn resets(&self) -> u32 {
        self.hw.lock().resets
    }
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDevice")
            .field("serial", &self.spec.serial)
            .field("product", &self.spec.product)
            .field("open", &self.is_open())
            .finish()
    }
}

fn check_image(operation: &'static str, image: &[u8]) -> Result<()> {
    if image.is_empty() {
        return Err(SdrError::invalid_argument(operation, "image is empty"));
    }
    Ok(())
}

fn write_sample(out: &mut [u8], format: SampleFormat, i: i16, q: i16) {
    match format.bytes_per_sample() {
        4 => {
            out[..2].copy_from_slice(&i.to_le_bytes());
            out[2..4].copy_from_slice(&q.to_le_bytes());
        }
        _ => {
            out[0] = (i >> 4) as u8;
            out[1] = (q >> 4) as u8;
        }
    }
}
