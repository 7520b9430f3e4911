//! # sdrhal
//!
//! Device-handle dispatch layer for software-defined-radio hardware.
//!
//! Application code talks to a [`Device`]. The handle forwards each call to
//! the board driver and transport backend chosen when the device was
//! opened, serializing control-plane calls while letting sample streams
//! run independently.
//!
//! ## Crate Structure
//!
//! - **`device`**: the [`Device`] handle: open/close, property dispatch,
//!   stream lifecycle, trigger state machine, scheduled retunes and
//!   expansion boards.
//! - **`registry`**: the [`Registry`] of backend and board factories
//!   consulted by [`Device::open`].
//! - **`config`**: [`HalConfig`], loaded from TOML and `SDRHAL_*`
//!   environment variables.
//! - **`logging`**: tracing subscriber setup.
//!
//! Shared types, the capability traits and the stream engine live in
//! `sdr-core` and are re-exported here. `sdr-driver-sim` supplies a
//! simulated backend and two board variants.
//!
//! ## Example
//! ```no_run
//! use sdrhal::{Channel, Device, Registry};
//! use sdr_driver_sim::{DeviceSpec, SimFleet};
//!
//! # fn main() -> sdrhal::Result<()> {
//! let fleet = SimFleet::with_devices([DeviceSpec::rev1("a1b2c3")]);
//! let registry = Registry::simulated(&fleet);
//!
//! let device = Device::open(&registry, "sim:serial=a1b2")?;
//! device.set_frequency(Channel::RX0, 915_000_000)?;
//! device.set_sample_rate(Channel::RX0, 2_000_000)?;
//! device.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod logging;
pub mod registry;

pub use config::{ConfigError, HalConfig};
pub use device::Device;
pub use registry::Registry;

pub use sdr_core::stream::callback;
pub use sdr_core::{
    BackendKind, BoardDriver, BoardFactory, BackendFactory, BufferStatus, Capabilities, Channel,
    ChannelLayout, Correction, DevInfo, DevSpeed, Direction, ErrorKind, FpgaSize, GainMode,
    LmsQuickTune, MetaFlags, MetaStatus, Metadata, QuickTune, RationalRate, Result, RficQuickTune,
    RxMux, SampleFormat, Sampling, SdrError, SmbMode, Stream, StreamAction, StreamCallback,
    StreamConfig, StreamEvent, StreamStats, SyncStream, TransportBackend, Trigger, TriggerPhase,
    TriggerRole, TriggerSignal, TriggerState, TuningMode, Version, Xb, RETUNE_NOW,
};
