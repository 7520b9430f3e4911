//! Simulated transport backend and board drivers.
//!
//! [`SimFleet`] models a set of devices on one bus. Each [`SimDevice`]
//! has a register file, per-direction sample clocks, hardware retune
//! queues and trigger lines wired to a shared [`SignalBus`], so a master
//! on one device can release slaves on another.
//!
//! [`SimUsbFactory`] enumerates and opens fleet devices as
//! [`sdr_core::TransportBackend`]s. [`boards::board_factories`] returns the
//! board drivers that layer product semantics on top.
//!
//! ```no_run
//! use sdr_driver_sim::{DeviceSpec, SimFleet};
//!
//! let fleet = SimFleet::with_devices([DeviceSpec::rev1("a1b2c3")]);
//! let factory = fleet.factory();
//! # let _ = factory;
//! ```

pub mod backend;
pub mod boards;
pub mod bus;
pub mod common;
pub mod fleet;
pub mod hardware;
pub mod lms;
pub mod regs;

pub use backend::SimUsbBackend;
pub use boards::{board_factories, Rev1Board, Rev1Factory, Rev2Board, Rev2Factory};
pub use bus::SignalBus;
pub use common::{FaultPlan, FaultScenario, SimRng};
pub use fleet::{SimFleet, SimUsbFactory};
pub use hardware::{AppliedRetune, DeviceSpec, RegisterWrite, SimDevice, SimProduct, TxRecord};
