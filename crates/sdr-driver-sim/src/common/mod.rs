//! Shared infrastructure for the simulator.
//!
//! - **faults**: fault injection plans
//! - **rng**: seeded random number generator

pub mod faults;
pub mod rng;

pub use faults::{FaultPlan, FaultScenario};
pub use rng::SimRng;
