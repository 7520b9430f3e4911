//! Fault injection for simulated devices.
//!
//! A [`FaultPlan`] is attached to a [`crate::SimDevice`] and consulted by
//! the simulated backend before every control operation and bulk transfer.
//! Injected failures surface as transport errors (or failed transfers), the
//! same way a real I/O failure would.

use super::rng::SimRng;
use parking_lot::Mutex;
use sdr_core::{Direction, SdrError};
use std::collections::HashMap;
use std::sync::Arc;

/// Operation names checked by the simulated backend.
pub mod op {
    pub const CONTROL: &str = "control_transfer";
    pub const REGISTER_READ: &str = "register_read";
    pub const REGISTER_WRITE: &str = "register_write";
    pub const RETUNE: &str = "retune";
    pub const TRANSFER: &str = "transfer";
    pub const IMAGE: &str = "image";
}

/// A specific failure scenario.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultScenario {
    /// Let `count` operations succeed, then fail every later one.
    FailAfterN { operation: &'static str, count: u32 },
    /// Transfers of `direction` are accepted but never complete until
    /// cancelled.
    StallTransfers { direction: Direction },
    /// The device drops off the bus: every operation fails from the first
    /// check on.
    Disconnect,
}

#[derive(Debug, Default)]
struct FaultState {
    counts: HashMap<&'static str, u32>,
    disconnected: bool,
}

/// Fault configuration; clones share counters.
#[derive(Clone, Debug)]
pub struct FaultPlan {
    failure_rates: Arc<HashMap<&'static str, f64>>,
    scenarios: Arc<Vec<FaultScenario>>,
    rng: Arc<SimRng>,
    state: Arc<Mutex<FaultState>>,
}

impl FaultPlan {
    /// No faults.
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    pub fn scenario(scenario: FaultScenario) -> Self {
        Self::build(HashMap::new(), vec![scenario], None)
    }

    pub fn scenarios(scenarios: Vec<FaultScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Fail every operation with probability `rate`, reproducibly for a
    /// given `seed`.
    pub fn random_failures_seeded(rate: f64, seed: u64) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), Some(seed))
    }

    /// Per-operation failure rates (`"*"` applies to every operation).
    pub fn with_rates(rates: HashMap<&'static str, f64>, seed: u64) -> Self {
        Self::build(rates, Vec::new(), Some(seed))
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<FaultScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(SimRng::new(seed)),
            state: Arc::new(Mutex::new(FaultState::default())),
        }
    }

    /// Decide whether `operation` fails on `device`.
    pub fn check(&self, device: &str, operation: &'static str) -> Result<(), SdrError> {
        let mut state = self.state.lock();

        if state.disconnected {
            return Err(SdrError::transport(
                operation,
                format!("{} is disconnected", device),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                FaultScenario::Disconnect => {
                    state.disconnected = true;
                    return Err(SdrError::transport(
                        operation,
                        format!("{} is disconnected", device),
                    ));
                }
                FaultScenario::FailAfterN { operation: op, count } if *op == operation => {
                    let current = state.counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(SdrError::transport(
                            operation,
                            format!("injected failure after {} operations", count),
                        ));
                    }
                }
                _ => {}
            }
        }
        drop(state);

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.should_fail(rate) {
            return Err(SdrError::transport(
                operation,
                format!("random failure on {}", device),
            ));
        }
        Ok(())
    }

    /// `true` if transfers of `direction` are stalled.
    pub fn stalls(&self, direction: Direction) -> bool {
        self.scenarios.iter().any(
            |s| matches!(s, FaultScenario::StallTransfers { direction: d } if *d == direction),
        )
    }

    /// Clear counters and reconnect.
    pub fn reset(&self) {
        *self.state.lock() = FaultState::default();
    }
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdr_core::ErrorKind;

    #[test]
    fn test_no_faults() {
        let plan = FaultPlan::none();
        for _ in 0..100 {
            assert!(plan.check("sim", op::CONTROL).is_ok());
        }
        assert!(!plan.stalls(Direction::Rx));
    }

    #[test]
    fn test_fail_after_n() {
        let plan = FaultPlan::scenario(FaultScenario::FailAfterN {
            operation: op::TRANSFER,
            count: 3,
        });
        for _ in 0..3 {
            assert!(plan.check("sim", op::TRANSFER).is_ok());
        }
        let err = plan.check("sim", op::TRANSFER).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(plan.check("sim", op::CONTROL).is_ok());

        plan.reset();
        assert!(plan.check("sim", op::TRANSFER).is_ok());
    }

    #[test]
    fn test_disconnect_is_sticky() {
        let plan = FaultPlan::scenario(FaultScenario::Disconnect);
        assert!(plan.check("sim", op::CONTROL).is_err());
        assert!(plan.check("sim", op::REGISTER_READ).is_err());
    }

    #[test]
    fn test_random_failures_are_reproducible() {
        let run = |seed| {
            let plan = FaultPlan::random_failures_seeded(0.5, seed);
            (0..64)
                .map(|_| plan.check("sim", op::TRANSFER).is_err())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
        let failures = run(42).iter().filter(|f| **f).count();
        assert!(failures > 10 && failures < 54, "got {} failures", failures);
    }

    #[test]
    fn test_stall_scenario() {
        let plan = FaultPlan::scenario(FaultScenario::StallTransfers {
            direction: Direction::Tx,
        });
        assert!(plan.stalls(Direction::Tx));
        assert!(!plan.stalls(Direction::Rx));
    }
}
