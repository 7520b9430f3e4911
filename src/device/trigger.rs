//! Trigger lifecycle on the device handle.
//!
//! The handle keeps the host-side phase of every bound signal:
//!
//! ```text
//! UNINITIALIZED --init--> INITIALIZED --arm--> ARMED --fire--> FIRED
//!       ^                      |                 |               |
//!       +--------disarm--------+-----------------+---------------+
//! ```
//!
//! A [`Trigger`] descriptor carries the generation of the binding it was
//! issued for. Once that binding is released, the descriptor reads back as
//! uninitialized even if the signal has since been bound again.

use super::Device;
use sdr_core::{
    Capabilities, Channel, Result, SdrError, Trigger, TriggerPhase, TriggerRole, TriggerSignal,
    TriggerState,
};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Binding {
    channel: Channel,
    generation: u64,
    phase: TriggerPhase,
    role: TriggerRole,
}

/// Live signal bindings of one handle. A signal is bound at most once.
#[derive(Debug, Default)]
pub(super) struct TriggerTable {
    next_generation: u64,
    bindings: HashMap<TriggerSignal, Binding>,
}

impl TriggerTable {
    fn bind(&mut self, channel: Channel, signal: TriggerSignal) -> Result<Trigger> {
        if let Some(existing) = self.bindings.get(&signal) {
            return Err(SdrError::invalid_state(
                "trigger_init",
                format!("{} is already bound to {}", signal, existing.channel),
            ));
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.bindings.insert(
            signal,
            Binding {
                channel,
                generation,
                phase: TriggerPhase::Initialized,
                role: TriggerRole::Disabled,
            },
        );
        Ok(Trigger::bound(channel, signal, generation))
    }

    /// The live binding `trigger` was issued for.
    fn lookup(&mut self, trigger: &Trigger) -> Option<&mut Binding> {
        self.bindings.get_mut(&trigger.signal).filter(|b| {
            trigger.binding() != 0
                && b.generation == trigger.binding()
                && b.channel == trigger.channel
        })
    }

    fn phase(&mut self, trigger: &Trigger) -> TriggerPhase {
        self.lookup(trigger)
            .map_or(TriggerPhase::Uninitialized, |b| b.phase)
    }

    fn release(&mut self, signal: TriggerSignal) {
        self.bindings.remove(&signal);
    }

    /// Remove every binding; descriptors for armed ones are returned so the
    /// hardware can be disarmed.
    pub(super) fn drain_armed(&mut self) -> Vec<Trigger> {
        self.bindings
            .drain()
            .filter(|(_, b)| matches!(b.phase, TriggerPhase::Armed | TriggerPhase::Fired))
            .map(|(signal, b)| {
                let mut trigger = Trigger::bound(b.channel, signal, b.generation);
                trigger.role = b.role;
                trigger
            })
            .collect()
    }

    pub(super) fn clear(&mut self) {
        self.bindings.clear();
    }
}

fn not_initialized(operation: &'static str, trigger: &Trigger) -> SdrError {
    SdrError::invalid_state(
        operation,
        format!("{} on {} is not initialized", trigger.signal, trigger.channel),
    )
}

impl Device {
    /// Bind `signal` to `channel` and return its descriptor.
    ///
    /// Set the descriptor's `role` before arming. Fails with invalid-state
    /// if the signal is already bound on this handle.
    pub fn trigger_init(&self, channel: Channel, signal: TriggerSignal) -> Result<Trigger> {
        self.with_capability("trigger_init", Capabilities::TRIGGERS, |bound| {
            if let Some(existing) = bound.triggers.bindings.get(&signal) {
                return Err(SdrError::invalid_state(
                    "trigger_init",
                    format!("{} is already bound to {}", signal, existing.channel),
                ));
            }
            bound.board.trigger_init(channel, signal)?;
            let trigger = bound.triggers.bind(channel, signal)?;
            debug!(channel = %channel, signal = %signal, binding = trigger.binding(), "Trigger initialized");
            Ok(trigger)
        })
    }

    /// Arm (`arm = true`) an initialized trigger in its descriptor's role,
    /// or disarm it. Disarming releases the binding; the descriptor then
    /// reads back as uninitialized.
    ///
    /// The reserved values are passed to the board untouched.
    pub fn trigger_arm(&self, trigger: &Trigger, arm: bool, resv1: u64, resv2: u64) -> Result<()> {
        self.with_capability("trigger_arm", Capabilities::TRIGGERS, |bound| {
            let phase = bound.triggers.phase(trigger);
            if arm {
                if phase != TriggerPhase::Initialized {
                    return Err(match phase {
                        TriggerPhase::Uninitialized => not_initialized("trigger_arm", trigger),
                        _ => SdrError::invalid_state(
                            "trigger_arm",
                            format!("{} is {}", trigger.signal, phase),
                        ),
                    });
                }
                if trigger.role == TriggerRole::Disabled {
                    return Err(SdrError::invalid_argument(
                        "trigger_arm",
                        "set the descriptor's role to Master or Slave before arming",
                    ));
                }
                bound.board.trigger_arm(trigger, true, resv1, resv2)?;
                if let Some(binding) = bound.triggers.lookup(trigger) {
                    binding.phase = TriggerPhase::Armed;
                    binding.role = trigger.role;
                }
                debug!(signal = %trigger.signal, role = ?trigger.role, "Trigger armed");
            } else {
                if phase == TriggerPhase::Uninitialized {
                    return Err(not_initialized("trigger_arm", trigger));
                }
                bound.board.trigger_arm(trigger, false, resv1, resv2)?;
                bound.triggers.release(trigger.signal);
                debug!(signal = %trigger.signal, "Trigger disarmed");
            }
            Ok(())
        })
    }

    /// Assert the signal line. Only the armed master may fire; firing an
    /// already fired trigger does nothing.
    pub fn trigger_fire(&self, trigger: &Trigger) -> Result<()> {
        self.with_capability("trigger_fire", Capabilities::TRIGGERS, |bound| {
            let binding = bound
                .triggers
                .lookup(trigger)
                .copied()
                .ok_or_else(|| not_initialized("trigger_fire", trigger))?;
            match binding.phase {
                TriggerPhase::Fired => {
                    debug!(signal = %trigger.signal, "Trigger already fired");
                    return Ok(());
                }
                TriggerPhase::Armed => {}
                phase => {
                    return Err(SdrError::invalid_state(
                        "trigger_fire",
                        format!("{} is {}, not ARMED", trigger.signal, phase),
                    ))
                }
            }
            if binding.role != TriggerRole::Master {
                return Err(SdrError::invalid_state(
                    "trigger_fire",
                    format!("{} is armed as {:?}; only the master fires", trigger.signal, binding.role),
                ));
            }

            let mut armed = *trigger;
            armed.role = binding.role;
            bound.board.trigger_fire(&armed)?;
            if let Some(binding) = bound.triggers.lookup(trigger) {
                binding.phase = TriggerPhase::Fired;
            }
            debug!(signal = %trigger.signal, "Trigger fired");
            Ok(())
        })
    }

    /// Observe the hardware state without changing it. A descriptor with no
    /// live binding reports all-false.
    pub fn trigger_state(&self, trigger: &Trigger) -> Result<TriggerState> {
        self.with_bound("trigger_state", |bound| {
            if bound.triggers.lookup(trigger).is_none() {
                return Ok(TriggerState::default());
            }
            bound.board.trigger_state(trigger)
        })
    }

    /// Host-side phase of the descriptor. A slave stays ARMED here; its
    /// hardware latch shows up in [`Device::trigger_state`].
    pub fn trigger_phase(&self, trigger: &Trigger) -> Result<TriggerPhase> {
        self.with_bound("trigger_phase", |bound| Ok(bound.triggers.phase(trigger)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_is_exclusive_per_signal() {
        let mut table = TriggerTable::default();
        let first = table.bind(Channel::RX0, TriggerSignal::User0).unwrap();
        assert_eq!(table.phase(&first), TriggerPhase::Initialized);

        let err = table.bind(Channel::TX0, TriggerSignal::User0).unwrap_err();
        assert!(err.is_invalid_state());
        assert!(table.bind(Channel::RX0, TriggerSignal::User1).is_ok());
    }

    #[test]
    fn test_stale_descriptor_reads_uninitialized() {
        let mut table = TriggerTable::default();
        let old = table.bind(Channel::RX0, TriggerSignal::J71_4).unwrap();
        table.release(TriggerSignal::J71_4);
        let new = table.bind(Channel::RX0, TriggerSignal::J71_4).unwrap();

        assert_ne!(old.binding(), new.binding());
        assert_eq!(table.phase(&old), TriggerPhase::Uninitialized);
        assert_eq!(table.phase(&new), TriggerPhase::Initialized);

        let forged = Trigger::unbound(Channel::RX0, TriggerSignal::J71_4);
        assert_eq!(table.phase(&forged), TriggerPhase::Uninitialized);
    }

    #[test]
    fn test_drain_returns_only_armed() {
        let mut table = TriggerTable::default();
        let idle = table.bind(Channel::RX0, TriggerSignal::User0).unwrap();
        let armed = table.bind(Channel::RX0, TriggerSignal::User1).unwrap();
        if let Some(binding) = table.lookup(&armed) {
            binding.phase = TriggerPhase::Armed;
            binding.role = TriggerRole::Slave;
        }

        let drained = table.drain_armed();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].signal, TriggerSignal::User1);
        assert_eq!(drained[0].role, TriggerRole::Slave);
        assert_eq!(table.phase(&idle), TriggerPhase::Uninitialized);
    }
}
