//! Trigger signal lines shared by the devices of one fleet.
//!
//! Each line has at most one master. Armed devices register as listeners;
//! when the master fires, every listener latches the line with its own
//! sample counter.

use crate::hardware::SimDevice;
use parking_lot::Mutex;
use sdr_core::{Direction, Result, SdrError, TriggerSignal};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

#[derive(Default)]
struct Line {
    master: Option<(String, Direction)>,
    listeners: Vec<Listener>,
}

struct Listener {
    serial: String,
    direction: Direction,
    device: Weak<SimDevice>,
}

/// Shared trigger lines.
#[derive(Default)]
pub struct SignalBus {
    lines: Mutex<HashMap<TriggerSignal, Line>>,
}

impl SignalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `serial`'s `direction` as armed on `signal`, as master or
    /// slave. A second master on the same line is rejected.
    pub(crate) fn join(
        &self,
        signal: TriggerSignal,
        serial: &str,
        direction: Direction,
        master: bool,
        device: Weak<SimDevice>,
    ) -> Result<()> {
        let mut lines = self.lines.lock();
        let line = lines.entry(signal).or_default();
        let owns = matches!(&line.master, Some((s, d)) if s == serial && *d == direction);
        if master {
            if let Some((owner, dir)) = &line.master {
                if !owns {
                    return Err(SdrError::invalid_state(
                        "trigger_arm",
                        format!("{} already has master {} {}", signal, owner, dir),
                    ));
                }
            }
            line.master = Some((serial.to_string(), direction));
        } else if owns {
            line.master = None;
        }

        line.listeners
            .retain(|l| !(l.serial == serial && l.direction == direction));
        line.listeners.push(Listener {
            serial: serial.to_string(),
            direction,
            device,
        });
        Ok(())
    }

    /// Drop `serial`'s participation in `signal`, including mastership.
    pub(crate) fn leave(&self, signal: TriggerSignal, serial: &str, direction: Direction) {
        let mut lines = self.lines.lock();
        if let Some(line) = lines.get_mut(&signal) {
            line.listeners
                .retain(|l| !(l.serial == serial && l.direction == direction));
            if matches!(&line.master, Some((s, d)) if s == serial && *d == direction) {
                line.master = None;
            }
        }
    }

    /// Assert `signal`. Every listener latches it.
    ///
    /// Must be called without any device lock held.
    pub(crate) fn drive(&self, signal: TriggerSignal) {
        let targets: Vec<(Arc<SimDevice>, Direction)> = {
            let lines = self.lines.lock();
            match lines.get(&signal) {
                Some(line) => line
                    .listeners
                    .iter()
                    .filter_map(|l| l.device.upgrade().map(|d| (d, l.direction)))
                    .collect(),
                None => Vec::new(),
            }
        };
        debug!(signal = %signal, listeners = targets.len(), "Trigger line asserted");
        for (device, direction) in targets {
            device.latch(signal, direction);
        }
    }

    /// Current master of `signal`, if any.
    pub fn master(&self, signal: TriggerSignal) -> Option<String> {
        self.lines
            .lock()
            .get(&signal)
            .and_then(|l| l.master.as_ref().map(|(s, _)| s.clone()))
    }

    /// Number of devices listening on `signal`.
    pub fn listeners(&self, signal: TriggerSignal) -> usize {
        self.lines
            .lock()
            .get(&signal)
            .map_or(0, |l| l.listeners.len())
    }
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("lines", &self.lines.lock().len())
            .finish()
    }
}
