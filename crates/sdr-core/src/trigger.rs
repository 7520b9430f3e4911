//! Trigger signals, descriptors and the register protocol shared by boards.
//!
//! A trigger couples the start of sample flow on several devices to one
//! physical signal line. Per descriptor the handle walks
//!
//! ```text
//!  UNINITIALIZED --init--> INITIALIZED --arm--> ARMED --fire--> FIRED
//!        ^                                        |               |
//!        +----------------- disarm ---------------+---------------+
//! ```
//!
//! Exactly one device in a group is the master; its fire drives the line and
//! every armed slave observes it. The hardware copy of the state is
//! authoritative; a [`Trigger`] is only a token naming a binding on one
//! handle.

use crate::types::{Channel, Direction};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical or logical line a trigger is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TriggerSignal {
    /// J71 pin 4 (single-channel boards).
    J71_4,
    /// J51 pin 1 (dual-channel boards).
    J51_1,
    /// Mini expansion header pin 1.
    MiniExp1,
    User0,
    User1,
    User2,
    User3,
    User4,
    User5,
    User6,
    User7,
}

impl TriggerSignal {
    pub const ALL: [TriggerSignal; 11] = [
        TriggerSignal::J71_4,
        TriggerSignal::J51_1,
        TriggerSignal::MiniExp1,
        TriggerSignal::User0,
        TriggerSignal::User1,
        TriggerSignal::User2,
        TriggerSignal::User3,
        TriggerSignal::User4,
        TriggerSignal::User5,
        TriggerSignal::User6,
        TriggerSignal::User7,
    ];

    /// Line number used in the trigger register map.
    pub fn code(self) -> u8 {
        match self {
            TriggerSignal::J71_4 => 0,
            TriggerSignal::J51_1 => 1,
            TriggerSignal::MiniExp1 => 2,
            TriggerSignal::User0 => 128,
            TriggerSignal::User1 => 129,
            TriggerSignal::User2 => 130,
            TriggerSignal::User3 => 131,
            TriggerSignal::User4 => 132,
            TriggerSignal::User5 => 133,
            TriggerSignal::User6 => 134,
            TriggerSignal::User7 => 135,
        }
    }

    pub fn is_user(self) -> bool {
        self.code() >= 128
    }
}

impl fmt::Display for TriggerSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Role a device plays on the signal line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRole {
    /// Drives the line when fired.
    Master,
    /// Observes the line.
    Slave,
    /// Not participating; cannot be armed.
    #[default]
    Disabled,
}

/// Trigger descriptor returned by `trigger_init`.
///
/// The caller sets [`Trigger::role`] before arming. The binding number ties
/// the token to one initialization on one handle; a token whose binding has
/// been released (by disarm or re-init) reads back as uninitialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Trigger {
    pub channel: Channel,
    pub signal: TriggerSignal,
    pub role: TriggerRole,
    /// Reserved; carried through unchanged.
    pub options: u64,
    binding: u64,
}

impl Trigger {
    /// Descriptor for a live binding. Issued by the device handle.
    pub fn bound(channel: Channel, signal: TriggerSignal, binding: u64) -> Self {
        Self {
            channel,
            signal,
            role: TriggerRole::Disabled,
            options: 0,
            binding,
        }
    }

    /// Descriptor that refers to no binding.
    pub fn unbound(channel: Channel, signal: TriggerSignal) -> Self {
        Self::bound(channel, signal, 0)
    }

    pub fn binding(&self) -> u64 {
        self.binding
    }
}

/// Observed trigger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerState {
    pub armed: bool,
    pub fired: bool,
    pub fire_requested: bool,
    /// Reserved; zero unless a board documents otherwise.
    pub resv1: u64,
    /// Reserved; zero unless a board documents otherwise.
    pub resv2: u64,
}

/// Host-side lifecycle phase of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerPhase {
    Uninitialized,
    Initialized,
    Armed,
    Fired,
}

impl fmt::Display for TriggerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TriggerPhase::Uninitialized => "UNINITIALIZED",
            TriggerPhase::Initialized => "INITIALIZED",
            TriggerPhase::Armed => "ARMED",
            TriggerPhase::Fired => "FIRED",
        };
        write!(f, "{}", label)
    }
}

// =============================================================================
// Register protocol
// =============================================================================

/// Trigger control register bits.
pub mod reg {
    /// Device participates in the trigger.
    pub const ARM: u64 = 1 << 0;
    /// Master requests the line to be asserted.
    pub const FIRE: u64 = 1 << 1;
    /// Device drives the line.
    pub const MASTER: u64 = 1 << 2;
    /// Line has been observed asserted while armed (read-only).
    pub const LINE: u64 = 1 << 3;
}

/// Address of the trigger control register for `channel`'s direction and
/// `signal` in the trigger register space.
pub fn register_address(channel: Channel, signal: TriggerSignal) -> u16 {
    let dir: u16 = match channel.direction() {
        Direction::Rx => 0,
        Direction::Tx => 1,
    };
    (dir << 8) | u16::from(signal.code())
}

/// Decode a trigger control register value.
pub fn decode_state(value: u64) -> TriggerState {
    TriggerState {
        armed: value & reg::ARM != 0,
        fired: value & reg::LINE != 0,
        fire_requested: value & reg::FIRE != 0,
        resv1: 0,
        resv2: 0,
    }
}
