//! Scheduled retune primitives.
//!
//! A retune is a `(timestamp, quick tune)` pair placed in a per-channel
//! queue. The device applies the earliest pending entry once its sample
//! counter reaches the entry's timestamp. [`RetuneQueue`] is the ordering
//! structure a device model (or firmware shim) keeps per channel.
//!
//! Entries whose timestamp has already passed when they are queued are
//! applied as soon as possible rather than rejected.

use crate::error::{Result, SdrError};
use crate::types::Channel;

/// Timestamp meaning "apply immediately".
pub const RETUNE_NOW: u64 = 0;

/// Entries a channel's hardware queue can hold.
pub const RETUNE_QUEUE_DEPTH: usize = 16;

/// Resolved PLL parameters of a direct-conversion transceiver with a
/// fractional-N synthesizer (single-channel board family).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LmsQuickTune {
    /// Divider selection (log2 of the VCO divider).
    pub freqsel: u8,
    /// VCO capacitor trim.
    pub vcocap: u8,
    /// Integer part of the feedback divider.
    pub nint: u16,
    /// 23-bit fractional part of the feedback divider.
    pub nfrac: u32,
    /// Band-select and related flags.
    pub flags: u8,
    /// Expansion-board filter GPIO state to apply alongside the tune.
    pub xb_gpio: u8,
}

/// Reference to a pre-computed tuning profile held by the RFIC firmware
/// (dual-channel board family).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RficQuickTune {
    /// Profile slot in the microcontroller's profile table.
    pub nios_profile: u16,
    /// Profile slot in the RFIC's fast-lock table.
    pub rffe_profile: u8,
    /// RF port selection.
    pub port: u8,
    /// SPDT switch state.
    pub spdt: u8,
}

/// Board-family specific, already-resolved tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuickTune {
    Lms(LmsQuickTune),
    Rfic(RficQuickTune),
}

impl QuickTune {
    pub fn family(&self) -> &'static str {
        match self {
            QuickTune::Lms(_) => "lms",
            QuickTune::Rfic(_) => "rfic",
        }
    }
}

/// One pending scheduled retune.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetuneEntry {
    pub timestamp: u64,
    pub quick_tune: QuickTune,
    /// Submission order; breaks timestamp ties.
    pub seq: u64,
}

/// Timestamp-ordered queue of pending retunes for one channel.
///
/// Entries are kept sorted by `(timestamp, seq)` so that equal timestamps
/// apply in submission order and earlier timestamps always apply first,
/// whatever order they were submitted in.
#[derive(Debug)]
pub struct RetuneQueue {
    channel: Channel,
    depth: usize,
    entries: Vec<RetuneEntry>,
    next_seq: u64,
}

impl RetuneQueue {
    pub fn new(channel: Channel) -> Self {
        Self::with_depth(channel, RETUNE_QUEUE_DEPTH)
    }

    pub fn with_depth(channel: Channel, depth: usize) -> Self {
        Self {
            channel,
            depth,
            entries: Vec::with_capacity(depth),
            next_seq: 0,
        }
    }

    /// Insert an entry; fails with [`SdrError::QueueFull`] when the queue
    /// already holds `depth` entries.
    pub fn push(&mut self, timestamp: u64, quick_tune: QuickTune) -> Result<()> {
        if self.entries.len() >= self.depth {
            return Err(SdrError::QueueFull {
                channel: self.channel,
                depth: self.depth,
            });
        }
        let entry = RetuneEntry {
            timestamp,
            quick_tune,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let pos = self
            .entries
            .partition_point(|e| (e.timestamp, e.seq) <= (entry.timestamp, entry.seq));
        self.entries.insert(pos, entry);
        Ok(())
    }

    /// Remove and return the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: u64) -> Option<RetuneEntry> {
        match self.entries.first() {
            Some(first) if first.timestamp <= now => Some(self.entries.remove(0)),
            _ => None,
        }
    }

    /// Drop every pending entry, returning how many were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Timestamp of the next entry to apply.
    pub fn next_due(&self) -> Option<u64> {
        self.entries.first().map(|e| e.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qt(profile: u16) -> QuickTune {
        QuickTune::Rfic(RficQuickTune {
            nios_profile: profile,
            rffe_profile: 0,
            port: 0,
            spdt: 0,
        })
    }

    fn drain(queue: &mut RetuneQueue, now: u64) -> Vec<u64> {
        std::iter::from_fn(|| queue.pop_due(now))
            .map(|e| e.timestamp)
            .collect()
    }

    #[test]
    fn test_out_of_order_submission_applies_in_timestamp_order() {
        let mut queue = RetuneQueue::new(Channel::RX0);
        queue.push(100, qt(1)).unwrap();
        queue.push(50, qt(2)).unwrap();
        queue.push(75, qt(3)).unwrap();

        assert_eq!(queue.next_due(), Some(50));
        assert!(queue.pop_due(49).is_none());
        assert_eq!(drain(&mut queue, 1000), vec![50, 75, 100]);
    }

    #[test]
    fn test_equal_timestamps_keep_submission_order() {
        let mut queue = RetuneQueue::new(Channel::TX0);
        queue.push(10, qt(1)).unwrap();
        queue.push(10, qt(2)).unwrap();
        let first = queue.pop_due(10).unwrap();
        let second = queue.pop_due(10).unwrap();
        assert_eq!(first.quick_tune, qt(1));
        assert_eq!(second.quick_tune, qt(2));
    }

    #[test]
    fn test_queue_full() {
        let mut queue = RetuneQueue::with_depth(Channel::RX1, 2);
        queue.push(1, qt(0)).unwrap();
        queue.push(2, qt(0)).unwrap();
        let err = queue.push(3, qt(0)).unwrap_err();
        assert!(matches!(err, SdrError::QueueFull { depth: 2, .. }));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_clear() {
        let mut queue = RetuneQueue::new(Channel::RX0);
        queue.push(100, qt(0)).unwrap();
        queue.push(200, qt(1)).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert!(queue.pop_due(u64::MAX).is_none());
    }
}
