//! Per-call timestamp metadata for the synchronous stream interface.

use bitflags::bitflags;

bitflags! {
    /// Request flags supplied by the caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MetaFlags: u32 {
        /// First sample of a TX burst.
        const TX_BURST_START      = 1 << 0;
        /// Last sample of a TX burst; the burst is flushed.
        const TX_BURST_END        = 1 << 1;
        /// Transmit the burst as soon as possible, ignoring `timestamp`.
        const TX_NOW              = 1 << 2;
        /// Re-anchor the burst at `timestamp` mid-burst.
        const TX_UPDATE_TIMESTAMP = 1 << 3;
        /// Receive from the next available sample, ignoring `timestamp`.
        const RX_NOW              = 1u32 << 31;
    }
}

bitflags! {
    /// Conditions reported back to the caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MetaStatus: u32 {
        /// Samples were lost between the previous call and this one.
        const OVERRUN  = 1 << 0;
        /// The transmitter ran dry.
        const UNDERRUN = 1 << 1;
    }
}

/// Timestamp metadata exchanged with `sync_rx` / `sync_tx`.
///
/// Only honored when the stream was configured with a `*Meta` sample format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metadata {
    /// Device timestamp of the first sample (RX: reported; TX: requested).
    pub timestamp: u64,
    pub flags: MetaFlags,
    pub status: MetaStatus,
    /// Samples actually transferred by the call.
    pub actual_count: usize,
}

impl Metadata {
    /// RX metadata asking for the next available samples.
    pub fn rx_now() -> Self {
        Self {
            flags: MetaFlags::RX_NOW,
            ..Self::default()
        }
    }

    /// RX metadata asking for samples starting at `timestamp`.
    pub fn rx_at(timestamp: u64) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    /// A complete TX burst scheduled at `timestamp`.
    pub fn tx_burst_at(timestamp: u64) -> Self {
        Self {
            timestamp,
            flags: MetaFlags::TX_BURST_START | MetaFlags::TX_BURST_END,
            ..Self::default()
        }
    }
}
