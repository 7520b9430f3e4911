//! Scheduled retunes on the device handle.
//!
//! The host only resolves and enqueues; the device applies each entry when
//! its sample counter reaches the entry's timestamp, earliest first.

use super::Device;
use sdr_core::{Capabilities, Channel, QuickTune, Result};
use tracing::debug;

impl Device {
    /// Resolved tuning parameters of `channel`'s current frequency, for
    /// replay through [`Device::schedule_retune`].
    pub fn get_quick_tune(&self, channel: Channel) -> Result<QuickTune> {
        self.with_capability("get_quick_tune", Capabilities::QUICK_TUNE, |bound| {
            bound.board.get_quick_tune(channel)
        })
    }

    /// Retune `channel` when its direction's counter reaches `timestamp`.
    ///
    /// A supplied `quick_tune` is applied verbatim and `frequency` is
    /// ignored; otherwise the board resolves `frequency`. A timestamp of
    /// [`sdr_core::RETUNE_NOW`], or one that has already passed, applies as
    /// soon as possible.
    pub fn schedule_retune(
        &self,
        channel: Channel,
        timestamp: u64,
        frequency: u64,
        quick_tune: Option<&QuickTune>,
    ) -> Result<()> {
        self.with_capability(
            "schedule_retune",
            Capabilities::SCHEDULED_RETUNE,
            |bound| {
                if quick_tune.is_some() {
                    bound.require(Capabilities::QUICK_TUNE, "schedule_retune")?;
                }
                bound
                    .board
                    .schedule_retune(channel, timestamp, frequency, quick_tune)?;
                debug!(
                    channel = %channel,
                    timestamp,
                    frequency,
                    quick_tune = quick_tune.is_some(),
                    "Retune scheduled"
                );
                Ok(())
            },
        )
    }

    /// Drop every retune still pending on `channel`. Returns how many were
    /// removed; retunes already applied are unaffected.
    pub fn cancel_scheduled_retunes(&self, channel: Channel) -> Result<usize> {
        self.with_capability(
            "cancel_scheduled_retunes",
            Capabilities::SCHEDULED_RETUNE,
            |bound| bound.board.cancel_scheduled_retunes(channel),
        )
    }
}
