//! Stream lifecycle on the device handle.
//!
//! Construction goes through the board under the control lock. Everything
//! after that (run, submit, sync rx/tx, deinit) happens on the stream
//! object and only touches the stream table long enough to look the stream
//! up.

use super::Device;
use sdr_core::{
    Capabilities, ChannelLayout, Direction, Metadata, Result, SdrError, Stream, StreamCallback,
    StreamConfig, SyncStream,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// The session owning one direction's endpoint.
#[derive(Clone)]
pub(super) enum StreamSlot {
    Async(Arc<Stream>),
    Sync(Arc<SyncStream>),
}

impl StreamSlot {
    fn is_active(&self) -> bool {
        match self {
            StreamSlot::Async(stream) => stream.is_active(),
            StreamSlot::Sync(stream) => stream.is_active(),
        }
    }

    fn deinit(&self) -> Result<()> {
        match self {
            StreamSlot::Async(stream) => stream.deinit(),
            StreamSlot::Sync(stream) => stream.deinit(),
        }
    }

    /// Cancel, drain and release. Blocks until every outstanding buffer
    /// has been handed back.
    pub(super) fn shutdown(&self) {
        match self {
            StreamSlot::Async(stream) => stream.shutdown(),
            StreamSlot::Sync(stream) => stream.shutdown(),
        }
    }

    fn same(&self, other: &StreamSlot) -> bool {
        match (self, other) {
            (StreamSlot::Async(a), StreamSlot::Async(b)) => Arc::ptr_eq(a, b),
            (StreamSlot::Sync(a), StreamSlot::Sync(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Which session owns each direction.
#[derive(Default)]
pub(super) struct StreamTable {
    closed: bool,
    rx: Option<StreamSlot>,
    tx: Option<StreamSlot>,
}

impl StreamTable {
    fn slot_mut(&mut self, direction: Direction) -> &mut Option<StreamSlot> {
        match direction {
            Direction::Rx => &mut self.rx,
            Direction::Tx => &mut self.tx,
        }
    }

    fn get(&self, direction: Direction) -> Result<Option<StreamSlot>> {
        if self.closed {
            return Err(SdrError::Closed);
        }
        Ok(match direction {
            Direction::Rx => self.rx.clone(),
            Direction::Tx => self.tx.clone(),
        })
    }

    /// Fail unless `direction` has no active session.
    fn check_free(&mut self, direction: Direction, operation: &'static str) -> Result<()> {
        if self.closed {
            return Err(SdrError::Closed);
        }
        let slot = self.slot_mut(direction);
        if slot.as_ref().is_some_and(StreamSlot::is_active) {
            return Err(SdrError::invalid_state(
                operation,
                format!("{} stream is already active", direction),
            ));
        }
        *slot = None;
        Ok(())
    }

    fn install(&mut self, direction: Direction, slot: StreamSlot) {
        *self.slot_mut(direction) = Some(slot);
    }

    /// Forget `slot` if it still owns `direction`.
    fn remove(&mut self, direction: Direction, slot: &StreamSlot) {
        let current = self.slot_mut(direction);
        if current.as_ref().is_some_and(|s| s.same(slot)) {
            *current = None;
        }
    }

    pub(super) fn active_direction(&self) -> Option<Direction> {
        if self.rx.as_ref().is_some_and(StreamSlot::is_active) {
            Some(Direction::Rx)
        } else if self.tx.as_ref().is_some_and(StreamSlot::is_active) {
            Some(Direction::Tx)
        } else {
            None
        }
    }

    /// Refuse further sessions and hand back the current ones.
    pub(super) fn close(&mut self) -> Vec<StreamSlot> {
        self.closed = true;
        self.rx.take().into_iter().chain(self.tx.take()).collect()
    }
}

impl Device {
    // =========================================================================
    // Asynchronous streams
    // =========================================================================

    /// Set up an asynchronous stream for `layout`'s direction.
    ///
    /// The caller drives it with [`Stream::run`] on a thread of its choice.
    /// Fails with invalid-state while another session owns the direction;
    /// on any failure nothing is retained.
    pub fn init_stream(
        &self,
        layout: ChannelLayout,
        config: StreamConfig,
        callback: Box<dyn StreamCallback>,
    ) -> Result<Arc<Stream>> {
        let direction = layout.direction();
        self.with_bound("init_stream", |bound| {
            let mut streams = self.inner.streams.lock();
            streams.check_free(direction, "init_stream")?;
            let stream = Arc::new(bound.board.init_stream(layout, config, callback)?);
            streams.install(direction, StreamSlot::Async(Arc::clone(&stream)));
            debug!(serial = %self.inner.info.serial, layout = %layout, "Stream bound");
            Ok(stream)
        })
    }

    /// The asynchronous stream owning `direction`, if any.
    pub fn stream(&self, direction: Direction) -> Option<Arc<Stream>> {
        match self.inner.streams.lock().get(direction) {
            Ok(Some(StreamSlot::Async(stream))) => Some(stream),
            _ => None,
        }
    }

    /// Release the session owning `direction`.
    ///
    /// Fails with invalid-state while the stream is running or a sync call
    /// is in progress. Does not take the control lock.
    pub fn deinit_stream(&self, direction: Direction) -> Result<()> {
        let slot = self.inner.streams.lock().get(direction)?.ok_or_else(|| {
            SdrError::invalid_state("deinit_stream", format!("no {} stream", direction))
        })?;
        slot.deinit()?;
        self.inner.streams.lock().remove(direction, &slot);
        Ok(())
    }

    // =========================================================================
    // Synchronous interface
    // =========================================================================

    /// Configure the blocking interface for `layout`'s direction.
    pub fn sync_config(&self, layout: ChannelLayout, config: StreamConfig) -> Result<()> {
        let direction = layout.direction();
        self.with_bound("sync_config", |bound| {
            let mut streams = self.inner.streams.lock();
            streams.check_free(direction, "sync_config")?;
            let stream = bound.board.sync_config(layout, config)?;
            streams.install(direction, StreamSlot::Sync(Arc::new(stream)));
            debug!(serial = %self.inner.info.serial, layout = %layout, "Sync interface bound");
            Ok(())
        })
    }

    fn sync_stream(&self, direction: Direction, operation: &'static str) -> Result<Arc<SyncStream>> {
        match self.inner.streams.lock().get(direction)? {
            Some(StreamSlot::Sync(stream)) => Ok(stream),
            _ => Err(SdrError::invalid_state(
                operation,
                format!("{} sync interface is not configured", direction),
            )),
        }
    }

    /// Receive exactly `samples.len()` bytes. A zero `timeout_ms` waits
    /// forever.
    pub fn sync_rx(
        &self,
        samples: &mut [u8],
        metadata: Option<&mut Metadata>,
        timeout_ms: u32,
    ) -> Result<()> {
        let stream = self.sync_stream(Direction::Rx, "sync_rx")?;
        stream.rx(samples, metadata, Duration::from_millis(u64::from(timeout_ms)))
    }

    /// Transmit `samples`. A zero `timeout_ms` waits forever.
    pub fn sync_tx(&self, samples: &[u8], metadata: Option<&Metadata>, timeout_ms: u32) -> Result<()> {
        let stream = self.sync_stream(Direction::Tx, "sync_tx")?;
        stream.tx(samples, metadata, Duration::from_millis(u64::from(timeout_ms)))
    }

    // =========================================================================
    // Timing
    // =========================================================================

    /// Change how long an asynchronous stream waits for a completion. An
    /// active stream in `direction` picks the new value up immediately.
    pub fn set_stream_timeout(&self, direction: Direction, timeout: Duration) -> Result<()> {
        self.with_board("set_stream_timeout", |board| {
            board.set_stream_timeout(direction, timeout)
        })?;
        if let Some(stream) = self.stream(direction) {
            stream.set_timeout(timeout);
        }
        Ok(())
    }

    pub fn get_stream_timeout(&self, direction: Direction) -> Result<Duration> {
        self.with_board("get_stream_timeout", |board| board.get_stream_timeout(direction))
    }

    /// Current value of `direction`'s free-running sample counter, whether
    /// or not a stream is active.
    pub fn get_timestamp(&self, direction: Direction) -> Result<u64> {
        self.with_capability("get_timestamp", Capabilities::TIMESTAMPS, |bound| {
            bound.board.get_timestamp(direction)
        })
    }
}
