//! Blocking stream interface.

use super::{deadline_after, wait_on, BufferStatus, StatsCounters, StreamConfig, StreamStats, DRAIN_POLL};
use crate::error::{Result, SdrError};
use crate::metadata::{MetaFlags, MetaStatus, Metadata};
use crate::transport::{Completion, Transfer, TransferStatus, TransportBackend};
use crate::types::{ChannelLayout, Direction};
use parking_lot::{Condvar, Mutex, MutexGuard};
use sdr_pool::{BufferPool, PooledBuffer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// RX buffer partially handed out to the caller.
struct Partial {
    buffer: PooledBuffer,
    offset: usize,
    len: usize,
    timestamp: Option<u64>,
}

struct SyncState {
    released: bool,
    closed: bool,
    primed: bool,
    in_flight: usize,
    ready: VecDeque<Completion>,
    partial: Option<Partial>,
    /// TX failure reported after the call that submitted the data returned.
    last_error: Option<SdrError>,
    /// Timestamp the next RX sample should carry if nothing was dropped.
    next_timestamp: Option<u64>,
}

impl SyncState {
    fn check_open(&self, operation: &'static str) -> Result<()> {
        if self.closed {
            return Err(SdrError::Closed);
        }
        if self.released {
            return Err(SdrError::invalid_state(
                operation,
                "sync interface has been deinitialized",
            ));
        }
        Ok(())
    }
}

struct SyncShared {
    backend: Arc<dyn TransportBackend>,
    layout: ChannelLayout,
    config: StreamConfig,
    pool: BufferPool,
    busy: AtomicBool,
    state: Mutex<SyncState>,
    changed: Condvar,
    stats: StatsCounters,
}

impl SyncShared {
    fn on_completion(&self, completion: Completion) {
        let status = match &completion.status {
            TransferStatus::Completed => BufferStatus::Completed,
            TransferStatus::Cancelled => BufferStatus::Cancelled,
            TransferStatus::Failed(_) => BufferStatus::Failed,
        };
        self.stats.record(status, completion.samples);

        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        let mut discarded = None;
        match self.layout.direction() {
            Direction::Rx if !state.released => state.ready.push_back(completion),
            Direction::Rx => discarded = Some(completion),
            Direction::Tx => {
                if let TransferStatus::Failed(message) = &completion.status {
                    state.last_error = Some(SdrError::transport("sync_tx", message.clone()));
                }
                discarded = Some(completion);
            }
        }
        self.changed.notify_all();
        drop(state);
        drop(discarded);
    }
}

/// Marks a sync call in progress; concurrent calls are rejected.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn enter(flag: &'a AtomicBool, operation: &'static str) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                SdrError::invalid_state(operation, "another synchronous call is in progress")
            })?;
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Synchronous stream session on one direction endpoint.
///
/// `rx` and `tx` each move one caller-sized block of samples, multiplexed
/// over a pool of transfer buffers. A call that exceeds its timeout returns
/// a timeout error and leaves the session consistent for the next call:
/// RX data already delivered by the device stays queued, TX data not yet
/// submitted is dropped.
#[derive(Clone)]
pub struct SyncStream {
    shared: Arc<SyncShared>,
}

impl std::fmt::Debug for SyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStream")
            .field("layout", &self.shared.layout)
            .field("config", &self.shared.config)
            .field("active", &self.is_active())
            .finish()
    }
}

impl SyncStream {
    /// Validate `config` and allocate the buffer pool. Nothing is submitted
    /// until the first call.
    pub fn new(
        backend: Arc<dyn TransportBackend>,
        layout: ChannelLayout,
        config: StreamConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pool = BufferPool::try_new(config.num_buffers, config.buffer_bytes())?;

        debug!(
            layout = %layout,
            format = ?config.format,
            num_buffers = config.num_buffers,
            samples_per_buffer = config.samples_per_buffer,
            num_transfers = config.num_transfers,
            "Sync interface configured"
        );

        Ok(Self {
            shared: Arc::new(SyncShared {
                backend,
                layout,
                pool,
                busy: AtomicBool::new(false),
                state: Mutex::new(SyncState {
                    released: false,
                    closed: false,
                    primed: false,
                    in_flight: 0,
                    ready: VecDeque::new(),
                    partial: None,
                    last_error: None,
                    next_timestamp: None,
                }),
                changed: Condvar::new(),
                stats: StatsCounters::default(),
                config,
            }),
        })
    }

    fn bytes_per_sample(&self) -> usize {
        self.shared.config.format.bytes_per_sample()
    }

    fn check_call(
        &self,
        operation: &'static str,
        direction: Direction,
        len: usize,
        has_metadata: bool,
    ) -> Result<()> {
        if self.shared.layout.direction() != direction {
            return Err(SdrError::invalid_argument(
                operation,
                format!("interface is configured for {}", self.shared.layout),
            ));
        }
        if len % self.bytes_per_sample() != 0 {
            return Err(SdrError::invalid_argument(
                operation,
                format!(
                    "{} bytes is not a whole number of {:?} samples",
                    len, self.shared.config.format
                ),
            ));
        }
        if has_metadata && !self.shared.config.format.has_metadata() {
            return Err(SdrError::invalid_argument(
                operation,
                "metadata requires a sample format with metadata",
            ));
        }
        Ok(())
    }

    /// Hand a buffer to the backend. Fails if the session was released.
    fn submit(&self, buffer: PooledBuffer, samples: usize, timestamp: Option<u64>) -> Result<()> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            state.check_open("sync_submit")?;
            state.in_flight += 1;
        }
        let transfer = Transfer {
            direction: shared.layout.direction(),
            buffer,
            samples,
            format: shared.config.format,
            channels: shared.layout.channel_count(),
            timestamp,
        };
        let target = Arc::clone(shared);
        let submitted = shared
            .backend
            .submit_transfer(transfer, Box::new(move |c| target.on_completion(c)));
        if let Err(e) = submitted {
            let mut state = shared.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            shared.changed.notify_all();
            return Err(e);
        }
        Ok(())
    }

    // =========================================================================
    // RX
    // =========================================================================

    fn prime_rx(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.check_open("sync_rx")?;
            if state.primed {
                return Ok(());
            }
            state.primed = true;
        }
        for _ in 0..self.shared.config.num_transfers {
            let Some(buffer) = self.shared.pool.try_acquire() else {
                break;
            };
            self.submit(buffer, self.shared.config.samples_per_buffer, None)?;
        }
        Ok(())
    }

    /// Receive exactly `samples.len()` bytes of samples.
    ///
    /// With metadata, `timestamp` receives the device timestamp of the first
    /// sample. Unless [`MetaFlags::RX_NOW`] is set, samples before the
    /// requested `metadata.timestamp` are skipped; a timestamp that has
    /// already passed is an invalid argument. A zero `timeout` waits forever.
    pub fn rx(
        &self,
        samples: &mut [u8],
        metadata: Option<&mut Metadata>,
        timeout: Duration,
    ) -> Result<()> {
        self.check_call("sync_rx", Direction::Rx, samples.len(), metadata.is_some())?;
        let _busy = BusyGuard::enter(&self.shared.busy, "sync_rx")?;

        let bps = self.bytes_per_sample();
        let channels = self.shared.layout.channel_count();
        let wanted = metadata
            .as_ref()
            .filter(|m| !m.flags.contains(MetaFlags::RX_NOW))
            .map(|m| m.timestamp);
        let ts_at = |base: Option<u64>, offset: usize| base.map(|ts| ts + (offset / bps / channels) as u64);

        self.prime_rx()?;

        let deadline = deadline_after(timeout);
        let mut state = self.shared.state.lock();
        let mut copied = 0;
        let mut first_timestamp = None;
        let mut status = MetaStatus::empty();

        while copied < samples.len() {
            let mut part = match state.partial.take() {
                Some(part) => part,
                None => {
                    let completion = loop {
                        state.check_open("sync_rx")?;
                        if let Some(completion) = state.ready.pop_front() {
                            break completion;
                        }
                        if wait_on(&self.shared.changed, &mut state, deadline) {
                            return Err(SdrError::timeout("sync_rx", timeout));
                        }
                    };
                    match completion.status {
                        TransferStatus::Completed => {}
                        TransferStatus::Cancelled => {
                            state.check_open("sync_rx")?;
                            return Err(SdrError::invalid_state(
                                "sync_rx",
                                "transfer was cancelled",
                            ));
                        }
                        TransferStatus::Failed(message) => {
                            let buffer = completion.buffer;
                            let spb = self.shared.config.samples_per_buffer;
                            MutexGuard::unlocked(&mut state, || self.submit(buffer, spb, None))?;
                            return Err(SdrError::transport("sync_rx", message));
                        }
                    }
                    if let (Some(expected), Some(ts)) = (state.next_timestamp, completion.timestamp)
                    {
                        if ts > expected {
                            status |= MetaStatus::OVERRUN;
                        }
                    }
                    Partial {
                        len: completion.samples * bps,
                        offset: 0,
                        timestamp: completion.timestamp,
                        buffer: completion.buffer,
                    }
                }
            };

            if copied == 0 {
                if let (Some(want), Some(current)) = (wanted, ts_at(part.timestamp, part.offset)) {
                    if want < current {
                        state.partial = Some(part);
                        return Err(SdrError::invalid_argument(
                            "sync_rx",
                            format!(
                                "requested timestamp {} has already passed (next sample is {})",
                                want, current
                            ),
                        ));
                    }
                    let skip = usize::try_from(want - current)
                        .unwrap_or(usize::MAX)
                        .saturating_mul(channels * bps);
                    part.offset = part.offset.saturating_add(skip).min(part.len);
                }
            }

            let n = (part.len - part.offset).min(samples.len() - copied);
            if n > 0 {
                if first_timestamp.is_none() {
                    first_timestamp = ts_at(part.timestamp, part.offset);
                }
                samples[copied..copied + n]
                    .copy_from_slice(&part.buffer[part.offset..part.offset + n]);
                copied += n;
                part.offset += n;
            }
            state.next_timestamp = ts_at(part.timestamp, part.offset);

            if part.offset >= part.len {
                let spb = self.shared.config.samples_per_buffer;
                MutexGuard::unlocked(&mut state, || self.submit(part.buffer, spb, None))?;
            } else {
                state.partial = Some(part);
            }
        }
        drop(state);

        if let Some(meta) = metadata {
            meta.timestamp = first_timestamp.unwrap_or(0);
            meta.actual_count = copied / bps;
            meta.status = status;
        }
        Ok(())
    }

    // =========================================================================
    // TX
    // =========================================================================

    fn acquire(&self, deadline: Option<Instant>, timeout: Duration) -> Result<PooledBuffer> {
        loop {
            let wait = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => DRAIN_POLL,
            };
            if let Some(buffer) = self.shared.pool.acquire_timeout(wait) {
                return Ok(buffer);
            }
            self.shared.state.lock().check_open("sync_tx")?;
            if deadline.is_some() {
                return Err(SdrError::timeout("sync_tx", timeout));
            }
        }
    }

    /// Transmit `samples`. The final partial buffer of the call is padded
    /// with zeros and flushed.
    ///
    /// With metadata, [`MetaFlags::TX_BURST_START`] or
    /// [`MetaFlags::TX_UPDATE_TIMESTAMP`] schedule the first sample at
    /// `metadata.timestamp` unless [`MetaFlags::TX_NOW`] is set. A transfer
    /// failure reported after an earlier call returned surfaces on the next
    /// call.
    pub fn tx(&self, samples: &[u8], metadata: Option<&Metadata>, timeout: Duration) -> Result<()> {
        self.check_call("sync_tx", Direction::Tx, samples.len(), metadata.is_some())?;
        let _busy = BusyGuard::enter(&self.shared.busy, "sync_tx")?;

        {
            let mut state = self.shared.state.lock();
            state.check_open("sync_tx")?;
            if let Some(err) = state.last_error.take() {
                return Err(err);
            }
        }
        if samples.is_empty() {
            return Ok(());
        }

        let bps = self.bytes_per_sample();
        let channels = self.shared.layout.channel_count() as u64;
        let mut timestamp = metadata.and_then(|m| {
            let scheduled = m
                .flags
                .intersects(MetaFlags::TX_BURST_START | MetaFlags::TX_UPDATE_TIMESTAMP);
            (scheduled && !m.flags.contains(MetaFlags::TX_NOW)).then_some(m.timestamp)
        });

        let deadline = deadline_after(timeout);
        for chunk in samples.chunks(self.shared.pool.buffer_len()) {
            let mut buffer = self.acquire(deadline, timeout)?;
            buffer[..chunk.len()].copy_from_slice(chunk);
            buffer[chunk.len()..].fill(0);
            buffer.set_valid_len(chunk.len());

            {
                let mut state = self.shared.state.lock();
                loop {
                    state.check_open("sync_tx")?;
                    if state.in_flight < self.shared.config.num_transfers {
                        break;
                    }
                    if wait_on(&self.shared.changed, &mut state, deadline) {
                        return Err(SdrError::timeout("sync_tx", timeout));
                    }
                }
            }

            let n = chunk.len() / bps;
            self.submit(buffer, n, timestamp)?;
            timestamp = timestamp.map(|ts| ts + n as u64 / channels);
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn release(&self, closed: bool) {
        let mut state = self.shared.state.lock();
        if closed {
            state.closed = true;
        }
        if state.released {
            self.shared.changed.notify_all();
            return;
        }
        state.released = true;
        state.partial = None;
        let queued = std::mem::take(&mut state.ready);

        let direction = self.shared.layout.direction();
        if state.in_flight > 0 {
            let backend = &self.shared.backend;
            if let Err(e) = MutexGuard::unlocked(&mut state, || backend.cancel_transfers(direction)) {
                warn!(layout = %self.shared.layout, error = %e, "Transfer cancellation failed");
            }
        }
        while state.in_flight > 0 {
            if self
                .shared
                .changed
                .wait_for(&mut state, DRAIN_POLL)
                .timed_out()
            {
                warn!(
                    layout = %self.shared.layout,
                    in_flight = state.in_flight,
                    "Still waiting for cancelled transfers"
                );
                let backend = &self.shared.backend;
                if let Err(e) = MutexGuard::unlocked(&mut state, || backend.cancel_transfers(direction)) {
                    warn!(layout = %self.shared.layout, error = %e, "Transfer cancellation failed");
                }
            }
        }
        state.ready.clear();
        self.shared.changed.notify_all();
        drop(state);
        drop(queued);
        info!(layout = %self.shared.layout, "Sync interface released");
    }

    /// Release the session. Rejected while a call is in progress; a no-op
    /// once released.
    pub fn deinit(&self) -> Result<()> {
        if self.shared.busy.load(Ordering::Acquire) {
            return Err(SdrError::invalid_state(
                "deinit_stream",
                "a synchronous call is in progress",
            ));
        }
        self.release(false);
        Ok(())
    }

    /// Terminal release used when the owning handle closes. Blocked calls
    /// wake up with [`SdrError::Closed`].
    pub fn shutdown(&self) {
        self.release(true);
    }

    /// `true` until deinitialized or closed.
    pub fn is_active(&self) -> bool {
        let state = self.shared.state.lock();
        !state.released && !state.closed
    }

    /// `true` while an `rx`/`tx` call is executing.
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Transfers currently owned by the backend.
    pub fn pending_buffers(&self) -> usize {
        self.shared.state.lock().in_flight
    }

    pub fn layout(&self) -> ChannelLayout {
        self.shared.layout
    }

    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.stats.snapshot()
    }
}
