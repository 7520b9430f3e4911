//! Sample streaming engine.
//!
//! Two modes share the same buffer-pool and bulk-transfer machinery:
//!
//! - [`Stream`]: asynchronous buffer exchange. The caller supplies a
//!   [`StreamCallback`]; [`Stream::run`] keeps `num_transfers` buffers in
//!   flight and hands every completion (or timeout) to the callback, whose
//!   [`StreamAction`] decides whether the buffer is resubmitted, held back,
//!   or the stream stops.
//! - [`SyncStream`]: blocking `rx` / `tx` calls that move one application
//!   block each, with a per-call timeout.
//!
//! Lifecycle for both: `init` (pool allocated, geometry bound) → zero or
//! more `run`/`submit_buffer` or `rx`/`tx` calls → `deinit`. None of these
//! data-plane calls touch the device handle's control lock.
//!
//! ```text
//!            caller thread                  backend worker
//!   run() ──► prime N transfers ─────────► submit_transfer
//!     │                                         │
//!     │◄──────── completion queue ◄─────────────┘
//!     ▼
//!   callback(event) ── Resubmit ──► submit_transfer
//!                   ── Hold ──────► buffer back to pool
//!                   ── Shutdown ──► cancel + drain, run() returns
//! ```

mod async_stream;
mod sync_stream;

pub use async_stream::{Stream, StreamPhase};
pub use sync_stream::SyncStream;

use crate::error::{Result, SdrError};
use crate::types::{ChannelLayout, SampleFormat};
use parking_lot::{Condvar, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Buffer sizes must be a multiple of this many samples.
pub const SAMPLES_PER_BUFFER_MULTIPLE: usize = 1024;

// =============================================================================
// Configuration
// =============================================================================

/// Geometry and timing of a stream session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub format: SampleFormat,
    /// Buffers in the pool.
    pub num_buffers: usize,
    /// Complex samples per buffer (all interleaved channels together).
    pub samples_per_buffer: usize,
    /// Transfers kept in flight; at most `num_buffers`.
    pub num_transfers: usize,
    /// Wait bound for a completion (async) or a whole call (sync).
    /// Zero waits forever.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            format: SampleFormat::Sc16Q11,
            num_buffers: 16,
            samples_per_buffer: 8192,
            num_transfers: 8,
            timeout: Duration::from_millis(1000),
        }
    }
}

impl StreamConfig {
    pub fn new(format: SampleFormat, num_buffers: usize, samples_per_buffer: usize) -> Self {
        Self {
            format,
            num_buffers,
            samples_per_buffer,
            num_transfers: num_buffers.div_ceil(2).max(1),
            ..Self::default()
        }
    }

    pub fn with_transfers(mut self, num_transfers: usize) -> Self {
        self.num_transfers = num_transfers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bytes per pool buffer.
    pub fn buffer_bytes(&self) -> usize {
        self.samples_per_buffer
            .saturating_mul(self.format.bytes_per_sample())
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |message: String| SdrError::invalid_argument("stream_config", message);
        if self.num_buffers == 0 {
            return Err(bad("num_buffers must be non-zero".into()));
        }
        if self.num_transfers == 0 {
            return Err(bad("num_transfers must be non-zero".into()));
        }
        if self.num_transfers > self.num_buffers {
            return Err(bad(format!(
                "num_transfers ({}) exceeds num_buffers ({})",
                self.num_transfers, self.num_buffers
            )));
        }
        if self.samples_per_buffer == 0
            || self.samples_per_buffer % SAMPLES_PER_BUFFER_MULTIPLE != 0
        {
            return Err(bad(format!(
                "samples_per_buffer ({}) must be a non-zero multiple of {}",
                self.samples_per_buffer, SAMPLES_PER_BUFFER_MULTIPLE
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// =============================================================================
// Callback contract
// =============================================================================

/// Why the callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// TX only: fill this buffer before it is first submitted.
    Fill,
    /// Transfer finished. RX: samples hold received data. TX: the samples
    /// went out; refill the slice before returning `Resubmit`.
    Completed,
    /// No completion arrived within the stream timeout; `samples` is empty.
    TimedOut,
    /// Transfer was cancelled (shutdown, close). The action is ignored.
    Cancelled,
    /// The transport reported a failure for this transfer.
    Failed,
}

/// What the engine does with the buffer after the callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    /// Submit the buffer again.
    Resubmit,
    /// Return the buffer to the pool; the caller may submit one later
    /// through [`Stream::submit_buffer`].
    Hold,
    /// Stop the stream. `run` cancels outstanding transfers and returns.
    Shutdown,
}

/// One callback invocation.
#[derive(Debug)]
pub struct StreamEvent<'a> {
    pub status: BufferStatus,
    pub samples: &'a mut [u8],
    /// RX: device timestamp of the first sample, when known.
    pub timestamp: Option<u64>,
    pub layout: ChannelLayout,
}

/// Consumer (RX) or producer (TX) of an asynchronous stream.
///
/// Runs on the thread that called [`Stream::run`]. Callbacks must not block
/// on the stream itself; use non-blocking [`Stream::submit_buffer`] from
/// inside a callback.
pub trait StreamCallback: Send {
    fn on_buffer(&mut self, event: StreamEvent<'_>) -> StreamAction;
}

impl<F> StreamCallback for F
where
    F: FnMut(StreamEvent<'_>) -> StreamAction + Send,
{
    fn on_buffer(&mut self, event: StreamEvent<'_>) -> StreamAction {
        self(event)
    }
}

/// Box a closure as a stream callback.
pub fn callback<F>(f: F) -> Box<dyn StreamCallback>
where
    F: FnMut(StreamEvent<'_>) -> StreamAction + Send + 'static,
{
    Box::new(f)
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of stream counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub buffers_completed: u64,
    pub buffers_cancelled: u64,
    pub buffers_failed: u64,
    pub timeouts: u64,
    pub samples: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    completed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    samples: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record(&self, status: BufferStatus, samples: usize) {
        let counter = match status {
            BufferStatus::Completed => &self.completed,
            BufferStatus::Cancelled => &self.cancelled,
            BufferStatus::Failed => &self.failed,
            BufferStatus::TimedOut => &self.timeouts,
            BufferStatus::Fill => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if status == BufferStatus::Completed {
            self.samples.fetch_add(samples as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> StreamStats {
        StreamStats {
            buffers_completed: self.completed.load(Ordering::Relaxed),
            buffers_cancelled: self.cancelled.load(Ordering::Relaxed),
            buffers_failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Waiting helpers
// =============================================================================

/// Deadline for `timeout`; `None` (wait forever) for a zero timeout.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + timeout)
    }
}

/// Wait on `cond` until notified or `deadline` passes. Returns `true` on
/// timeout.
pub(crate) fn wait_on<T>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: Option<Instant>,
) -> bool {
    match deadline {
        None => {
            cond.wait(guard);
            false
        }
        Some(deadline) => cond.wait_until(guard, deadline).timed_out(),
    }
}

/// Interval at which drains re-issue cancellation while waiting.
pub(crate) const DRAIN_POLL: Duration = Duration::from_millis(500);
