//! Asynchronous buffer-exchange stream.

use super::{
    deadline_after, wait_on, BufferStatus, StatsCounters, StreamAction, StreamCallback,
    StreamConfig, StreamEvent, StreamStats, DRAIN_POLL,
};
use crate::error::{Result, SdrError};
use crate::transport::{Completion, Transfer, TransferStatus, TransportBackend};
use crate::types::{ChannelLayout, Direction};
use parking_lot::{Condvar, Mutex, MutexGuard};
use sdr_pool::{BufferPool, PooledBuffer};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Lifecycle phase of a [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Initialized; no transfers in flight.
    Ready,
    /// `run` is executing.
    Running,
    /// Deinitialized; the pool is gone from the session.
    Released,
}

struct StreamState {
    phase: StreamPhase,
    /// Set when the owning device handle was closed.
    closed: bool,
    cancel_requested: bool,
    /// Transfers owned by the backend or about to be handed to it.
    in_flight: usize,
    /// Transfer slots in use: in flight plus completions not yet handled.
    slots: usize,
    completed: VecDeque<Completion>,
    timeout: Duration,
}

impl StreamState {
    fn check_open(&self, operation: &'static str) -> Result<()> {
        if self.closed {
            return Err(SdrError::Closed);
        }
        if self.phase == StreamPhase::Released {
            return Err(SdrError::invalid_state(
                operation,
                "stream has been deinitialized",
            ));
        }
        Ok(())
    }
}

struct StreamShared {
    backend: Arc<dyn TransportBackend>,
    layout: ChannelLayout,
    config: StreamConfig,
    pool: BufferPool,
    state: Mutex<StreamState>,
    changed: Condvar,
    callback: Mutex<Box<dyn StreamCallback>>,
    stats: StatsCounters,
}

impl StreamShared {
    fn direction(&self) -> Direction {
        self.layout.direction()
    }

    fn on_completion(&self, completion: Completion) {
        trace!(
            layout = %self.layout,
            samples = completion.samples,
            status = ?completion.status,
            "Transfer completed"
        );
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.completed.push_back(completion);
        self.changed.notify_all();
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.slots = state.slots.saturating_sub(1);
        self.changed.notify_all();
    }
}

/// Asynchronous stream session on one direction endpoint.
///
/// Cloning yields another handle to the same session, which is how a
/// control thread cancels a stream that another thread is running.
///
/// # Example
///
/// ```no_run
/// # use sdr_core::Stream;
/// # fn demo(stream: Stream) -> sdr_core::Result<()> {
/// let runner = stream.clone();
/// let worker = std::thread::spawn(move || runner.run());
/// // ... later, from the control thread:
/// stream.cancel();
/// worker.join().ok();
/// stream.deinit()?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct Stream {
    shared: Arc<StreamShared>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("layout", &self.shared.layout)
            .field("config", &self.shared.config)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Stream {
    /// Validate `config` and allocate the buffer pool.
    ///
    /// Fails atomically: on error nothing is retained.
    pub fn new(
        backend: Arc<dyn TransportBackend>,
        layout: ChannelLayout,
        config: StreamConfig,
        callback: Box<dyn StreamCallback>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = BufferPool::try_new(config.num_buffers, config.buffer_bytes())?;

        debug!(
            layout = %layout,
            format = ?config.format,
            num_buffers = config.num_buffers,
            samples_per_buffer = config.samples_per_buffer,
            num_transfers = config.num_transfers,
            "Stream initialized"
        );

        Ok(Self {
            shared: Arc::new(StreamShared {
                backend,
                layout,
                pool,
                state: Mutex::new(StreamState {
                    phase: StreamPhase::Ready,
                    closed: false,
                    cancel_requested: false,
                    in_flight: 0,
                    slots: 0,
                    completed: VecDeque::new(),
                    timeout: config.timeout,
                }),
                changed: Condvar::new(),
                callback: Mutex::new(callback),
                stats: StatsCounters::default(),
                config,
            }),
        })
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    /// Run the stream on the calling thread until the callback returns
    /// [`StreamAction::Shutdown`], [`Stream::cancel`] is called, or an error
    /// occurs.
    ///
    /// Before returning, every outstanding transfer is cancelled and its
    /// buffer handed to the callback as [`BufferStatus::Cancelled`].
    pub fn run(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.check_open("stream")?;
            if state.phase == StreamPhase::Running {
                return Err(SdrError::invalid_state("stream", "stream is already running"));
            }
            state.phase = StreamPhase::Running;
            state.cancel_requested = false;
        }
        info!(layout = %self.shared.layout, "Stream started");

        let outcome = match self.prime() {
            Ok(true) => self.pump(),
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        self.drain();

        let mut state = self.shared.state.lock();
        if state.phase == StreamPhase::Running {
            state.phase = StreamPhase::Ready;
        }
        self.shared.changed.notify_all();
        drop(state);

        match &outcome {
            Ok(()) => info!(layout = %self.shared.layout, "Stream stopped"),
            Err(e) => warn!(layout = %self.shared.layout, error = %e, "Stream stopped with error"),
        }
        outcome
    }

    /// Submit initial transfers. Returns `Ok(false)` if a TX fill callback
    /// requested shutdown.
    fn prime(&self) -> Result<bool> {
        for _ in 0..self.shared.config.num_transfers {
            let Some(mut buffer) = self.shared.pool.try_acquire() else {
                break;
            };
            if self.shared.direction() == Direction::Tx {
                match self.invoke(BufferStatus::Fill, &mut buffer, None) {
                    StreamAction::Resubmit => {}
                    StreamAction::Hold => continue,
                    StreamAction::Shutdown => return Ok(false),
                }
            }
            {
                let mut state = self.shared.state.lock();
                state.slots += 1;
                state.in_flight += 1;
            }
            self.submit(buffer, None)?;
        }
        Ok(true)
    }

    fn pump(&self) -> Result<()> {
        enum Next {
            Cancel,
            Done(Completion),
            TimedOut(Duration),
        }

        loop {
            let next = {
                let mut state = self.shared.state.lock();
                let timeout = state.timeout;
                let deadline = deadline_after(timeout);
                loop {
                    if state.cancel_requested {
                        break Next::Cancel;
                    }
                    if let Some(completion) = state.completed.pop_front() {
                        break Next::Done(completion);
                    }
                    if wait_on(&self.shared.changed, &mut state, deadline) {
                        break Next::TimedOut(timeout);
                    }
                }
            };

            match next {
                Next::Cancel => {
                    debug!(layout = %self.shared.layout, "Stream cancel requested");
                    return Ok(());
                }
                Next::TimedOut(timeout) => {
                    self.shared.stats.record(BufferStatus::TimedOut, 0);
                    let action = self.invoke_empty(BufferStatus::TimedOut);
                    if action == StreamAction::Shutdown {
                        return Err(SdrError::timeout("stream", timeout));
                    }
                }
                Next::Done(completion) => {
                    if !self.handle_completion(completion)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns `Ok(false)` when the callback asked for shutdown.
    fn handle_completion(&self, completion: Completion) -> Result<bool> {
        let status = match &completion.status {
            TransferStatus::Completed => BufferStatus::Completed,
            TransferStatus::Cancelled => BufferStatus::Cancelled,
            TransferStatus::Failed(message) => {
                warn!(layout = %self.shared.layout, error = %message, "Transfer failed");
                BufferStatus::Failed
            }
        };
        self.shared.stats.record(status, completion.samples);

        let mut buffer = completion.buffer;
        let bytes = completion.samples * self.shared.config.format.bytes_per_sample();
        buffer.set_valid_len(bytes);
        let action = self.invoke(status, &mut buffer, completion.timestamp);

        if status == BufferStatus::Cancelled {
            drop(buffer);
            self.shared.release_slot();
            return Ok(true);
        }

        match action {
            StreamAction::Resubmit => {
                self.shared.state.lock().in_flight += 1;
                self.submit(buffer, None)?;
                Ok(true)
            }
            StreamAction::Hold => {
                drop(buffer);
                self.shared.release_slot();
                Ok(true)
            }
            StreamAction::Shutdown => {
                drop(buffer);
                self.shared.release_slot();
                Ok(false)
            }
        }
    }

    /// Cancel outstanding transfers and hand every remaining buffer to the
    /// callback as cancelled. Does not return until the backend gave every
    /// transfer back and every slot is free.
    ///
    /// The backend may run completions synchronously from
    /// `cancel_transfers`, so it is called without the state lock.
    fn drain(&self) {
        let direction = self.shared.direction();
        let backend = &self.shared.backend;
        let mut state = self.shared.state.lock();
        // Refuse caller submissions from here on; anything already reserved
        // is counted in `in_flight`.
        state.cancel_requested = true;

        if state.in_flight > 0 {
            debug!(layout = %self.shared.layout, in_flight = state.in_flight, "Cancelling transfers");
            if let Err(e) = MutexGuard::unlocked(&mut state, || backend.cancel_transfers(direction)) {
                warn!(layout = %self.shared.layout, error = %e, "Transfer cancellation failed");
            }
        }

        loop {
            if let Some(completion) = state.completed.pop_front() {
                MutexGuard::unlocked(&mut state, || self.hand_back_cancelled(completion));
                state.slots = state.slots.saturating_sub(1);
                continue;
            }
            if state.in_flight == 0 {
                break;
            }
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
                if let Err(e) = MutexGuard::unlocked(&mut state, || backend.cancel_transfers(direction)) {
                    warn!(layout = %self.shared.layout, error = %e, "Transfer cancellation failed");
                }
            }
        }

        if state.slots != 0 {
            warn!(layout = %self.shared.layout, slots = state.slots, "Slot accounting out of step after drain");
            state.slots = 0;
        }
        self.shared.changed.notify_all();
    }

    fn hand_back_cancelled(&self, completion: Completion) {
        self.shared.stats.record(BufferStatus::Cancelled, 0);
        let mut buffer = completion.buffer;
        buffer.set_valid_len(completion.samples * self.shared.config.format.bytes_per_sample());
        let _ = self.invoke(BufferStatus::Cancelled, &mut buffer, completion.timestamp);
    }

    /// Hand `buffer` to the backend. The caller has already reserved a slot
    /// and counted the transfer in flight; on failure both are released.
    fn submit(&self, buffer: PooledBuffer, timestamp: Option<u64>) -> Result<()> {
        let shared = &self.shared;
        let bps = shared.config.format.bytes_per_sample();
        let samples = match shared.direction() {
            Direction::Rx => shared.config.samples_per_buffer,
            Direction::Tx if buffer.valid_len() == 0 => shared.config.samples_per_buffer,
            Direction::Tx => buffer.valid_len() / bps,
        };
        let transfer = Transfer {
            direction: shared.direction(),
            buffer,
            samples,
            format: shared.config.format,
            channels: shared.layout.channel_count(),
            timestamp,
        };

        let completion_target = Arc::clone(shared);
        let submitted = shared.backend.submit_transfer(
            transfer,
            Box::new(move |completion| completion_target.on_completion(completion)),
        );

        if let Err(e) = submitted {
            let mut state = shared.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.slots = state.slots.saturating_sub(1);
            shared.changed.notify_all();
            return Err(e);
        }
        Ok(())
    }

    fn invoke(
        &self,
        status: BufferStatus,
        buffer: &mut PooledBuffer,
        timestamp: Option<u64>,
    ) -> StreamAction {
        let len = match status {
            BufferStatus::Fill => buffer.capacity(),
            _ if self.shared.direction() == Direction::Tx => buffer.capacity(),
            _ => buffer.valid_len(),
        };
        let mut callback = self.shared.callback.lock();
        let action = callback.on_buffer(StreamEvent {
            status,
            samples: &mut buffer[..len],
            timestamp,
            layout: self.shared.layout,
        });
        if self.shared.direction() == Direction::Tx {
            buffer.set_valid_len(len);
        }
        action
    }

    fn invoke_empty(&self, status: BufferStatus) -> StreamAction {
        let mut callback = self.shared.callback.lock();
        callback.on_buffer(StreamEvent {
            status,
            samples: &mut [],
            timestamp: None,
            layout: self.shared.layout,
        })
    }

    // =========================================================================
    // Caller-driven submission
    // =========================================================================

    /// Take a free buffer from the stream's pool.
    pub fn acquire_buffer(&self, timeout: Duration) -> Result<PooledBuffer> {
        self.shared.state.lock().check_open("acquire_buffer")?;
        let buffer = match deadline_after(timeout) {
            None => loop {
                if let Some(buffer) = self.shared.pool.acquire_timeout(DRAIN_POLL) {
                    break Some(buffer);
                }
                self.shared.state.lock().check_open("acquire_buffer")?;
            },
            Some(_) => self.shared.pool.acquire_timeout(timeout),
        };
        buffer.ok_or_else(|| SdrError::timeout("acquire_buffer", timeout))
    }

    /// Submit a buffer to a running stream.
    ///
    /// Waits up to `timeout` for a free transfer slot. With `nonblock`, a
    /// missing slot fails immediately with [`SdrError::WouldBlock`].
    pub fn submit_buffer(
        &self,
        buffer: PooledBuffer,
        timeout: Duration,
        nonblock: bool,
    ) -> Result<()> {
        if buffer.capacity() != self.shared.pool.buffer_len() {
            return Err(SdrError::invalid_argument(
                "submit_buffer",
                format!(
                    "buffer of {} bytes does not belong to this stream ({} byte buffers)",
                    buffer.capacity(),
                    self.shared.pool.buffer_len()
                ),
            ));
        }

        {
            let mut state = self.shared.state.lock();
            let deadline = deadline_after(timeout);
            loop {
                state.check_open("submit_buffer")?;
                if state.phase != StreamPhase::Running || state.cancel_requested {
                    return Err(SdrError::invalid_state(
                        "submit_buffer",
                        "stream is not running",
                    ));
                }
                if state.slots < self.shared.config.num_transfers {
                    break;
                }
                if nonblock {
                    return Err(SdrError::WouldBlock {
                        operation: "submit_buffer",
                    });
                }
                if wait_on(&self.shared.changed, &mut state, deadline) {
                    return Err(SdrError::timeout("submit_buffer", timeout));
                }
            }
            state.slots += 1;
            state.in_flight += 1;
        }
        self.submit(buffer, None)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Ask a running stream to stop. `run` returns after draining.
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock();
        if state.phase == StreamPhase::Running {
            state.cancel_requested = true;
            self.shared.changed.notify_all();
        }
    }

    /// Release the session.
    ///
    /// Rejected with an invalid-state error while `run` is executing.
    /// Calling it again after a successful deinit is a no-op.
    pub fn deinit(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        match state.phase {
            StreamPhase::Released => Ok(()),
            StreamPhase::Running => Err(SdrError::invalid_state(
                "deinit_stream",
                "stream is running; cancel it first",
            )),
            StreamPhase::Ready => {
                state.phase = StreamPhase::Released;
                self.shared.changed.notify_all();
                info!(
                    layout = %self.shared.layout,
                    pending = state.slots,
                    "Stream deinitialized"
                );
                Ok(())
            }
        }
    }

    /// Force the session into its terminal state: cancel, wait for `run`
    /// to finish draining, release. Used when the owning handle closes.
    ///
    /// Must not be called from inside the stream's own callback.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        if state.phase == StreamPhase::Running {
            warn!(layout = %self.shared.layout, "Cancelling active stream");
            state.cancel_requested = true;
            self.shared.changed.notify_all();
            while state.phase == StreamPhase::Running {
                self.shared.changed.wait(&mut state);
            }
        }
        state.phase = StreamPhase::Released;
        self.shared.changed.notify_all();
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn phase(&self) -> StreamPhase {
        self.shared.state.lock().phase
    }

    /// `true` until the stream is deinitialized or its handle closed.
    pub fn is_active(&self) -> bool {
        let state = self.shared.state.lock();
        !state.closed && state.phase != StreamPhase::Released
    }

    /// Buffers submitted or completed but not yet handed back to the caller.
    pub fn pending_buffers(&self) -> usize {
        self.shared.state.lock().slots
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.state.lock().timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.shared.state.lock().timeout
    }

    pub fn pool(&self) -> &BufferPool {
        &self.shared.pool
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
