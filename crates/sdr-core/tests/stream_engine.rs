//! Stream engine behaviour against an in-process loopback backend.

use parking_lot::{Condvar, Mutex};
use sdr_core::{
    stream, BackendKind, BufferStatus, ChannelLayout, Completion, CompletionFn, ControlRequest,
    Direction, ErrorKind, MetaFlags, Metadata, RegisterSpace, Result, SampleFormat, SdrError,
    Stream, StreamAction, StreamConfig, StreamPhase, SyncStream, Transfer, TransferStatus,
    TransportBackend,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// =============================================================================
// Loopback backend
// =============================================================================

#[derive(Default)]
struct LoopState {
    pending: VecDeque<(Transfer, CompletionFn)>,
    paused: bool,
    shutdown: bool,
    clock: u64,
    tx_bytes: usize,
    tx_timestamps: Vec<Option<u64>>,
}

#[derive(Default)]
struct LoopInner {
    state: Mutex<LoopState>,
    cond: Condvar,
}

/// Completes RX transfers with a per-sample counter (`timestamp + i`) and
/// swallows TX transfers, one at a time on a worker thread.
struct Loopback {
    inner: Arc<LoopInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Loopback {
    fn new(paused: bool) -> Arc<Self> {
        let inner = Arc::new(LoopInner::default());
        inner.state.lock().paused = paused;
        let worker_inner = Arc::clone(&inner);
        let worker = thread::spawn(move || Self::work(&worker_inner));
        Arc::new(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn work(inner: &LoopInner) {
        loop {
            let (mut transfer, done) = {
                let mut state = inner.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    if !state.paused {
                        if let Some(item) = state.pending.pop_front() {
                            break item;
                        }
                    }
                    inner.cond.wait(&mut state);
                }
            };

            let timestamp = {
                let mut state = inner.state.lock();
                let ts = state.clock;
                match transfer.direction {
                    Direction::Rx => {
                        state.clock += (transfer.samples / transfer.channels) as u64;
                    }
                    Direction::Tx => {
                        state.tx_bytes += transfer.buffer.valid_len();
                        state.tx_timestamps.push(transfer.timestamp);
                    }
                }
                ts
            };

            if transfer.direction == Direction::Rx {
                let bps = transfer.format.bytes_per_sample();
                for (i, sample) in transfer.buffer.chunks_mut(bps).enumerate() {
                    let value = (timestamp + i as u64) as u32;
                    sample.copy_from_slice(&value.to_le_bytes()[..bps]);
                }
            }

            done(Completion {
                samples: transfer.samples,
                buffer: transfer.buffer,
                status: TransferStatus::Completed,
                timestamp: Some(timestamp),
            });
        }
    }

    fn set_paused(&self, paused: bool) {
        self.inner.state.lock().paused = paused;
        self.inner.cond.notify_all();
    }

    fn queued(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    fn tx_bytes(&self) -> usize {
        self.inner.state.lock().tx_bytes
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        self.inner.state.lock().shutdown = true;
        self.inner.cond.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            // The last reference may be released by a completion running on
            // the worker itself.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl TransportBackend for Loopback {
    fn name(&self) -> &str {
        "loopback"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Sim
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn control_transfer(&self, _request: ControlRequest, _data: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn register_read(&self, _space: RegisterSpace, _addr: u16) -> Result<u64> {
        Ok(0)
    }

    fn register_write(&self, _space: RegisterSpace, _addr: u16, _value: u64) -> Result<()> {
        Ok(())
    }

    fn submit_transfer(&self, transfer: Transfer, on_complete: CompletionFn) -> Result<()> {
        self.inner.state.lock().pending.push_back((transfer, on_complete));
        self.inner.cond.notify_all();
        Ok(())
    }

    fn cancel_transfers(&self, direction: Direction) -> Result<()> {
        let cancelled: std::collections::VecDeque<_> = {
            let mut state = self.inner.state.lock();
            let (matching, rest) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|(t, _)| t.direction == direction);
            state.pending = rest;
            matching
        };
        for (transfer, done) in cancelled {
            done(Completion {
                buffer: transfer.buffer,
                status: TransferStatus::Cancelled,
                samples: 0,
                timestamp: None,
            });
        }
        Ok(())
    }
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

fn config(num_buffers: usize, transfers: usize) -> StreamConfig {
    StreamConfig::new(SampleFormat::Sc16Q11, num_buffers, 1024)
        .with_transfers(transfers)
        .with_timeout(Duration::from_millis(200))
}

// =============================================================================
// Async streams
// =============================================================================

#[test]
fn test_rx_stream_delivers_contiguous_buffers() {
    let backend = Loopback::new(false);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = Arc::clone(&seen);

    let stream = Stream::new(
        backend,
        ChannelLayout::RxX1,
        config(8, 4),
        stream::callback(move |event| {
            if event.status != BufferStatus::Completed {
                return StreamAction::Shutdown;
            }
            let first = u32::from_le_bytes([
                event.samples[0],
                event.samples[1],
                event.samples[2],
                event.samples[3],
            ]);
            let mut seen = seen_cb.lock();
            seen.push((event.timestamp, first, event.samples.len()));
            if seen.len() == 10 {
                StreamAction::Shutdown
            } else {
                StreamAction::Resubmit
            }
        }),
    )
    .unwrap();

    stream.run().unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 10);
    for (i, (timestamp, first, len)) in seen.iter().enumerate() {
        assert_eq!(*timestamp, Some(i as u64 * 1024));
        assert_eq!(*first as u64, i as u64 * 1024);
        assert_eq!(*len, 4096);
    }

    assert_eq!(stream.phase(), StreamPhase::Ready);
    assert_eq!(stream.pending_buffers(), 0);
    assert!(stream.pool().wait_all_returned(Duration::from_secs(1)));
    assert!(stream.stats().buffers_completed >= 10);

    stream.deinit().unwrap();
    assert!(!stream.is_active());
}

#[test]
fn test_second_run_is_rejected_while_running() {
    let backend = Loopback::new(true);
    let stream = Stream::new(
        backend,
        ChannelLayout::RxX1,
        config(4, 2).with_timeout(Duration::ZERO),
        stream::callback(|_| StreamAction::Resubmit),
    )
    .unwrap();

    let runner = stream.clone();
    let worker = thread::spawn(move || runner.run());
    wait_for("stream to run", || stream.phase() == StreamPhase::Running);

    let err = stream.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = stream.deinit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    stream.cancel();
    worker.join().unwrap().unwrap();
    stream.deinit().unwrap();
    stream.deinit().unwrap();

    let err = stream.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn test_timeout_invokes_callback_and_shutdown_returns_timeout() {
    let backend = Loopback::new(true);
    let cancelled = Arc::new(AtomicUsize::new(0));
    let cancelled_cb = Arc::clone(&cancelled);

    let stream = Stream::new(
        backend.clone(),
        ChannelLayout::RxX1,
        config(4, 3).with_timeout(Duration::from_millis(30)),
        stream::callback(move |event| match event.status {
            BufferStatus::TimedOut => {
                assert!(event.samples.is_empty());
                StreamAction::Shutdown
            }
            BufferStatus::Cancelled => {
                cancelled_cb.fetch_add(1, Ordering::SeqCst);
                StreamAction::Resubmit
            }
            _ => StreamAction::Resubmit,
        }),
    )
    .unwrap();

    let err = stream.run().unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(cancelled.load(Ordering::SeqCst), 3);
    assert_eq!(backend.queued(), 0);
    assert_eq!(stream.stats().timeouts, 1);
    assert!(stream.pool().wait_all_returned(Duration::from_secs(1)));
}

#[test]
fn test_nonblocking_submit_without_slot_would_block() {
    let backend = Loopback::new(true);
    let stream = Stream::new(
        backend,
        ChannelLayout::RxX1,
        config(4, 2).with_timeout(Duration::ZERO),
        stream::callback(|_| StreamAction::Hold),
    )
    .unwrap();

    let spare = stream.acquire_buffer(Duration::from_millis(10)).unwrap();
    let err = stream
        .submit_buffer(spare, Duration::from_millis(10), true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState, "not running yet");

    let runner = stream.clone();
    let worker = thread::spawn(move || runner.run());
    wait_for("transfers to be primed", || stream.pending_buffers() == 2);

    let spare = stream.acquire_buffer(Duration::from_millis(10)).unwrap();
    let err = stream
        .submit_buffer(spare, Duration::from_millis(10), true)
        .unwrap_err();
    assert!(matches!(err, SdrError::WouldBlock { .. }));
    assert!(err.is_timeout());

    let spare = stream.acquire_buffer(Duration::from_millis(10)).unwrap();
    let err = stream
        .submit_buffer(spare, Duration::from_millis(20), false)
        .unwrap_err();
    assert!(matches!(err, SdrError::Timeout { .. }));

    stream.cancel();
    worker.join().unwrap().unwrap();
    assert_eq!(stream.pending_buffers(), 0);
}

#[test]
fn test_hold_then_submit_buffer() {
    let backend = Loopback::new(false);
    let completions = Arc::new(AtomicUsize::new(0));
    let completions_cb = Arc::clone(&completions);

    let stream = Stream::new(
        backend,
        ChannelLayout::RxX1,
        config(2, 1).with_timeout(Duration::ZERO),
        stream::callback(move |event| {
            if event.status == BufferStatus::Completed {
                completions_cb.fetch_add(1, Ordering::SeqCst);
            }
            StreamAction::Hold
        }),
    )
    .unwrap();

    let runner = stream.clone();
    let worker = thread::spawn(move || runner.run());
    wait_for("first completion", || completions.load(Ordering::SeqCst) == 1);
    wait_for("slot release", || stream.pending_buffers() == 0);

    let buffer = stream.acquire_buffer(Duration::from_secs(1)).unwrap();
    stream
        .submit_buffer(buffer, Duration::from_secs(1), false)
        .unwrap();
    wait_for("second completion", || completions.load(Ordering::SeqCst) == 2);

    stream.cancel();
    worker.join().unwrap().unwrap();
}

#[test]
fn test_submit_after_stop_is_rejected() {
    let backend = Loopback::new(false);
    let stream = Stream::new(
        backend.clone(),
        ChannelLayout::RxX1,
        config(4, 2).with_timeout(Duration::ZERO),
        stream::callback(|event| match event.status {
            BufferStatus::Completed => StreamAction::Shutdown,
            _ => StreamAction::Resubmit,
        }),
    )
    .unwrap();

    stream.run().unwrap();
    assert_eq!(stream.phase(), StreamPhase::Ready);
    assert_eq!(stream.pending_buffers(), 0);

    let late = stream.acquire_buffer(Duration::from_millis(10)).unwrap();
    let err = stream
        .submit_buffer(late, Duration::from_millis(10), false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    stream.deinit().unwrap();
    assert_eq!(stream.pending_buffers(), 0);
    assert_eq!(backend.queued(), 0);
    assert!(stream.pool().wait_all_returned(Duration::from_secs(1)));
}

#[test]
fn test_caller_submissions_racing_cancel_are_all_returned() {
    let backend = Loopback::new(false);
    let stream = Stream::new(
        backend.clone(),
        ChannelLayout::RxX1,
        config(16, 4).with_timeout(Duration::ZERO),
        stream::callback(|_| StreamAction::Hold),
    )
    .unwrap();

    let runner = stream.clone();
    let worker = thread::spawn(move || runner.run());
    wait_for("stream to start", || stream.phase() == StreamPhase::Running);

    let submitted = Arc::new(AtomicUsize::new(0));
    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let stream = stream.clone();
            let submitted = Arc::clone(&submitted);
            thread::spawn(move || loop {
                let buffer = match stream.acquire_buffer(Duration::from_millis(5)) {
                    Ok(buffer) => buffer,
                    Err(e) if e.is_timeout() => continue,
                    Err(_) => break,
                };
                match stream.submit_buffer(buffer, Duration::from_millis(5), false) {
                    Ok(()) => {
                        submitted.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) if e.is_timeout() => {}
                    Err(_) => break,
                }
            })
        })
        .collect();

    wait_for("caller submissions", || submitted.load(Ordering::SeqCst) >= 20);
    stream.cancel();
    worker.join().unwrap().unwrap();
    for submitter in submitters {
        submitter.join().unwrap();
    }

    // Nothing slipped past the drain into the backend.
    stream.deinit().unwrap();
    assert_eq!(stream.pending_buffers(), 0);
    assert_eq!(backend.queued(), 0);
    assert!(stream.pool().wait_all_returned(Duration::from_secs(1)));
}

#[test]
fn test_tx_fill_callback_feeds_transfers() {
    let backend = Loopback::new(false);
    let fills = Arc::new(AtomicUsize::new(0));
    let fills_cb = Arc::clone(&fills);

    let stream = Stream::new(
        backend.clone(),
        ChannelLayout::TxX1,
        config(4, 2),
        stream::callback(move |event| {
            event.samples.fill(0x11);
            if fills_cb.fetch_add(1, Ordering::SeqCst) >= 5 {
                StreamAction::Shutdown
            } else {
                StreamAction::Resubmit
            }
        }),
    )
    .unwrap();

    stream.run().unwrap();
    assert!(fills.load(Ordering::SeqCst) >= 6);
    wait_for("transmitted bytes", || backend.tx_bytes() >= 4 * 4096);
}

#[test]
fn test_shutdown_drains_running_stream_and_closes() {
    let backend = Loopback::new(true);
    let cancelled = Arc::new(AtomicUsize::new(0));
    let cancelled_cb = Arc::clone(&cancelled);

    let stream = Stream::new(
        backend.clone(),
        ChannelLayout::RxX1,
        config(6, 4).with_timeout(Duration::ZERO),
        stream::callback(move |event| {
            if event.status == BufferStatus::Cancelled {
                cancelled_cb.fetch_add(1, Ordering::SeqCst);
            }
            StreamAction::Resubmit
        }),
    )
    .unwrap();

    let runner = stream.clone();
    let worker = thread::spawn(move || runner.run());
    wait_for("transfers in flight", || backend.queued() == 4);

    stream.shutdown();
    assert_eq!(cancelled.load(Ordering::SeqCst), 4);
    assert_eq!(stream.phase(), StreamPhase::Released);
    assert!(stream.pool().wait_all_returned(Duration::from_secs(1)));
    worker.join().unwrap().unwrap();

    assert!(stream.run().unwrap_err().is_closed());
    assert!(stream
        .acquire_buffer(Duration::from_millis(1))
        .unwrap_err()
        .is_closed());
}

#[test]
fn test_init_is_atomic_on_bad_geometry() {
    let backend = Loopback::new(false);
    let err = Stream::new(
        backend.clone(),
        ChannelLayout::RxX1,
        StreamConfig::new(SampleFormat::Sc16Q11, 1 << 20, 1 << 20),
        stream::callback(|_| StreamAction::Shutdown),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

    let err = Stream::new(
        backend,
        ChannelLayout::RxX1,
        StreamConfig::new(SampleFormat::Sc16Q11, 4, 1000),
        stream::callback(|_| StreamAction::Shutdown),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

// =============================================================================
// Sync streams
// =============================================================================

fn counter_at(bytes: &[u8], sample: usize) -> u32 {
    let at = sample * 4;
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[test]
fn test_sync_rx_is_contiguous_across_calls() {
    let backend = Loopback::new(false);
    let sync = SyncStream::new(backend, ChannelLayout::RxX1, config(4, 2)).unwrap();

    let mut block = vec![0u8; 3000 * 4];
    sync.rx(&mut block, None, Duration::from_secs(1)).unwrap();
    assert_eq!(counter_at(&block, 0), 0);
    assert_eq!(counter_at(&block, 2999), 2999);

    sync.rx(&mut block, None, Duration::from_secs(1)).unwrap();
    assert_eq!(counter_at(&block, 0), 3000);
    assert_eq!(counter_at(&block, 2999), 5999);
}

#[test]
fn test_sync_rx_timeout_does_not_corrupt_next_call() {
    let backend = Loopback::new(true);
    let sync = SyncStream::new(backend.clone(), ChannelLayout::RxX1, config(4, 2)).unwrap();

    let mut block = vec![0u8; 512 * 4];
    let started = Instant::now();
    let err = sync
        .rx(&mut block, None, Duration::from_millis(30))
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert!(!sync.is_busy());

    backend.set_paused(false);
    sync.rx(&mut block, None, Duration::from_secs(1)).unwrap();
    assert_eq!(counter_at(&block, 0), 0);
    assert_eq!(counter_at(&block, 511), 511);
}

#[test]
fn test_sync_rx_metadata() {
    let backend = Loopback::new(false);

    let plain = SyncStream::new(backend.clone(), ChannelLayout::RxX1, config(4, 2)).unwrap();
    let mut block = vec![0u8; 256 * 4];
    let mut meta = Metadata::rx_now();
    let err = plain
        .rx(&mut block, Some(&mut meta), Duration::from_secs(1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    plain.deinit().unwrap();

    let cfg = StreamConfig::new(SampleFormat::Sc16Q11Meta, 4, 1024)
        .with_transfers(2)
        .with_timeout(Duration::from_secs(1));
    let sync = SyncStream::new(backend, ChannelLayout::RxX1, cfg).unwrap();

    let mut meta = Metadata::rx_now();
    sync.rx(&mut block, Some(&mut meta), Duration::from_secs(1))
        .unwrap();
    assert_eq!(meta.actual_count, 256);
    let now = meta.timestamp;

    let mut meta = Metadata::rx_at(now + 5000);
    sync.rx(&mut block, Some(&mut meta), Duration::from_secs(1))
        .unwrap();
    assert_eq!(meta.timestamp, now + 5000);
    assert_eq!(counter_at(&block, 0) as u64, now + 5000);

    let mut meta = Metadata::rx_at(now);
    let err = sync
        .rx(&mut block, Some(&mut meta), Duration::from_secs(1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(!meta.flags.contains(MetaFlags::RX_NOW));
}

#[test]
fn test_sync_direction_and_size_checks() {
    let backend = Loopback::new(false);
    let sync = SyncStream::new(backend, ChannelLayout::TxX1, config(4, 2)).unwrap();

    let mut block = vec![0u8; 1024];
    let err = sync.rx(&mut block, None, Duration::ZERO).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = sync.tx(&block[..3], None, Duration::ZERO).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_sync_tx_flushes_and_timestamps_bursts() {
    let backend = Loopback::new(false);
    let cfg = StreamConfig::new(SampleFormat::Sc16Q11Meta, 4, 1024).with_transfers(2);
    let sync = SyncStream::new(backend.clone(), ChannelLayout::TxX1, cfg).unwrap();

    let samples = vec![0x55u8; 1500 * 4];
    sync.tx(&samples, Some(&Metadata::tx_burst_at(10_000)), Duration::from_secs(1))
        .unwrap();
    wait_for("burst transmitted", || backend.tx_bytes() == 1500 * 4);

    let stamps = backend.inner.state.lock().tx_timestamps.clone();
    assert_eq!(stamps, vec![Some(10_000), Some(11_024)]);

    sync.deinit().unwrap();
    let err = sync.tx(&samples, None, Duration::ZERO).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn test_sync_shutdown_wakes_blocked_call_with_closed() {
    let backend = Loopback::new(true);
    let sync = SyncStream::new(backend, ChannelLayout::RxX1, config(4, 2)).unwrap();

    let reader = sync.clone();
    let worker = thread::spawn(move || {
        let mut block = vec![0u8; 1024 * 4];
        reader.rx(&mut block, None, Duration::ZERO)
    });
    wait_for("reader to block", || sync.is_busy() && sync.pending_buffers() == 2);

    assert_eq!(sync.deinit().unwrap_err().kind(), ErrorKind::InvalidState);
    sync.shutdown();
    let err = worker.join().unwrap().unwrap_err();
    assert!(err.is_closed());
    assert_eq!(sync.pending_buffers(), 0);
}
