//! Stream lifecycle through the device handle: ownership per direction,
//! drain on deinit and close, and the blocking interface.

mod common;

use anyhow::{anyhow, Result};
use sdrhal::{
    callback, BufferStatus, Channel, ChannelLayout, Direction, ErrorKind, RxMux, SampleFormat,
    Stream, StreamAction, StreamConfig,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn config() -> StreamConfig {
    StreamConfig::new(SampleFormat::Sc16Q11, 8, 1024).with_transfers(4)
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        if Instant::now() > deadline {
            return Err(anyhow!("timed out waiting for {}", what));
        }
        thread::sleep(Duration::from_millis(2));
    }
    Ok(())
}

/// Run `stream` on its own thread, resubmitting every buffer.
fn run_in_background(stream: &Arc<Stream>) -> JoinHandle<sdrhal::Result<()>> {
    let stream = Arc::clone(stream);
    thread::spawn(move || stream.run())
}

fn counting_callback(completed: &Arc<AtomicU64>) -> Box<dyn sdrhal::StreamCallback> {
    let completed = Arc::clone(completed);
    callback(move |event| {
        if event.status == BufferStatus::Completed {
            completed.fetch_add(1, Ordering::SeqCst);
        }
        StreamAction::Resubmit
    })
}

#[test]
fn test_one_session_per_direction() -> Result<()> {
    let (device, _hw) = common::rev1()?;
    let stream = device.init_stream(ChannelLayout::RxX1, config(), callback(|_| StreamAction::Resubmit))?;

    let err = device
        .init_stream(ChannelLayout::RxX1, config(), callback(|_| StreamAction::Resubmit))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = device.sync_config(ChannelLayout::RxX1, config()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // The other direction is independent.
    device.sync_config(ChannelLayout::TxX1, config())?;

    assert!(device.stream(Direction::Rx).is_some());
    device.deinit_stream(Direction::Rx)?;
    assert!(!stream.is_active());
    assert_eq!(stream.pending_buffers(), 0);
    assert!(device.stream(Direction::Rx).is_none());

    device.init_stream(ChannelLayout::RxX1, config(), callback(|_| StreamAction::Resubmit))?;
    Ok(())
}

#[test]
fn test_async_rx_runs_until_callback_stops() -> Result<()> {
    let (device, hw) = common::rev1()?;
    device.enable_module(Channel::RX0, true)?;

    let seen = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&seen);
    let stream = device.init_stream(
        ChannelLayout::RxX1,
        config(),
        callback(move |event| {
            if event.status != BufferStatus::Completed {
                return StreamAction::Resubmit;
            }
            if counter.fetch_add(1, Ordering::SeqCst) + 1 >= 6 {
                StreamAction::Shutdown
            } else {
                StreamAction::Resubmit
            }
        }),
    )?;

    stream.run()?;
    assert!(seen.load(Ordering::SeqCst) >= 6);
    assert!(stream.stats().buffers_completed >= 6);
    assert_eq!(stream.pending_buffers(), 0);
    assert!(hw.clock(Direction::Rx) >= 6 * 1024);

    device.deinit_stream(Direction::Rx)?;
    assert_eq!(device.deinit_stream(Direction::Rx).unwrap_err().kind(), ErrorKind::InvalidState);
    Ok(())
}

#[test]
fn test_deinit_rejected_while_running() -> Result<()> {
    let (device, _hw) = common::rev1()?;
    device.enable_module(Channel::RX0, true)?;

    let completed = Arc::new(AtomicU64::new(0));
    let stream = device.init_stream(ChannelLayout::RxX1, config(), counting_callback(&completed))?;
    let runner = run_in_background(&stream);
    wait_until("first completion", || completed.load(Ordering::SeqCst) > 0)?;

    let err = device.deinit_stream(Direction::Rx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // Control calls keep working while samples flow.
    device.set_gain(Channel::RX0, 30)?;
    assert_eq!(device.get_gain(Channel::RX0)?, 30);

    stream.cancel();
    runner.join().map_err(|_| anyhow!("stream thread panicked"))??;
    assert_eq!(stream.pending_buffers(), 0);
    device.deinit_stream(Direction::Rx)?;
    Ok(())
}

#[test]
fn test_close_drains_running_stream() -> Result<()> {
    let (device, hw) = common::rev1()?;
    device.enable_module(Channel::RX0, true)?;

    let completed = Arc::new(AtomicU64::new(0));
    let stream = device.init_stream(ChannelLayout::RxX1, config(), counting_callback(&completed))?;
    let runner = run_in_background(&stream);
    wait_until("first completion", || completed.load(Ordering::SeqCst) > 0)?;

    device.close()?;
    runner.join().map_err(|_| anyhow!("stream thread panicked"))?.ok();
    assert!(!stream.is_active());
    assert_eq!(stream.pending_buffers(), 0);
    assert!(!hw.is_open());

    let err = device
        .init_stream(ChannelLayout::RxX1, config(), callback(|_| StreamAction::Resubmit))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    assert_eq!(device.deinit_stream(Direction::Rx).unwrap_err().kind(), ErrorKind::Closed);
    let mut samples = vec![0u8; 4096];
    assert_eq!(device.sync_rx(&mut samples, None, 100).unwrap_err().kind(), ErrorKind::Closed);
    assert!(device.stream(Direction::Rx).is_none());
    Ok(())
}

/// Counts buffers handed back as cancelled.
fn cancel_counting_callback(cancelled: &Arc<AtomicU64>) -> Box<dyn sdrhal::StreamCallback> {
    let cancelled = Arc::clone(cancelled);
    callback(move |event| {
        if event.status == BufferStatus::Cancelled {
            cancelled.fetch_add(1, Ordering::SeqCst);
        }
        StreamAction::Resubmit
    })
}

/// Join `handle`, failing instead of hanging if it does not finish in time.
fn join_within<T: Send + 'static>(what: &str, handle: JoinHandle<T>) -> Result<T> {
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = done_tx.send(handle.join());
    });
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .map_err(|_| anyhow!("{} did not finish within 5s", what))?
        .map_err(|_| anyhow!("{} panicked", what))
}

#[test]
fn test_close_cancels_queued_transfers() -> Result<()> {
    // RX0 stays disabled, so every transfer sits queued in the backend.
    let (device, hw) = common::rev1()?;
    let cancelled = Arc::new(AtomicU64::new(0));
    let stream = device.init_stream(ChannelLayout::RxX1, config(), cancel_counting_callback(&cancelled))?;
    let runner = run_in_background(&stream);
    wait_until("transfers queued", || stream.pending_buffers() == 4)?;

    let closer = device.clone();
    let closing = thread::spawn(move || closer.close());
    join_within("close", closing)??;

    assert_eq!(cancelled.load(Ordering::SeqCst), 4);
    assert_eq!(stream.stats().buffers_cancelled, 4);
    assert_eq!(stream.pending_buffers(), 0);
    assert!(!stream.is_active());
    assert!(!hw.is_open());
    join_within("stream thread", runner)??;
    Ok(())
}

#[test]
fn test_cancel_returns_queued_transfers() -> Result<()> {
    let (device, _hw) = common::rev1()?;
    let cancelled = Arc::new(AtomicU64::new(0));
    let stream = device.init_stream(ChannelLayout::RxX1, config(), cancel_counting_callback(&cancelled))?;
    let runner = run_in_background(&stream);
    wait_until("transfers queued", || stream.pending_buffers() == 4)?;

    stream.cancel();
    join_within("stream thread", runner)??;
    assert_eq!(cancelled.load(Ordering::SeqCst), 4);
    assert_eq!(stream.pending_buffers(), 0);
    assert!(stream.pool().wait_all_returned(Duration::from_secs(1)));

    device.deinit_stream(Direction::Rx)?;
    assert!(!stream.is_active());
    Ok(())
}

#[test]
fn test_sync_rx_counter_pattern() -> Result<()> {
    let (device, _hw) = common::rev1()?;
    device.set_rx_mux(RxMux::Counter32Bit)?;
    device.enable_module(Channel::RX0, true)?;

    let mut samples = vec![0u8; 4096];
    let err = device.sync_rx(&mut samples, None, 100).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    device.sync_config(ChannelLayout::RxX1, config())?;
    device.sync_rx(&mut samples, None, 2_000)?;
    let words: Vec<u32> = samples
        .chunks_exact(4)
        .take(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(words, vec![0, 1, 2, 3]);

    // Wrong direction for the blocking TX call.
    assert_eq!(device.sync_tx(&samples, None, 100).unwrap_err().kind(), ErrorKind::InvalidState);

    device.deinit_stream(Direction::Rx)?;
    assert_eq!(device.sync_rx(&mut samples, None, 100).unwrap_err().kind(), ErrorKind::InvalidState);
    Ok(())
}

#[test]
fn test_sync_tx_reaches_device() -> Result<()> {
    let (device, hw) = common::rev2()?;
    device.enable_module(Channel::TX0, true)?;
    device.sync_config(ChannelLayout::TxX1, config())?;

    let samples = vec![0x11u8; 4096 * 2];
    device.sync_tx(&samples, None, 2_000)?;
    wait_until("transmitted buffers", || hw.tx_log().len() >= 2)?;
    assert!(hw.tx_log().iter().all(|record| record.bytes == 4096));
    Ok(())
}

#[test]
fn test_reset_refused_while_streaming() -> Result<()> {
    let (device, hw) = common::rev2()?;
    device.sync_config(ChannelLayout::RxX2, config())?;

    let err = device.device_reset().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(hw.resets(), 0);

    device.deinit_stream(Direction::Rx)?;
    device.device_reset()?;
    assert_eq!(hw.resets(), 1);
    Ok(())
}

#[test]
fn test_stream_timeout_reaches_active_stream() -> Result<()> {
    let (device, _hw) = common::rev1()?;
    let stream = device.init_stream(ChannelLayout::RxX1, config(), callback(|_| StreamAction::Resubmit))?;

    device.set_stream_timeout(Direction::Rx, Duration::from_millis(250))?;
    assert_eq!(device.get_stream_timeout(Direction::Rx)?, Duration::from_millis(250));
    assert_eq!(stream.timeout(), Duration::from_millis(250));
    assert_eq!(device.get_stream_timeout(Direction::Tx)?, config().timeout);
    Ok(())
}
