//! Simulated USB transport backend.
//!
//! Control requests and register accesses go straight to the
//! [`SimDevice`]. Bulk transfers are queued per direction and completed by
//! one worker thread per direction, in submission order, whenever the
//! device is moving samples in that direction.

use crate::common::faults::op;
use crate::hardware::SimDevice;
use parking_lot::{Condvar, Mutex};
use sdr_core::{
    BackendKind, Channel, Completion, CompletionFn, ControlRequest, DevSpeed, Direction,
    QuickTune, RegisterSpace, Result, SdrError, Transfer, TransferStatus, TransportBackend,
    Version,
};
use sdr_core::transport::request;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Interval at which idle workers re-check device state.
const WORKER_POLL: Duration = Duration::from_millis(2);

type Pending = VecDeque<(Transfer, CompletionFn)>;

#[derive(Default)]
struct Queues {
    rx: Pending,
    tx: Pending,
    shutdown: bool,
}

impl Queues {
    fn of(&mut self, direction: Direction) -> &mut Pending {
        match direction {
            Direction::Rx => &mut self.rx,
            Direction::Tx => &mut self.tx,
        }
    }
}

struct Shared {
    device: Arc<SimDevice>,
    queues: Mutex<Queues>,
    wake: Condvar,
}

/// Transport backend bound to one [`SimDevice`].
pub struct SimUsbBackend {
    name: String,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SimUsbBackend {
    /// Open `device`. Fails if another backend already holds it.
    pub fn open(device: Arc<SimDevice>) -> Result<Arc<Self>> {
        if !device.claim() {
            return Err(SdrError::invalid_state(
                "open",
                format!("device {} is already open", device.serial()),
            ));
        }

        let name = format!("sim-usb:{}", device.serial());
        let shared = Arc::new(Shared {
            device,
            queues: Mutex::new(Queues::default()),
            wake: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(2);
        for direction in [Direction::Rx, Direction::Tx] {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, direction).to_lowercase())
                .spawn(move || Self::work(&worker_shared, direction));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.queues.lock().shutdown = true;
                    shared.wake.notify_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    shared.device.release();
                    return Err(SdrError::ResourceExhausted {
                        message: format!("failed to spawn transfer worker: {}", e),
                    });
                }
            }
        }

        info!(backend = %name, "Opened simulated device");
        Ok(Arc::new(Self {
            name,
            shared,
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn device(&self) -> &Arc<SimDevice> {
        &self.shared.device
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(SdrError::Closed)
        } else {
            Ok(())
        }
    }

    fn work(shared: &Shared, direction: Direction) {
        let device = &shared.device;
        loop {
            let (mut transfer, done) = {
                let mut queues = shared.queues.lock();
                loop {
                    if queues.shutdown {
                        return;
                    }
                    let ready = !queues.of(direction).is_empty()
                        && !device.faults().stalls(direction)
                        && device.flowing(direction);
                    if ready {
                        if let Some(item) = queues.of(direction).pop_front() {
                            break item;
                        }
                    }
                    shared.wake.wait_for(&mut queues, WORKER_POLL);
                }
            };

            if let Err(e) = device.faults().check(device.serial(), op::TRANSFER) {
                warn!(serial = %device.serial(), direction = %direction, error = %e, "Transfer failed");
                done(Completion {
                    buffer: transfer.buffer,
                    status: TransferStatus::Failed(e.to_string()),
                    samples: 0,
                    timestamp: None,
                });
                continue;
            }

            let timestamp = match direction {
                Direction::Rx => device.receive(
                    &mut transfer.buffer,
                    transfer.format,
                    transfer.channels,
                    transfer.samples,
                ),
                Direction::Tx => device.transmit(
                    transfer.buffer.valid(),
                    transfer.channels,
                    transfer.samples,
                    transfer.timestamp,
                ),
            };
            trace!(
                serial = %device.serial(),
                direction = %direction,
                samples = transfer.samples,
                timestamp,
                "Transfer completed"
            );

            done(Completion {
                samples: transfer.samples,
                buffer: transfer.buffer,
                status: TransferStatus::Completed,
                timestamp: Some(timestamp),
            });
        }
    }

    fn cancel_queued(&self, direction: Direction) {
        let cancelled = std::mem::take(self.shared.queues.lock().of(direction));
        if !cancelled.is_empty() {
            debug!(backend = %self.name, direction = %direction, count = cancelled.len(), "Cancelling transfers");
        }
        for (transfer, done) in cancelled {
            done(Completion {
                buffer: transfer.buffer,
                status: TransferStatus::Cancelled,
                samples: 0,
                timestamp: None,
            });
        }
    }

    fn query(&self, req: ControlRequest) -> Result<Vec<u8>> {
        let mut data = [0u8; 64];
        let n = self.control_transfer(req, &mut data)?;
        Ok(data[..n].to_vec())
    }

    fn query_version(&self, index: u16) -> Result<Version> {
        let raw = self.query(ControlRequest {
            request: request::QUERY_VERSION,
            value: 0,
            index,
        })?;
        parse_version(&raw)
    }
}

/// Parse a `major.minor.patch` version reply.
fn parse_version(raw: &[u8]) -> Result<Version> {
    let text = String::from_utf8_lossy(raw);
    let bad = || SdrError::transport("get_version", format!("malformed version '{}'", text));
    let mut parts = text.trim().split('.').map(|p| p.parse::<u16>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch))) => {
            Ok(Version::new(major, minor, patch))
        }
        _ => Err(bad()),
    }
}

impl TransportBackend for SimUsbBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Sim
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.cancel_queued(Direction::Rx);
        self.cancel_queued(Direction::Tx);
        self.shared.queues.lock().shutdown = true;
        self.shared.wake.notify_all();

        let current = thread::current().id();
        for handle in self.workers.lock().drain(..) {
            // The last reference may be dropped by a completion running on
            // a worker.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        self.shared.device.release();
        info!(backend = %self.name, "Closed simulated device");
        Ok(())
    }

    fn device_speed(&self) -> Result<DevSpeed> {
        self.ensure_open()?;
        Ok(self.shared.device.spec().speed)
    }

    fn control_transfer(&self, req: ControlRequest, data: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let device = &self.shared.device;
        device.faults().check(device.serial(), op::CONTROL)?;
        device.control(req, data)
    }

    fn register_read(&self, space: RegisterSpace, addr: u16) -> Result<u64> {
        self.ensure_open()?;
        let device = &self.shared.device;
        device.faults().check(device.serial(), op::REGISTER_READ)?;
        Ok(device.register(space, addr))
    }

    fn register_write(&self, space: RegisterSpace, addr: u16, value: u64) -> Result<()> {
        self.ensure_open()?;
        let device = &self.shared.device;
        device.faults().check(device.serial(), op::REGISTER_WRITE)?;
        device.register_write(space, addr, value)?;
        self.shared.wake.notify_all();
        Ok(())
    }

    fn get_timestamp(&self, direction: Direction) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.shared.device.clock(direction))
    }

    fn retune(&self, channel: Channel, timestamp: u64, quick_tune: &QuickTune) -> Result<()> {
        self.ensure_open()?;
        let device = &self.shared.device;
        device.faults().check(device.serial(), op::RETUNE)?;
        device.retune(channel, timestamp, quick_tune)
    }

    fn clear_retune_queue(&self, channel: Channel) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.shared.device.clear_retunes(channel))
    }

    fn submit_transfer(&self, transfer: Transfer, on_complete: CompletionFn) -> Result<()> {
        self.ensure_open()?;
        if transfer.samples == 0 || transfer.channels == 0 {
            return Err(SdrError::invalid_argument(
                "submit_transfer",
                "transfer carries no samples",
            ));
        }
        let direction = transfer.direction;
        {
            let mut queues = self.shared.queues.lock();
            if queues.shutdown {
                return Err(SdrError::Closed);
            }
            queues.of(direction).push_back((transfer, on_complete));
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    fn cancel_transfers(&self, direction: Direction) -> Result<()> {
        self.cancel_queued(direction);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn device_reset(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.device.reset();
        Ok(())
    }

    fn load_fpga(&self, image: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let device = &self.shared.device;
        device.faults().check(device.serial(), op::IMAGE)?;
        device.load_fpga(image)
    }

    fn is_fpga_configured(&self) -> Result<bool> {
        let raw = self.query(ControlRequest {
            request: request::QUERY_FPGA_STATUS,
            value: 0,
            index: 0,
        })?;
        Ok(raw.first().is_some_and(|b| *b != 0))
    }

    fn flash_fpga(&self, image: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let device = &self.shared.device;
        device.faults().check(device.serial(), op::IMAGE)?;
        device.flash_fpga(image)
    }

    fn erase_flash(&self, _offset: u32, _len: u32) -> Result<()> {
        self.ensure_open()?;
        let device = &self.shared.device;
        device.faults().check(device.serial(), op::IMAGE)?;
        device.erase_flash();
        Ok(())
    }

    fn flash_firmware(&self, image: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let device = &self.shared.device;
        device.faults().check(device.serial(), op::IMAGE)?;
        device.flash_firmware(image)
    }

    fn get_fw_version(&self) -> Result<Version> {
        self.query_version(0)
    }

    fn get_fpga_version(&self) -> Result<Version> {
        self.query_version(1)
    }
}

impl Drop for SimUsbBackend {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for SimUsbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimUsbBackend")
            .field("name", &self.name)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
