//! Transport backend capability table.
//!
//! A [`TransportBackend`] moves bytes between the host and one physical
//! device: control requests, register access, bulk sample transfers and
//! image writes. Every method may block and may fail with a transport
//! error; callers do not interpret transport failures beyond that.
//!
//! Backends are shared between the control plane (board driver, under the
//! handle lock) and the data plane (stream engines, lock-free), so every
//! method takes `&self` and implementations synchronize internally.
//!
//! Entries a backend cannot provide keep their default body, which reports
//! [`SdrError::Unsupported`].

use crate::devinfo::{BackendKind, DevInfo};
use crate::error::{Result, SdrError};
use crate::retune::QuickTune;
use crate::types::{Channel, DevSpeed, Direction, SampleFormat, Version};
use sdr_pool::PooledBuffer;
use std::sync::Arc;

/// Vendor control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Well-known vendor request codes.
pub mod request {
    /// Read a string descriptor; `value` selects the descriptor.
    pub const GET_STRING: u8 = 0x01;
    /// Query the firmware version.
    pub const QUERY_VERSION: u8 = 0x02;
    /// Query whether the FPGA is configured.
    pub const QUERY_FPGA_STATUS: u8 = 0x03;

    /// `GET_STRING` descriptor index of the serial number.
    pub const STRING_SERIAL: u16 = 3;
}

/// Register bank addressed by `register_read` / `register_write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterSpace {
    /// FPGA configuration GPIO and housekeeping registers.
    Config,
    /// RF front-end (transceiver / RFIC) registers.
    RfFrontEnd,
    /// Trigger control registers.
    Trigger,
}

// =============================================================================
// Bulk transfers
// =============================================================================

/// One bulk transfer handed to the backend.
///
/// The buffer travels with the transfer and comes back in the matching
/// [`Completion`], so the backend never holds a borrowed pointer.
#[derive(Debug)]
pub struct Transfer {
    pub direction: Direction,
    pub buffer: PooledBuffer,
    /// Complex samples carried (TX) or requested (RX).
    pub samples: usize,
    pub format: SampleFormat,
    /// Channels interleaved in the buffer.
    pub channels: usize,
    /// TX only: device timestamp at which the first sample goes out.
    pub timestamp: Option<u64>,
}

/// Outcome of a bulk transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Cancelled,
    Failed(String),
}

/// A finished transfer, returned to the submitter's completion function.
#[derive(Debug)]
pub struct Completion {
    pub buffer: PooledBuffer,
    pub status: TransferStatus,
    /// Samples actually moved.
    pub samples: usize,
    /// RX: device timestamp of the first sample.
    pub timestamp: Option<u64>,
}

/// Called exactly once for every accepted transfer, from a backend thread.
pub type CompletionFn = Box<dyn FnOnce(Completion) + Send + 'static>;

// =============================================================================
// Capability table
// =============================================================================

/// Raw device I/O for one open device.
pub trait TransportBackend: Send + Sync {
    /// Human-readable backend name used in logs and errors.
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Release the device. Outstanding transfers are cancelled.
    fn close(&self) -> Result<()>;

    fn device_speed(&self) -> Result<DevSpeed> {
        Ok(DevSpeed::Unknown)
    }

    /// Issue a vendor control request; returns bytes written to `data`.
    fn control_transfer(&self, request: ControlRequest, data: &mut [u8]) -> Result<usize>;

    fn register_read(&self, space: RegisterSpace, addr: u16) -> Result<u64>;

    fn register_write(&self, space: RegisterSpace, addr: u16, value: u64) -> Result<()>;

    /// Current value of the free-running sample counter for `direction`.
    fn get_timestamp(&self, _direction: Direction) -> Result<u64> {
        Err(SdrError::unsupported("get_timestamp", self.name()))
    }

    /// Queue a retune in the device's per-channel retune queue.
    fn retune(&self, _channel: Channel, _timestamp: u64, _quick_tune: &QuickTune) -> Result<()> {
        Err(SdrError::unsupported("retune", self.name()))
    }

    /// Remove every pending retune for `channel`; returns how many.
    fn clear_retune_queue(&self, _channel: Channel) -> Result<usize> {
        Err(SdrError::unsupported("clear_retune_queue", self.name()))
    }

    /// Queue a bulk transfer. On success `on_complete` is invoked exactly
    /// once; on error it is dropped without being called.
    fn submit_transfer(&self, transfer: Transfer, on_complete: CompletionFn) -> Result<()>;

    /// Complete every queued transfer of `direction` as cancelled.
    fn cancel_transfers(&self, direction: Direction) -> Result<()>;

    fn device_reset(&self) -> Result<()> {
        Err(SdrError::unsupported("device_reset", self.name()))
    }

    fn load_fpga(&self, _image: &[u8]) -> Result<()> {
        Err(SdrError::unsupported("load_fpga", self.name()))
    }

    fn is_fpga_configured(&self) -> Result<bool> {
        Err(SdrError::unsupported("is_fpga_configured", self.name()))
    }

    fn flash_fpga(&self, _image: &[u8]) -> Result<()> {
        Err(SdrError::unsupported("flash_fpga", self.name()))
    }

    fn erase_flash(&self, _offset: u32, _len: u32) -> Result<()> {
        Err(SdrError::unsupported("erase_flash", self.name()))
    }

    fn flash_firmware(&self, _image: &[u8]) -> Result<()> {
        Err(SdrError::unsupported("flash_firmware", self.name()))
    }

    fn get_fw_version(&self) -> Result<Version> {
        Err(SdrError::unsupported("get_fw_version", self.name()))
    }

    fn get_fpga_version(&self) -> Result<Version> {
        Err(SdrError::unsupported("get_fpga_version", self.name()))
    }
}

/// Enumerates and opens devices of one backend family.
pub trait BackendFactory: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &str;

    /// List attached devices. Devices that are already open may be omitted.
    fn probe(&self) -> Result<Vec<DevInfo>>;

    /// Open the device described by `info`.
    fn open(&self, info: &DevInfo) -> Result<Arc<dyn TransportBackend>>;
}
