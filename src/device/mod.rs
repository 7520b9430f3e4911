//! The device handle.
//!
//! A [`Device`] binds one [`TransportBackend`] and one [`BoardDriver`] for
//! its whole open lifetime. Two tiers of locking keep configuration and
//! streaming out of each other's way:
//!
//! - the **control lock** serializes every control-plane call (properties,
//!   tuning, triggers, retunes, stream construction). It is held only for
//!   the duration of one board call and never across a stream drain.
//! - the **stream table** records which stream owns each direction. Data
//!   moves through the stream objects themselves, which synchronize
//!   internally, so sample I/O never touches the control lock.
//!
//! `Device` is a cheap handle; clones share the same open device and can
//! be sent to other threads.

mod expansion;
mod properties;
mod retune;
mod streaming;
mod trigger;

use crate::config::HalConfig;
use crate::registry::{self, Registry};
use parking_lot::Mutex;
use sdr_core::{
    BoardDriver, Capabilities, DevInfo, Result, SdrError, StreamConfig, TransportBackend, Xb,
};
use std::sync::Arc;
use streaming::StreamTable;
use tracing::{debug, info, trace, warn};
use trigger::TriggerTable;

/// Everything that exists only while the device is open.
struct Bound {
    backend: Arc<dyn TransportBackend>,
    board: Box<dyn BoardDriver>,
    xb: Xb,
    triggers: TriggerTable,
}

impl Bound {
    fn require(&self, capability: Capabilities, operation: &'static str) -> Result<()> {
        if self.board.get_capabilities().contains(capability) {
            Ok(())
        } else {
            Err(SdrError::unsupported(operation, self.board.name()))
        }
    }

    /// Detach, disarm and close in reverse order of setup. Every step runs;
    /// the first failure is reported.
    fn teardown(mut self, info: &DevInfo) -> Result<()> {
        let mut first_err: Option<SdrError> = None;
        let mut note = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                warn!(serial = %info.serial, step, error = %e, "Teardown step failed");
                first_err.get_or_insert(e);
            }
        };

        for trigger in self.triggers.drain_armed() {
            note("trigger_disarm", self.board.trigger_arm(&trigger, false, 0, 0));
        }
        if self.xb != Xb::None {
            note("expansion_detach", self.board.expansion_detach());
            self.xb = Xb::None;
        }
        note("board_close", self.board.close());
        note("backend_close", self.backend.close());

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct DeviceInner {
    info: DevInfo,
    backend_name: String,
    board_name: String,
    stream_defaults: StreamConfig,
    control: Mutex<Option<Bound>>,
    streams: Mutex<StreamTable>,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        for slot in self.streams.get_mut().close() {
            slot.shutdown();
        }
        if let Some(bound) = self.control.get_mut().take() {
            debug!(serial = %self.info.serial, "Closing device dropped while open");
            let _ = bound.teardown(&self.info);
        }
    }
}

/// An open device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.inner.info.serial)
            .field("backend", &self.inner.backend_name)
            .field("board", &self.inner.board_name)
            .field("open", &!self.is_closed())
            .finish()
    }
}

impl Device {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the first device matching `identifier` (see
    /// [`DevInfo`]'s `FromStr`), using the factories in `registry`.
    pub fn open(registry: &Registry, identifier: &str) -> Result<Self> {
        Self::open_with(registry, identifier, StreamConfig::default())
    }

    /// Open through the registry installed with [`registry::install`].
    pub fn open_default(identifier: &str) -> Result<Self> {
        let registry = registry::global().ok_or_else(|| {
            SdrError::invalid_state("open", "no device registry has been installed")
        })?;
        Self::open(registry, identifier)
    }

    /// Open the device named in `config.device`, with `config.stream` as
    /// the handle's stream defaults.
    pub fn open_from_config(registry: &Registry, config: &HalConfig) -> Result<Self> {
        Self::open_with(
            registry,
            &config.device.identifier,
            config.stream.to_stream_config(),
        )
    }

    fn open_with(registry: &Registry, identifier: &str, stream_defaults: StreamConfig) -> Result<Self> {
        let pattern: DevInfo = identifier.parse()?;
        let (backend_factory, info) = registry.find(&pattern)?;
        let board_factory = registry.board_for(&info)?;

        let backend = backend_factory.open(&info)?;
        let board = match board_factory.open(Arc::clone(&backend), &info) {
            Ok(board) => board,
            Err(e) => {
                if let Err(close_err) = backend.close() {
                    warn!(serial = %info.serial, error = %close_err, "Backend close after failed board open");
                }
                return Err(e);
            }
        };

        info!(
            serial = %info.serial,
            product = %info.product,
            backend = backend_factory.name(),
            board = board.name(),
            "Opened device"
        );

        Ok(Self {
            inner: Arc::new(DeviceInner {
                backend_name: backend_factory.name().to_string(),
                board_name: board.name().to_string(),
                info,
                stream_defaults,
                control: Mutex::new(Some(Bound {
                    backend,
                    board,
                    xb: Xb::None,
                    triggers: TriggerTable::default(),
                })),
                streams: Mutex::new(StreamTable::default()),
            }),
        })
    }

    /// Close the device.
    ///
    /// Active streams are cancelled and drained first, without the control
    /// lock. The control lock is then taken, which waits out any control
    /// call in flight, and backend and board state are released. Closing
    /// again is a no-op; every other call on a closed handle fails with
    /// [`SdrError::Closed`].
    pub fn close(&self) -> Result<()> {
        let streams = self.inner.streams.lock().close();
        for slot in streams {
            slot.shutdown();
        }

        let bound = self.inner.control.lock().take();
        match bound {
            Some(bound) => {
                let result = bound.teardown(&self.inner.info);
                info!(serial = %self.inner.info.serial, "Closed device");
                result
            }
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.control.lock().is_none()
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Identity of the opened device. Available after close.
    pub fn info(&self) -> &DevInfo {
        &self.inner.info
    }

    pub fn backend_name(&self) -> &str {
        &self.inner.backend_name
    }

    pub fn board_name(&self) -> &str {
        &self.inner.board_name
    }

    /// Stream geometry this handle was opened with.
    pub fn stream_defaults(&self) -> &StreamConfig {
        &self.inner.stream_defaults
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Run `f` on the bound state under the control lock.
    fn with_bound<T>(&self, operation: &'static str, f: impl FnOnce(&mut Bound) -> Result<T>) -> Result<T> {
        let mut control = self.inner.control.lock();
        let bound = control.as_mut().ok_or(SdrError::Closed)?;
        trace!(operation, board = bound.board.name(), "Dispatch");
        f(bound)
    }

    fn with_board<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut dyn BoardDriver) -> Result<T>,
    ) -> Result<T> {
        self.with_bound(operation, |bound| f(bound.board.as_mut()))
    }

    /// Like [`Device::with_board`], failing with `Unsupported` unless the
    /// board currently advertises `capability`.
    fn with_capability<T>(
        &self,
        operation: &'static str,
        capability: Capabilities,
        f: impl FnOnce(&mut Bound) -> Result<T>,
    ) -> Result<T> {
        self.with_bound(operation, |bound| {
            bound.require(capability, operation)?;
            f(bound)
        })
    }
}
