//! Known transport backends and board variants.
//!
//! A [`Registry`] is built once and never mutated afterwards. Applications
//! either pass one explicitly to [`crate::Device::open`] or install a
//! process-wide instance with [`install`] at startup and open through
//! [`crate::Device::open_default`].

use once_cell::sync::OnceCell;
use sdr_core::{BackendFactory, BackendKind, BoardFactory, DevInfo, Result, SdrError};
use std::sync::Arc;
use tracing::{debug, warn};

static GLOBAL: OnceCell<Registry> = OnceCell::new();

/// Immutable list of backend factories and board factories.
#[derive(Clone, Default)]
pub struct Registry {
    backends: Vec<Arc<dyn BackendFactory>>,
    boards: Vec<Arc<dyn BoardFactory>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field(
                "backends",
                &self.backends.iter().map(|b| b.name().to_string()).collect::<Vec<_>>(),
            )
            .field(
                "boards",
                &self.boards.iter().map(|b| b.name().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry with the simulated fleet backend and every simulated board.
    pub fn simulated(fleet: &Arc<sdr_driver_sim::SimFleet>) -> Self {
        Self::builder()
            .backend(Arc::new(fleet.factory()))
            .boards(sdr_driver_sim::board_factories())
            .build()
    }

    pub fn backends(&self) -> &[Arc<dyn BackendFactory>] {
        &self.backends
    }

    pub fn boards(&self) -> &[Arc<dyn BoardFactory>] {
        &self.boards
    }

    /// Every attached device across all backends, in registration order.
    ///
    /// A backend whose probe fails is logged and skipped.
    pub fn probe(&self) -> Vec<DevInfo> {
        let mut found = Vec::new();
        for backend in &self.backends {
            match backend.probe() {
                Ok(devices) => {
                    debug!(backend = backend.name(), count = devices.len(), "Probed backend");
                    found.extend(devices);
                }
                Err(e) => warn!(backend = backend.name(), error = %e, "Backend probe failed"),
            }
        }
        found
    }

    /// First probed device matching `pattern`, with the backend that saw it.
    pub fn find(&self, pattern: &DevInfo) -> Result<(Arc<dyn BackendFactory>, DevInfo)> {
        for backend in &self.backends {
            if pattern.backend != BackendKind::Any && pattern.backend != backend.kind() {
                continue;
            }
            let devices = match backend.probe() {
                Ok(devices) => devices,
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "Backend probe failed");
                    continue;
                }
            };
            if let Some(info) = devices.into_iter().find(|d| pattern.matches(d)) {
                return Ok((Arc::clone(backend), info));
            }
        }
        Err(SdrError::NotFound {
            identifier: pattern.to_string(),
        })
    }

    /// Board factory claiming `info`'s product.
    pub fn board_for(&self, info: &DevInfo) -> Result<Arc<dyn BoardFactory>> {
        self.boards
            .iter()
            .find(|b| b.matches(info))
            .cloned()
            .ok_or_else(|| SdrError::unsupported("board", info.product.clone()))
    }
}

/// Collects factories for a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    backends: Vec<Arc<dyn BackendFactory>>,
    boards: Vec<Arc<dyn BoardFactory>>,
}

impl RegistryBuilder {
    pub fn backend(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.backends.push(factory);
        self
    }

    pub fn board(mut self, factory: Arc<dyn BoardFactory>) -> Self {
        self.boards.push(factory);
        self
    }

    pub fn boards(mut self, factories: impl IntoIterator<Item = Arc<dyn BoardFactory>>) -> Self {
        self.boards.extend(factories);
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            backends: self.backends,
            boards: self.boards,
        }
    }
}

/// Install the process-wide registry. Only the first call succeeds.
pub fn install(registry: Registry) -> Result<()> {
    GLOBAL.set(registry).map_err(|_| {
        SdrError::invalid_state("registry_install", "a registry is already installed")
    })
}

/// The process-wide registry, if one has been installed.
pub fn global() -> Option<&'static Registry> {
    GLOBAL.get()
}
