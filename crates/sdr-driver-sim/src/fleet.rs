//! A set of simulated devices sharing one trigger bus, and the backend
//! factory that enumerates and opens them.

use crate::backend::SimUsbBackend;
use crate::bus::SignalBus;
use crate::hardware::{DeviceSpec, SimDevice};
use parking_lot::RwLock;
use sdr_core::{BackendFactory, BackendKind, DevInfo, Result, SdrError, TransportBackend};
use std::sync::Arc;
use tracing::debug;

/// Devices attached to the simulated bus.
#[derive(Debug)]
pub struct SimFleet {
    devices: RwLock<Vec<Arc<SimDevice>>>,
    bus: Arc<SignalBus>,
}

impl SimFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: RwLock::new(Vec::new()),
            bus: SignalBus::new(),
        })
    }

    /// Fleet pre-populated with `specs`, in order.
    pub fn with_devices(specs: impl IntoIterator<Item = DeviceSpec>) -> Arc<Self> {
        let fleet = Self::new();
        for spec in specs {
            fleet.attach(spec);
        }
        fleet
    }

    /// Plug in a device.
    pub fn attach(&self, spec: DeviceSpec) -> Arc<SimDevice> {
        let mut devices = self.devices.write();
        let instance = devices.len() as u32;
        debug!(serial = %spec.serial, product = ?spec.product, instance, "Attached simulated device");
        let device = SimDevice::new(spec, instance, Arc::clone(&self.bus));
        devices.push(Arc::clone(&device));
        device
    }

    pub fn device(&self, serial: &str) -> Option<Arc<SimDevice>> {
        self.devices
            .read()
            .iter()
            .find(|d| d.serial() == serial)
            .cloned()
    }

    pub fn devices(&self) -> Vec<Arc<SimDevice>> {
        self.devices.read().clone()
    }

    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.bus
    }

    /// Backend factory over this fleet.
    pub fn factory(self: &Arc<Self>) -> SimUsbFactory {
        SimUsbFactory {
            fleet: Arc::clone(self),
        }
    }
}

/// [`BackendFactory`] for a [`SimFleet`].
#[derive(Debug, Clone)]
pub struct SimUsbFactory {
    fleet: Arc<SimFleet>,
}

impl SimUsbFactory {
    pub fn new(fleet: Arc<SimFleet>) -> Self {
        Self { fleet }
    }
}

impl BackendFactory for SimUsbFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Sim
    }

    fn name(&self) -> &str {
        "sim-usb"
    }

    fn probe(&self) -> Result<Vec<DevInfo>> {
        Ok(self
            .fleet
            .devices
            .read()
            .iter()
            .filter(|d| !d.is_open())
            .map(|d| d.info())
            .collect())
    }

    fn open(&self, info: &DevInfo) -> Result<Arc<dyn TransportBackend>> {
        let device = self
            .fleet
            .devices
            .read()
            .iter()
            .find(|d| info.matches(&d.info()))
            .cloned()
            .ok_or_else(|| SdrError::NotFound {
                identifier: info.to_string(),
            })?;
        let backend: Arc<dyn TransportBackend> = SimUsbBackend::open(device)?;
        Ok(backend)
    }
}
