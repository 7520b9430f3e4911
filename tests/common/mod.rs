//! Shared fixtures for device-handle integration tests.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use sdr_driver_sim::{DeviceSpec, SimDevice, SimFleet};
use sdrhal::{Device, Registry};
use std::sync::Arc;

pub const REV1_SERIAL: &str = "a1b2c3";
pub const REV2_SERIAL: &str = "d4e5f6";

/// A fleet holding `specs` and a registry over it.
pub fn fleet(specs: impl IntoIterator<Item = DeviceSpec>) -> (Arc<SimFleet>, Registry) {
    let fleet = SimFleet::with_devices(specs);
    let registry = Registry::simulated(&fleet);
    (fleet, registry)
}

/// Open `serial` and return the handle with its simulated hardware.
pub fn open(fleet: &Arc<SimFleet>, registry: &Registry, serial: &str) -> Result<(Device, Arc<SimDevice>)> {
    let device = Device::open(registry, &format!("sim:serial={}", serial))?;
    let hw = fleet
        .device(serial)
        .ok_or_else(|| anyhow!("{} missing from fleet", serial))?;
    Ok((device, hw))
}

/// A single open rev1 device.
pub fn rev1() -> Result<(Device, Arc<SimDevice>)> {
    let (fleet, registry) = fleet([DeviceSpec::rev1(REV1_SERIAL)]);
    open(&fleet, &registry, REV1_SERIAL)
}

/// A single open rev2 device.
pub fn rev2() -> Result<(Device, Arc<SimDevice>)> {
    let (fleet, registry) = fleet([DeviceSpec::rev2(REV2_SERIAL)]);
    open(&fleet, &registry, REV2_SERIAL)
}
