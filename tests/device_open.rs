//! Opening through configuration and the process-wide registry.

mod common;

use anyhow::Result;
use common::{REV1_SERIAL, REV2_SERIAL};
use sdr_driver_sim::DeviceSpec;
use sdrhal::{registry, Channel, Device, ErrorKind, HalConfig, Registry, SampleFormat};
use serial_test::serial;
use std::io::Write;
use std::time::Duration;

#[test]
fn test_empty_identifier_opens_first_device() -> Result<()> {
    let (_fleet, registry) = common::fleet([DeviceSpec::rev2(REV2_SERIAL), DeviceSpec::rev1(REV1_SERIAL)]);
    let first = Device::open(&registry, "")?;
    let second = Device::open(&registry, "")?;

    let mut serials = vec![first.info().serial.clone(), second.info().serial.clone()];
    serials.sort();
    assert_eq!(serials, vec![REV1_SERIAL, REV2_SERIAL]);

    let err = Device::open(&registry, "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
}

#[test]
fn test_open_selects_board_by_product() -> Result<()> {
    let (_fleet, registry) = common::fleet([DeviceSpec::rev1(REV1_SERIAL), DeviceSpec::rev2(REV2_SERIAL)]);
    let rev2 = Device::open(&registry, &format!("sim:serial={}", REV2_SERIAL))?;
    assert_eq!(rev2.board_name(), "sim-rev2");

    // No board factories: the device is found but nothing can drive it.
    let backends_only = registry
        .backends()
        .iter()
        .fold(Registry::builder(), |b, f| b.backend(f.clone()))
        .build();
    let err = Device::open(&backends_only, "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    // A failed board open leaves the device free.
    assert_eq!(registry.probe().len(), 1);
    Ok(())
}

#[test]
#[serial]
fn test_open_from_config_file() -> Result<()> {
    let (fleet, registry) = common::fleet([DeviceSpec::rev1(REV1_SERIAL), DeviceSpec::rev2(REV2_SERIAL)]);

    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    writeln!(
        file,
        r#"
        [device]
        identifier = "sim:serial={}"

        [stream]
        format = "sc8_q7"
        num_buffers = 8
        samples_per_buffer = 4096
        num_transfers = 2
        timeout_ms = 300
        "#,
        REV2_SERIAL
    )?;
    let config = HalConfig::load_from(file.path())?;
    config.validate()?;

    let device = Device::open_from_config(&registry, &config)?;
    assert_eq!(device.info().serial, REV2_SERIAL);
    let defaults = device.stream_defaults();
    assert_eq!(defaults.format, SampleFormat::Sc8Q7);
    assert_eq!(defaults.samples_per_buffer, 4096);
    assert_eq!(defaults.timeout, Duration::from_millis(300));

    device.sync_config(sdrhal::ChannelLayout::RxX1, defaults.clone())?;
    device.close()?;
    assert!(fleet.device(REV2_SERIAL).is_some_and(|d| !d.is_open()));
    Ok(())
}

#[test]
#[serial]
fn test_open_default_uses_installed_registry() -> Result<()> {
    let fleet = sdr_driver_sim::SimFleet::with_devices([DeviceSpec::rev1(REV1_SERIAL)]);

    if registry::global().is_none() {
        let err = Device::open_default("").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        registry::install(Registry::simulated(&fleet))?;
    }
    let err = registry::install(Registry::simulated(&fleet)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let device = Device::open_default(&format!("sim:serial={}", REV1_SERIAL))?;
    device.set_frequency(Channel::RX0, 768_000_000)?;
    assert_eq!(device.get_frequency(Channel::RX0)?, 768_000_000);
    Ok(())
}
