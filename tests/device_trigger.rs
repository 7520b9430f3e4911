//! Trigger state machine on the device handle, with a master on one device
//! releasing a slave on another over the shared signal bus.

mod common;

use anyhow::Result;
use common::{REV1_SERIAL, REV2_SERIAL};
use sdr_driver_sim::DeviceSpec;
use sdrhal::{
    Channel, Direction, ErrorKind, Trigger, TriggerPhase, TriggerRole, TriggerSignal, TriggerState,
};

#[test]
fn test_master_releases_slave() -> Result<()> {
    let (fleet, registry) = common::fleet([DeviceSpec::rev2(REV2_SERIAL), DeviceSpec::rev1(REV1_SERIAL)]);
    let (master_dev, master_hw) = common::open(&fleet, &registry, REV2_SERIAL)?;
    let (slave_dev, slave_hw) = common::open(&fleet, &registry, REV1_SERIAL)?;
    let signal = TriggerSignal::User0;

    let mut master = master_dev.trigger_init(Channel::RX0, signal)?;
    master.role = TriggerRole::Master;
    let mut slave = slave_dev.trigger_init(Channel::RX0, signal)?;
    slave.role = TriggerRole::Slave;
    assert_eq!(master_dev.trigger_phase(&master)?, TriggerPhase::Initialized);

    slave_dev.trigger_arm(&slave, true, 0, 0)?;
    master_dev.trigger_arm(&master, true, 0, 0)?;
    assert_eq!(slave_dev.trigger_phase(&slave)?, TriggerPhase::Armed);
    assert!(!slave_dev.trigger_state(&slave)?.fired);

    slave_hw.advance_clock(Direction::Rx, 128);
    master_dev.trigger_fire(&master)?;

    assert_eq!(master_dev.trigger_phase(&master)?, TriggerPhase::Fired);
    assert!(master_dev.trigger_state(&master)?.fire_requested);
    let state = slave_dev.trigger_state(&slave)?;
    assert!(state.armed && state.fired);
    // The slave's host-side phase stays ARMED; the latch is hardware state.
    assert_eq!(slave_dev.trigger_phase(&slave)?, TriggerPhase::Armed);
    assert_eq!(slave_hw.fired_at(Direction::Rx, signal), Some(128));
    assert_eq!(master_hw.fired_at(Direction::Rx, signal), Some(0));
    Ok(())
}

#[test]
fn test_fire_is_idempotent() -> Result<()> {
    let (device, hw) = common::rev1()?;
    let mut trigger = device.trigger_init(Channel::RX0, TriggerSignal::J71_4)?;
    trigger.role = TriggerRole::Master;
    device.trigger_arm(&trigger, true, 0, 0)?;

    device.trigger_fire(&trigger)?;
    let first = device.trigger_state(&trigger)?;
    hw.advance_clock(Direction::Rx, 64);
    device.trigger_fire(&trigger)?;

    assert_eq!(device.trigger_phase(&trigger)?, TriggerPhase::Fired);
    assert_eq!(device.trigger_state(&trigger)?, first);
    assert_eq!(hw.fired_at(Direction::Rx, TriggerSignal::J71_4), Some(0));
    Ok(())
}

#[test]
fn test_uninitialized_descriptor_reads_all_false() -> Result<()> {
    let (device, _) = common::rev1()?;
    let never_bound = Trigger::unbound(Channel::RX0, TriggerSignal::User1);

    assert_eq!(device.trigger_state(&never_bound)?, TriggerState::default());
    assert_eq!(device.trigger_phase(&never_bound)?, TriggerPhase::Uninitialized);
    Ok(())
}

#[test]
fn test_phase_transitions_are_enforced() -> Result<()> {
    let (device, _) = common::rev1()?;
    let never_bound = Trigger::unbound(Channel::RX0, TriggerSignal::User2);
    let err = device.trigger_arm(&never_bound, true, 0, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = device.trigger_fire(&never_bound).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let mut trigger = device.trigger_init(Channel::RX0, TriggerSignal::User2)?;
    let err = device.trigger_init(Channel::RX0, TriggerSignal::User2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // Role must be chosen before arming.
    let err = device.trigger_arm(&trigger, true, 0, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(device.trigger_phase(&trigger)?, TriggerPhase::Initialized);

    trigger.role = TriggerRole::Master;
    let err = device.trigger_fire(&trigger).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    device.trigger_arm(&trigger, true, 0, 0)?;
    let err = device.trigger_arm(&trigger, true, 0, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    Ok(())
}

#[test]
fn test_only_master_fires() -> Result<()> {
    let (device, _) = common::rev1()?;
    let mut slave = device.trigger_init(Channel::RX0, TriggerSignal::User3)?;
    slave.role = TriggerRole::Slave;
    device.trigger_arm(&slave, true, 0, 0)?;

    let err = device.trigger_fire(&slave).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(device.trigger_phase(&slave)?, TriggerPhase::Armed);
    Ok(())
}

#[test]
fn test_disarm_releases_binding() -> Result<()> {
    let (device, _) = common::rev1()?;
    let mut old = device.trigger_init(Channel::RX0, TriggerSignal::User0)?;
    old.role = TriggerRole::Master;
    device.trigger_arm(&old, true, 0, 0)?;
    device.trigger_fire(&old)?;

    device.trigger_arm(&old, false, 0, 0)?;
    assert_eq!(device.trigger_phase(&old)?, TriggerPhase::Uninitialized);
    assert_eq!(device.trigger_state(&old)?, TriggerState::default());
    let err = device.trigger_arm(&old, false, 0, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // A fresh binding does not revive the old descriptor.
    let new = device.trigger_init(Channel::RX0, TriggerSignal::User0)?;
    assert_eq!(device.trigger_phase(&new)?, TriggerPhase::Initialized);
    assert_eq!(device.trigger_phase(&old)?, TriggerPhase::Uninitialized);
    Ok(())
}

#[test]
fn test_unrouted_signal_rejected_by_board() -> Result<()> {
    let (device, _) = common::rev1()?;
    let err = device.trigger_init(Channel::RX0, TriggerSignal::J51_1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // Nothing was bound.
    device.trigger_init(Channel::RX0, TriggerSignal::J71_4)?;
    Ok(())
}
