//! Motor-fault routing: permanent stall into the bounded-retry Fault state,
//! obstruction and sensor-mismatch excursions into Protection, and the
//! commanded-move timeout.

use fwv_common::condition::ProtectCause;
use fwv_common::config::ControlConfig;
use fwv_common::hal::MODE_A;
use fwv_common::state::{MotorState, ValveState};

use super::common::Rig;

#[test]
fn permanent_stall_routes_to_fault_and_recovers() {
    let mut cfg = ControlConfig::default();
    cfg.valve.fault_settle = 200;
    let mut rig = Rig::with_config(cfg);
    rig.boot_to_standby();

    // Obstacle just past the parked position: the drive jams on its way to A.
    rig.plant.high_stop = 950.0;
    rig.plant.bus.move_enable = true;
    rig.plant.bus.target_mode = MODE_A;
    assert!(
        rig.run_until(5000, |r| r.cu.valve_state() == ValveState::Fault),
        "permanent stall never routed to Fault"
    );
    assert_eq!(rig.cu.motor_state(), MotorState::Stalled);
    assert_eq!(rig.cu.latest_event().cause, ProtectCause::MotorStall);

    // Release the command; the first retry is inside the budget.
    rig.plant.bus.move_enable = false;
    assert!(
        rig.run_until(2000, |r| {
            r.cu.valve_state() == ValveState::Standby && r.cu.motor_state() == MotorState::Stopped
        }),
        "stall retry never released the valve"
    );
    assert!(!rig.cu.fault_mode());
}

#[test]
fn obstruction_routes_to_protection() {
    let mut rig = Rig::new();
    rig.boot_to_standby();

    // Dragging load: elevated current while the 20 ms position delta sits in
    // the suspicious low-but-nonzero band.
    rig.plant.full_speed = 0.04;
    rig.plant.forced_current_ma = Some(750);
    rig.plant.bus.move_enable = true;
    rig.plant.bus.target_mode = MODE_A;
    assert!(
        rig.run_until(5000, |r| r.cu.valve_state() == ValveState::Protection),
        "obstruction never routed to Protection"
    );
    assert_eq!(rig.cu.protection_cause(), ProtectCause::Obstruction);
    assert_eq!(rig.cu.latest_event().cause, ProtectCause::Obstruction);
    rig.run_ms(10);
    assert!(rig.plant.bus.motor_stall);
}

#[test]
fn sensor_mismatch_routes_to_protection() {
    let mut rig = Rig::new();
    rig.boot_to_standby();

    // The jammed drive draws too little current to read as a stall, but the
    // motion sensor reports standstill while the drive is at speed.
    rig.plant.high_stop = 950.0;
    rig.plant.stall_current_ma = 600;
    rig.plant.bus.move_enable = true;
    rig.plant.bus.target_mode = MODE_A;
    assert!(
        rig.run_until(10_000, |r| r.cu.valve_state() == ValveState::Protection),
        "sensor mismatch never routed to Protection"
    );
    assert_eq!(rig.cu.protection_cause(), ProtectCause::SensorFault);
    rig.run_ms(10);
    assert!(rig.plant.bus.position_sensor_fault);
}

#[test]
fn slow_move_times_out_into_position_fault() {
    let mut cfg = ControlConfig::default();
    cfg.valve.operation_timeout = 300;
    cfg.valve.protection_settle = 200;
    let mut rig = Rig::with_config(cfg);
    rig.plant.full_speed = 0.001;
    rig.boot_to_standby();

    rig.plant.bus.move_enable = true;
    rig.plant.bus.target_mode = MODE_A;
    assert!(
        rig.run_until(2000, |r| r.cu.valve_state() == ValveState::Protection),
        "operation timeout never raised the position fault"
    );
    assert_eq!(rig.cu.protection_cause(), ProtectCause::PositionFault);
    rig.run_ms(10);
    assert!(rig.plant.bus.position_fault);

    // Stop commanding; the budgeted retry clears the fault after the settle.
    rig.plant.bus.move_enable = false;
    assert!(
        rig.run_until(2000, |r| r.cu.valve_state() == ValveState::Standby),
        "position fault never auto-recovered"
    );
    assert!(!rig.cu.fault_mode());
}
