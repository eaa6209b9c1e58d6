//! Ignition-off sequencing, the low-power persistence flush, and the forced
//! production diagnostic cycle.

use fwv_common::config::ControlConfig;
use fwv_common::hal::CAL_VALID_CODE;
use fwv_common::state::{MotorState, ValveState};

use super::common::Rig;

#[test]
fn ignition_off_latches_and_low_power_flushes_persistence() {
    let mut cfg = ControlConfig::default();
    cfg.valve.power_latch_to_lowpower = 300;
    let mut rig = Rig::with_config(cfg);
    rig.boot_to_standby();

    rig.plant.set_ignition(false);
    assert!(
        rig.run_until(1000, |r| r.cu.valve_state() == ValveState::PowerLatch),
        "ignition off never latched"
    );
    assert!(
        rig.run_until(1000, |r| r.cu.valve_state() == ValveState::LowPower),
        "power latch never timed out into low power"
    );

    // Entry wrote the calibration record and requested transceiver sleep.
    assert!(rig.plant.bus.sleep_requested);
    let record = rig.plant.nv.cal.expect("calibration record flushed");
    assert_eq!(record.code, CAL_VALID_CODE);
    assert_eq!(record.offset, 1110);

    // Ignition back: low power always resumes at Standby.
    rig.plant.set_ignition(true);
    assert!(rig.run_until(1000, |r| r.cu.valve_state() == ValveState::Standby));
}

#[test]
fn power_latch_resumes_the_pre_empted_state() {
    let mut rig = Rig::new();
    rig.boot_to_standby();

    rig.plant.bus.forced_diag = true;
    assert!(rig.run_until(100, |r| r.cu.valve_state() == ValveState::DiagRun));

    rig.plant.set_ignition(false);
    assert!(rig.run_until(1000, |r| r.cu.valve_state() == ValveState::PowerLatch));
    rig.run_ms(10);
    assert_eq!(rig.cu.motor_state(), MotorState::Stopped);

    // Ignition returns before the low-power timeout: resume the self-test.
    rig.plant.set_ignition(true);
    assert!(rig.run_until(1000, |r| r.cu.valve_state() == ValveState::DiagRun));
}

#[test]
fn forced_diag_cycles_the_valve_between_the_modes() {
    let mut cfg = ControlConfig::default();
    cfg.valve.diag_dwell = 200;
    let mut rig = Rig::with_config(cfg);
    rig.boot_to_standby();

    // Forced diagnostic runs independently of the bus move-enable.
    rig.plant.bus.move_enable = false;
    rig.plant.bus.forced_diag = true;
    assert!(rig.run_until(100, |r| r.cu.valve_state() == ValveState::DiagRun));
    rig.run_ms(10);
    assert!(rig.plant.bus.diag_forced_status);

    // The cycle reaches mode A and returns toward mode B.
    let mode_a = rig.cu.mode_angles()[0];
    assert!(
        rig.run_until(5000, |r| r.cu.current_angle() > mode_a - 50),
        "diag cycle never reached mode A"
    );
    let mode_b = rig.cu.mode_angles()[1];
    assert!(
        rig.run_until(5000, |r| r.cu.current_angle() < mode_b + 50),
        "diag cycle never returned to mode B"
    );
    assert_eq!(rig.cu.valve_state(), ValveState::DiagRun);

    // Releasing the input ends the self-test once motion stops.
    rig.plant.bus.forced_diag = false;
    assert!(rig.run_until(2000, |r| r.cu.valve_state() == ValveState::Standby));
}
