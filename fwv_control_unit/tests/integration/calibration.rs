//! End-stop calibration scenarios: full and quick passes, zero-point
//! refinement, boot-time consistency checks and the seek timeout branch.

use fwv_common::angle::linear_diff;
use fwv_common::condition::ProtectCause;
use fwv_common::config::ControlConfig;
use fwv_common::hal::{CAL_VALID_CODE, CalRecord, MODE_A, MODE_B};
use fwv_common::state::ValveState;

use super::common::{Rig, TICKS_PER_MS};

/// Run until the calibration pass ends in Standby, recording the maximum
/// angle visited. Panics if the pass neither completes nor faults.
fn run_calibration(rig: &mut Rig, timeout_ms: u64) -> i16 {
    let mut entered = false;
    let mut max_angle = rig.cu.current_angle();
    for _ in 0..timeout_ms {
        for _ in 0..TICKS_PER_MS {
            rig.step();
        }
        max_angle = max_angle.max(rig.cu.current_angle());
        match rig.cu.valve_state() {
            ValveState::Calibration => entered = true,
            ValveState::Standby if entered => return max_angle,
            _ => {}
        }
    }
    panic!(
        "calibration never finished: valve {:?}, angle {}",
        rig.cu.valve_state(),
        rig.cu.current_angle()
    );
}

#[test]
fn full_pass_anchors_both_modes_and_refines_the_zero_point() {
    let mut rig = Rig::new();
    // Mechanics sit 4° away from the factory zero-point.
    rig.plant.low_stop += 40.0;
    rig.plant.high_stop += 40.0;
    rig.boot_to_standby();

    rig.plant.bus.initial_request = true;
    run_calibration(&mut rig, 10_000);

    let modes = rig.cu.mode_angles();
    assert!(linear_diff(modes[MODE_A as usize], 2885) <= 15, "{modes:?}");
    assert!(linear_diff(modes[MODE_B as usize], 1985) <= 15, "{modes:?}");

    // The zero-point absorbed the 4° shift and was persisted.
    assert!(linear_diff(rig.cu.sensor_offset(), 1070) <= 15);
    assert!(rig.plant.nv.cal_writes >= 1);

    // The pass parks the valve at mode B.
    assert!(linear_diff(rig.cu.current_angle(), modes[MODE_B as usize]) <= 30);
}

#[test]
fn quick_pass_stays_at_the_near_stop() {
    let mut rig = Rig::new();
    rig.boot_to_standby();

    rig.cu.request_calibration(false);
    let max_angle = run_calibration(&mut rig, 10_000);

    // Parked at mode B, the quick pass seeks the low stop only.
    assert!(max_angle < 2500, "quick pass visited {max_angle}");
    let modes = rig.cu.mode_angles();
    assert!(linear_diff(modes[MODE_B as usize], 1985) <= 15);
}

#[test]
fn boot_requests_a_full_pass_when_memory_disagrees() {
    // Persisted record claims the shaft parked far from where it is.
    let mut rig = Rig::with_plant_setup(ControlConfig::default(), |plant| {
        plant.nv.cal = Some(CalRecord {
            offset: 1110,
            last_angle: 3000,
            code: CAL_VALID_CODE,
        });
    });
    rig.boot_to_standby();

    assert!(
        rig.run_until(200, |r| r.cu.valve_state() == ValveState::Calibration),
        "boot mismatch did not trigger a calibration pass"
    );
}

#[test]
fn boot_skips_calibration_when_memory_matches() {
    let mut rig = Rig::with_plant_setup(ControlConfig::default(), |plant| {
        plant.nv.cal = Some(CalRecord {
            offset: 1110,
            last_angle: 1985,
            code: CAL_VALID_CODE,
        });
    });
    rig.boot_to_standby();

    rig.run_ms(500);
    assert_eq!(rig.cu.valve_state(), ValveState::Standby);
}

#[test]
fn seek_timeout_faults_and_recovers_within_budget() {
    let mut cfg = ControlConfig::default();
    cfg.valve.full_cal_timeout = 300;
    cfg.valve.quick_cal_timeout = 300;
    cfg.valve.fault_settle = 100;
    let mut rig = Rig::with_config(cfg);
    // Crippled drive: too slow to reach a stop before the seek timeout,
    // too little current to ever read as stalled.
    rig.plant.full_speed = 0.001;
    rig.boot_to_standby();

    rig.cu.request_calibration(true);
    assert!(
        rig.run_until(2000, |r| r.cu.valve_state() == ValveState::Fault),
        "seek timeout did not raise the calibration fault"
    );
    assert_eq!(rig.cu.latest_event().cause, ProtectCause::CalibrationFault);

    // First failure is inside the retry budget: the valve settles back to
    // Standby without latching the summary fault.
    assert!(rig.run_until(2000, |r| r.cu.valve_state() == ValveState::Standby));
    assert!(!rig.cu.fault_mode());
}

#[test]
fn exhausted_calibration_retries_latch_the_fault() {
    let mut cfg = ControlConfig::default();
    cfg.valve.full_cal_timeout = 200;
    cfg.valve.quick_cal_timeout = 200;
    cfg.valve.fault_settle = 100;
    let mut rig = Rig::with_config(cfg);
    rig.plant.full_speed = 0.001;
    rig.boot_to_standby();

    // Budget is three retries; the fourth failure latches.
    for _ in 0..4 {
        rig.cu.request_calibration(true);
        assert!(rig.run_until(2000, |r| r.cu.valve_state() == ValveState::Fault));
        rig.run_ms(400);
    }
    assert!(rig.cu.fault_mode());
    assert_eq!(rig.cu.valve_state(), ValveState::Fault);
    assert!(rig.plant.bus.calibration_fail);
}
