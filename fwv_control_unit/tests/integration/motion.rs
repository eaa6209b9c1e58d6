//! Commanded-move scenarios: mode changes over the bus, soft-start/soft-stop
//! sequencing, arrival verification and command idempotence.

use fwv_common::angle::linear_diff;
use fwv_common::hal::{MODE_A, MODE_B};
use fwv_common::state::{MotorState, ValveState};

use super::common::{Rig, TICKS_PER_MS};

/// Run until the valve is back in Standby, recording every motor state seen.
fn run_move(rig: &mut Rig, timeout_ms: u64) -> Vec<MotorState> {
    let mut seen = vec![rig.cu.motor_state()];
    let mut moved = false;
    for _ in 0..timeout_ms {
        for _ in 0..TICKS_PER_MS {
            rig.step();
        }
        let state = rig.cu.motor_state();
        if seen.last() != Some(&state) {
            seen.push(state);
        }
        moved |= state.is_moving();
        if moved && rig.cu.valve_state() == ValveState::Standby {
            return seen;
        }
    }
    panic!(
        "move never completed: valve {:?}, motor {:?}, angle {}",
        rig.cu.valve_state(),
        rig.cu.motor_state(),
        rig.cu.current_angle()
    );
}

#[test]
fn commanded_move_runs_the_full_drive_sequence() {
    let mut rig = Rig::new();
    rig.boot_to_standby();

    rig.plant.bus.move_enable = true;
    rig.plant.bus.target_mode = MODE_A;
    let seen = run_move(&mut rig, 3000);

    // Soft-start ramp, full speed, soft-stop, standstill.
    assert!(seen.contains(&MotorState::Accelerating), "{seen:?}");
    assert!(seen.contains(&MotorState::Running), "{seen:?}");
    assert!(seen.contains(&MotorState::Decelerating), "{seen:?}");
    assert_eq!(*seen.last().unwrap(), MotorState::Stopped);

    // Landed within 3° of the mode A angle.
    let target = rig.cu.mode_angles()[MODE_A as usize];
    assert!(
        linear_diff(rig.cu.current_angle(), target) <= 30,
        "landed at {} instead of {target}",
        rig.cu.current_angle()
    );

    // Status mirror reflects the arrival.
    assert_eq!(rig.plant.bus.actual_mode, MODE_A);
    assert!(!rig.plant.bus.move_status);
    assert_eq!(rig.plant.bus.stall_zone, 0);
}

#[test]
fn repeated_command_does_not_rearm_the_drive() {
    let mut rig = Rig::new();
    rig.boot_to_standby();

    rig.plant.bus.move_enable = true;
    rig.plant.bus.target_mode = MODE_A;
    run_move(&mut rig, 3000);

    // Same mode kept on the bus: the drive must stay at rest.
    for _ in 0..500 {
        rig.run_ms(1);
        assert_eq!(rig.cu.motor_state(), MotorState::Stopped);
    }
    assert_eq!(rig.cu.valve_state(), ValveState::Standby);
}

#[test]
fn mode_change_reverses_back() {
    let mut rig = Rig::new();
    rig.boot_to_standby();

    rig.plant.bus.move_enable = true;
    rig.plant.bus.target_mode = MODE_A;
    run_move(&mut rig, 3000);

    rig.plant.bus.target_mode = MODE_B;
    run_move(&mut rig, 3000);

    let target = rig.cu.mode_angles()[MODE_B as usize];
    assert!(linear_diff(rig.cu.current_angle(), target) <= 30);
    assert_eq!(rig.plant.bus.actual_mode, MODE_B);
}

#[test]
fn move_ignored_without_move_enable() {
    let mut rig = Rig::new();
    rig.boot_to_standby();

    rig.plant.bus.move_enable = false;
    rig.plant.bus.target_mode = MODE_A;
    rig.run_ms(500);

    assert_eq!(rig.cu.valve_state(), ValveState::Standby);
    assert_eq!(rig.cu.motor_state(), MotorState::Stopped);
    assert_eq!(rig.plant.bus.actual_mode, MODE_B);
}
