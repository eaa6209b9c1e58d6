//! Protection scenarios: supply excursions, motor over-current, chip
//! temperature and loss of bus communication.

use fwv_common::condition::{ProtectCause, SupplyCondition, TemperatureCondition};
use fwv_common::config::ControlConfig;
use fwv_common::hal::MODE_A;
use fwv_common::state::{MotorState, ValveState};

use super::common::Rig;

#[test]
fn undervoltage_debounces_in_and_out() {
    let mut rig = Rig::new();
    rig.boot_to_standby();

    // 7.00 V sits below the undervoltage stop threshold.
    rig.plant.set_supply(700);
    assert!(
        rig.run_until(1500, |r| {
            r.cu.protection().supply_condition() == SupplyCondition::Undervoltage
        }),
        "undervoltage never debounced in"
    );
    assert_eq!(rig.cu.valve_state(), ValveState::Protection);
    assert_eq!(rig.cu.protection_cause(), ProtectCause::SupplyLow);
    rig.run_ms(10);
    assert!(rig.plant.bus.undervoltage);
    assert!(rig.plant.bus.protect_mode);

    // 10.00 V clears through the return threshold; the valve auto-recovers.
    rig.plant.set_supply(1000);
    assert!(
        rig.run_until(1500, |r| {
            r.cu.protection().supply_condition() == SupplyCondition::Normal
        }),
        "undervoltage never debounced out"
    );
    assert!(rig.run_until(5000, |r| r.cu.valve_state() == ValveState::Standby));
    assert!(!rig.cu.fault_mode());
    rig.run_ms(10);
    assert!(!rig.plant.bus.undervoltage);
}

#[test]
fn sustained_overcurrent_faults_the_motor_then_recovers() {
    let mut rig = Rig::new();
    rig.boot_to_standby();

    rig.plant.bus.move_enable = true;
    rig.plant.bus.target_mode = MODE_A;
    assert!(rig.run_until(500, |r| r.cu.motor_state() == MotorState::Running));

    // Winding current pinned above the over-current ceiling.
    rig.plant.forced_current_ma = Some(1600);
    assert!(
        rig.run_until(2000, |r| r.cu.motor_state() == MotorState::Fault),
        "over-current never tripped"
    );
    assert!(!rig.plant.bridge.enabled);
    assert_eq!(rig.cu.latest_event().cause, ProtectCause::MotorOvercurrent);
    assert_eq!(rig.cu.valve_state(), ValveState::Protection);
    rig.run_ms(10);
    assert!(rig.plant.bus.overcurrent);

    // Condition gone: the protection settle clears the flag, re-arms the
    // bridge and the interrupted move resumes.
    rig.plant.forced_current_ma = None;
    assert!(
        rig.run_until(10_000, |r| {
            r.cu.valve_state() == ValveState::Standby && r.plant.bus.actual_mode == MODE_A
        }),
        "valve never recovered from the over-current excursion"
    );
    assert!(rig.plant.bridge.drive_rearms >= 1);
    assert_eq!(rig.cu.motor_state(), MotorState::Stopped);
}

#[test]
fn overtemperature_protection_with_hysteresis() {
    let mut rig = Rig::new();
    rig.boot_to_standby();

    rig.plant.set_temperature(140);
    assert!(
        rig.run_until(500, |r| {
            r.cu.protection().temperature_condition() == TemperatureCondition::High
        }),
        "overtemperature never debounced in"
    );
    assert_eq!(rig.cu.valve_state(), ValveState::Protection);
    rig.run_ms(10);
    assert!(rig.plant.bus.overtemperature);

    // 130 °C is inside the hysteresis band: the condition must hold.
    rig.plant.set_temperature(130);
    rig.run_ms(500);
    assert_eq!(
        rig.cu.protection().temperature_condition(),
        TemperatureCondition::High
    );

    rig.plant.set_temperature(120);
    assert!(rig.run_until(5000, |r| r.cu.valve_state() == ValveState::Standby));
}

#[test]
fn bus_silence_raises_the_communication_protection() {
    let mut cfg = ControlConfig::default();
    cfg.valve.live_timeout = 300;
    cfg.valve.protection_settle = 200;
    let mut rig = Rig::with_config(cfg);
    rig.boot_to_standby();

    // No frames: the live countdown expires.
    rig.run_ms_silent(400);
    assert_eq!(rig.cu.valve_state(), ValveState::Protection);
    assert!(rig.plant.bus.comm_error);

    // Traffic returns: the countdown reloads and the valve recovers.
    assert!(rig.run_until(2000, |r| r.cu.valve_state() == ValveState::Standby));
    assert!(!rig.plant.bus.comm_error);
}

#[test]
fn mcu_fault_routes_to_protection() {
    let mut rig = Rig::new();
    rig.boot_to_standby();

    rig.plant.set_vdda(290);
    assert!(
        rig.run_until(1000, |r| r.cu.protection().mcu_fault()),
        "VDDA droop never flagged the MCU fault"
    );
    assert_eq!(rig.cu.valve_state(), ValveState::Protection);
    assert_eq!(rig.cu.protection_cause(), ProtectCause::McuFault);

    rig.plant.set_vdda(330);
    assert!(rig.run_until(5000, |r| r.cu.valve_state() == ValveState::Standby));
}
