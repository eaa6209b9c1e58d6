//! Tuned configuration for the actuator control unit.
//!
//! Every empirically tuned constant (protection thresholds, debounce counts,
//! motor duty ramps, the voltage-indexed stall table, calibration geometry)
//! lives here as configuration data with validated defaults matching the
//! production hardware. Units are documented per field: voltages in 10 mV,
//! currents in mA, temperatures in °C, angles in tenths of a degree, times in
//! ticks of the owning task (1 ms unless stated otherwise).

use serde::{Deserialize, Serialize};

// ─── Protection thresholds ──────────────────────────────────────────

/// Supply-voltage band with hysteresis [10 mV].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupplyThresholds {
    /// Undervoltage entry threshold.
    pub under_stop: u16,
    /// Undervoltage exit threshold (must exceed `under_stop`).
    pub under_return: u16,
    /// Overvoltage entry threshold.
    pub over_stop: u16,
    /// Overvoltage exit threshold (must sit below `over_stop`).
    pub over_return: u16,
    /// Consecutive-biased sample count before a transition [1 ms ticks].
    pub debounce: u16,
}

impl Default for SupplyThresholds {
    fn default() -> Self {
        Self {
            under_stop: 800,
            under_return: 900,
            over_stop: 1700,
            over_return: 1600,
            debounce: 1000,
        }
    }
}

/// Ignition input band [10 mV].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnitionThresholds {
    /// Ignition-off entry threshold.
    pub off_stop: u16,
    /// Ignition-off exit threshold.
    pub off_return: u16,
    /// Debounce count for normal operation.
    pub debounce: u16,
    /// Fast debounce used to resolve the power-up state.
    pub bootstrap_count: u16,
}

impl Default for IgnitionThresholds {
    fn default() -> Self {
        Self {
            off_stop: 700,
            off_return: 800,
            debounce: 500,
            bootstrap_count: 10,
        }
    }
}

/// Chip temperature band [°C].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureThresholds {
    /// Low-temperature entry threshold.
    pub low_stop: i16,
    /// Low-temperature exit threshold.
    pub low_return: i16,
    /// High-temperature entry threshold.
    pub high_stop: i16,
    /// High-temperature exit threshold.
    pub high_return: i16,
    /// Debounce count.
    pub debounce: u16,
}

impl Default for TemperatureThresholds {
    fn default() -> Self {
        Self {
            low_stop: 0,
            low_return: 10,
            high_stop: 135,
            high_return: 125,
            debounce: 100,
        }
    }
}

/// VDDA / MCU-health filter [10 mV].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct McuThresholds {
    /// VDDA at or below this flags an MCU fault.
    pub fault_below: u16,
    /// VDDA at or above this clears the fault.
    pub clear_above: u16,
    /// Asymmetric filter length on both sides.
    pub debounce: u16,
}

impl Default for McuThresholds {
    fn default() -> Self {
        Self {
            fault_below: 300,
            clear_above: 320,
            debounce: 500,
        }
    }
}

/// Protection monitor configuration bundle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    pub supply: SupplyThresholds,
    pub ignition: IgnitionThresholds,
    pub temperature: TemperatureThresholds,
    pub mcu: McuThresholds,
}

// ─── Motor drive ────────────────────────────────────────────────────

/// One row of the voltage-indexed tuning table.
///
/// Lower supply voltage means lower current thresholds and a higher minimum
/// duty floor. Rows are selected by the first `max_voltage` at or above the
/// measured supply; the last row uses `u16::MAX` as a catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutyTableRow {
    /// Upper supply voltage bound for this row [10 mV].
    pub max_voltage: u16,
    /// Minimum 20 ms position delta that counts as motion [0.1°].
    pub motion_threshold: i16,
    /// Obstruction (half) current threshold [mA].
    pub obstruction_current: u16,
    /// Hard-stall current threshold [mA].
    pub stall_current: u16,
    /// Deceleration duty floor [PWM counts].
    pub min_duty: u16,
}

/// Motor controller tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    /// Full-scale PWM duty [counts].
    pub max_duty: u16,
    /// Soft-start initial duty.
    pub start_duty: u16,
    /// Soft-start duty increment per 1 ms tick.
    pub accel_step: u16,
    /// Duty at which the ramp hands over to full-speed running.
    pub run_entry_duty: u16,
    /// Remaining distance that opens the deceleration window [0.1°].
    pub decel_window: i16,
    /// Base duty decrement per 1 ms tick while decelerating.
    pub decel_step: u16,
    /// Fallback deceleration duty floor (overridden by the duty table).
    pub min_duty: u16,
    /// New-target re-arm hysteresis [0.1°].
    pub on_hysteresis: i16,
    /// Position-reached window [0.1°].
    pub off_hysteresis: i16,
    /// Direction-reversal settle time [1 ms ticks].
    pub pause_settle: u16,
    /// Swap the direction derived from the position error sign.
    pub invert_polarity: bool,
    /// Stall detection blanking after output enable [100 µs ticks].
    pub stall_mask: u16,
    /// Position delta floor below which slow motion is not suspicious [0.1°].
    pub obstruction_delta_floor: i16,
    /// Obstruction counter trip point [100 µs ticks].
    pub obstruction_trip: u16,
    /// Hard-stall counter trip point [100 µs ticks].
    pub stall_trip: u16,
    /// Open-phase current ceiling [mA].
    pub open_current_max: u16,
    /// Open-phase counter trip point [100 µs ticks].
    pub open_trip: u16,
    /// Over-current ceiling [mA].
    pub overcurrent_ceiling: u16,
    /// Over-current counter trip point [100 µs ticks].
    pub overcurrent_trip: u16,
    /// Per-class detector enables.
    pub stall_detect_enabled: bool,
    pub open_detect_enabled: bool,
    pub overcurrent_detect_enabled: bool,
    pub short_detect_enabled: bool,
    /// Motion sensor sampling period [1 ms ticks].
    pub motion_sample_period: u16,
    /// Motion sensor blanking after enable [1 ms ticks].
    pub motion_blanking: u16,
    /// Braking hold time after disable before coasting [1 ms ticks].
    pub brake_hold: u16,
    /// Voltage-indexed thresholds, ascending `max_voltage`.
    pub duty_table: Vec<DutyTableRow>,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            max_duty: 2048,
            start_duty: 204,
            accel_step: 102,
            run_entry_duty: 1843,
            decel_window: 40,
            decel_step: 20,
            min_duty: 512,
            on_hysteresis: 10,
            off_hysteresis: 3,
            pause_settle: 100,
            invert_polarity: true,
            stall_mask: 1000,
            obstruction_delta_floor: 3,
            obstruction_trip: 3000,
            stall_trip: 5000,
            open_current_max: 5,
            open_trip: 5000,
            overcurrent_ceiling: 1500,
            overcurrent_trip: 5000,
            stall_detect_enabled: true,
            open_detect_enabled: true,
            overcurrent_detect_enabled: true,
            short_detect_enabled: true,
            motion_sample_period: 20,
            motion_blanking: 50,
            brake_hold: 1000,
            duty_table: vec![
                DutyTableRow { max_voltage: 950, motion_threshold: 10, obstruction_current: 550, stall_current: 650, min_duty: 716 },
                DutyTableRow { max_voltage: 1050, motion_threshold: 11, obstruction_current: 600, stall_current: 700, min_duty: 655 },
                DutyTableRow { max_voltage: 1150, motion_threshold: 12, obstruction_current: 650, stall_current: 750, min_duty: 593 },
                DutyTableRow { max_voltage: 1250, motion_threshold: 14, obstruction_current: 700, stall_current: 800, min_duty: 512 },
                DutyTableRow { max_voltage: 1450, motion_threshold: 16, obstruction_current: 800, stall_current: 900, min_duty: 430 },
                DutyTableRow { max_voltage: u16::MAX, motion_threshold: 17, obstruction_current: 900, stall_current: 1000, min_duty: 368 },
            ],
        }
    }
}

/// Nominal-voltage tuning used only if the table is empty; validation
/// rejects such a table before it reaches the controller.
const FALLBACK_ROW: DutyTableRow = DutyTableRow {
    max_voltage: u16::MAX,
    motion_threshold: 14,
    obstruction_current: 700,
    stall_current: 800,
    min_duty: 512,
};

impl MotorConfig {
    /// Select the tuning row for the given supply voltage [10 mV].
    pub fn tuning_for_voltage(&self, voltage: u16) -> &DutyTableRow {
        self.duty_table
            .iter()
            .find(|row| voltage <= row.max_voltage)
            .or(self.duty_table.last())
            .unwrap_or(&FALLBACK_ROW)
    }
}

// ─── Valve orchestration ────────────────────────────────────────────

/// Valve controller timing, geometry and retry budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValveConfig {
    /// Positioning accuracy window [0.1°].
    pub accuracy_angle: i16,
    /// Offset drift that forces a persistence write [0.1°].
    pub cal_hysteresis: i16,
    /// Mechanical stop offset from the nearest mode position [0.1°].
    pub stopper_angle: i16,
    /// Factory default for the mode A (high end) angle [0.1°].
    pub mode_a_default: i16,
    /// Factory default for the mode B (low end) angle [0.1°].
    pub mode_b_default: i16,
    /// Seek target below the low stop for calibration [0.1°].
    pub low_seek_target: i16,
    /// Seek target beyond the high stop for calibration [0.1°].
    pub high_seek_target: i16,
    /// Nominal shaft angle at the low mechanical stop [0.1°].
    pub low_stop_nominal: i16,
    /// Full recalibration seek timeout [1 ms ticks].
    pub full_cal_timeout: u16,
    /// Quick recalibration seek timeout [1 ms ticks].
    pub quick_cal_timeout: u16,
    /// Verdict delay after commanding a seek [1 ms ticks].
    pub seek_verdict_delay: u16,
    /// Band above mode B inside which a quick calibration seeks the low stop [0.1°].
    pub quick_near_window: i16,
    /// Commanded-move timeout in Operation [1 ms ticks].
    pub operation_timeout: u16,
    /// Bus live-communication countdown reload [1 ms ticks].
    pub live_timeout: u16,
    /// Fault-state settle before retry clearing [1 ms ticks].
    pub fault_settle: u16,
    /// Protection-state settle before auto-clearing [1 ms ticks].
    pub protection_settle: u16,
    /// Per-class retry budget in Fault.
    pub fault_retry_budget: u8,
    /// Per-cause retry budget in Protection.
    pub protection_retry_budget: u8,
    /// Supply under/over-voltage escalation budget.
    pub supply_retry_budget: u8,
    /// Init settle before leaving the boot state [1 ms ticks].
    pub init_settle: u16,
    /// Undefined-state fallback delay [1 ms ticks].
    pub undef_settle: u16,
    /// Ignition-off dwell before entering low power [1 ms ticks].
    pub power_latch_to_lowpower: u16,
    /// Dwell at each end during the forced diagnostic run [1 ms ticks].
    pub diag_dwell: u16,
    /// Current above which a stopped sensor is suspicious [mA].
    pub mismatch_current: u16,
    /// Position-sensor mismatch counter trip point [1 ms ticks].
    pub mismatch_trip: u16,
    /// Threshold for actual-mode boundary tracking [0.1°].
    pub actual_mode_threshold: i16,
    /// Software version published on the bus.
    pub sw_version: u16,
}

impl Default for ValveConfig {
    fn default() -> Self {
        Self {
            accuracy_angle: 20,
            cal_hysteresis: 10,
            stopper_angle: 185,
            mode_a_default: 2885,
            mode_b_default: 1985,
            low_seek_target: -100,
            high_seek_target: 3700,
            low_stop_nominal: 1800,
            full_cal_timeout: 20000,
            quick_cal_timeout: 6000,
            seek_verdict_delay: 3,
            quick_near_window: 450,
            operation_timeout: 5000,
            live_timeout: 4000,
            fault_settle: 5000,
            protection_settle: 3000,
            fault_retry_budget: 3,
            protection_retry_budget: 10,
            supply_retry_budget: 30,
            init_settle: 5,
            undef_settle: 1000,
            power_latch_to_lowpower: 60_000,
            diag_dwell: 2000,
            mismatch_current: 500,
            mismatch_trip: 2000,
            actual_mode_threshold: 10,
            sw_version: 0x0001,
        }
    }
}

// ─── Sensor fusion ──────────────────────────────────────────────────

/// GMR pipeline and converted-reading tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Residual electrical offset on the differential sine [ADC counts].
    pub sine_offset: i16,
    /// Residual electrical offset on the differential cosine [ADC counts].
    pub cosine_offset: i16,
    /// Symmetric clamp bounding the atan2 inputs [ADC counts].
    pub swing_max: i16,
    /// Factory default zero-point [0.1°].
    pub default_sensor_offset: i16,
    /// Moving-average seed for the supply channel [ADC counts].
    pub supply_seed: u16,
    /// Moving-average seed for the temperature channel [ADC counts].
    pub temperature_seed: u16,
    /// Ignition conversion map: (raw ADC, voltage [10 mV]) pairs, ascending.
    pub ignition_map: Vec<(u16, u16)>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            sine_offset: -1,
            cosine_offset: 1,
            swing_max: 0x3FFF,
            default_sensor_offset: 1110,
            supply_seed: 0xFF,
            temperature_seed: 0x260,
            ignition_map: vec![(0x132, 650), (0x15B, 900), (0x178, 1200), (0x19B, 1800)],
        }
    }
}

// ─── Bundle + validation ────────────────────────────────────────────

/// Complete control-unit configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub protection: ProtectionConfig,
    pub motor: MotorConfig,
    pub valve: ValveConfig,
    pub fusion: FusionConfig,
}

impl ControlConfig {
    /// Validate cross-field consistency. Returns the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        let p = &self.protection;
        if p.supply.under_return <= p.supply.under_stop {
            return Err("supply.under_return must exceed supply.under_stop".into());
        }
        if p.supply.over_return >= p.supply.over_stop {
            return Err("supply.over_return must sit below supply.over_stop".into());
        }
        if p.ignition.off_return <= p.ignition.off_stop {
            return Err("ignition.off_return must exceed ignition.off_stop".into());
        }
        if p.temperature.high_return >= p.temperature.high_stop {
            return Err("temperature.high_return must sit below temperature.high_stop".into());
        }
        if p.temperature.low_return <= p.temperature.low_stop {
            return Err("temperature.low_return must exceed temperature.low_stop".into());
        }
        if p.mcu.clear_above <= p.mcu.fault_below {
            return Err("mcu.clear_above must exceed mcu.fault_below".into());
        }
        for (name, count) in [
            ("supply.debounce", p.supply.debounce),
            ("ignition.debounce", p.ignition.debounce),
            ("temperature.debounce", p.temperature.debounce),
            ("mcu.debounce", p.mcu.debounce),
        ] {
            if count == 0 {
                return Err(format!("{name} must be non-zero"));
            }
        }

        let m = &self.motor;
        if m.duty_table.is_empty() {
            return Err("motor.duty_table must not be empty".into());
        }
        if !m.duty_table.windows(2).all(|w| w[0].max_voltage < w[1].max_voltage) {
            return Err("motor.duty_table rows must have ascending max_voltage".into());
        }
        if m.duty_table.last().map(|r| r.max_voltage) != Some(u16::MAX) {
            return Err("motor.duty_table must end with a catch-all row (max_voltage = 65535)".into());
        }
        if m.start_duty >= m.run_entry_duty || m.run_entry_duty > m.max_duty {
            return Err("motor duty ramp must satisfy start < run_entry <= max".into());
        }
        if m.accel_step == 0 {
            return Err("motor.accel_step must be non-zero".into());
        }
        if m.off_hysteresis > m.on_hysteresis {
            return Err("motor.off_hysteresis must not exceed motor.on_hysteresis".into());
        }
        if m.duty_table.iter().any(|r| r.min_duty > m.max_duty) {
            return Err("duty_table.min_duty must not exceed motor.max_duty".into());
        }

        let v = &self.valve;
        if v.accuracy_angle <= 0 {
            return Err("valve.accuracy_angle must be positive".into());
        }
        if !(0..crate::angle::FULL_TURN).contains(&v.stopper_angle) {
            return Err("valve.stopper_angle must lie inside one turn".into());
        }
        if v.quick_cal_timeout == 0 || v.full_cal_timeout == 0 {
            return Err("calibration timeouts must be non-zero".into());
        }
        if crate::angle::linear_diff(v.mode_a_default, v.mode_b_default) < 900 {
            return Err("default mode angles must span at least a quarter turn".into());
        }

        let f = &self.fusion;
        if f.swing_max <= 0 {
            return Err("fusion.swing_max must be positive".into());
        }
        if f.ignition_map.len() < 2 {
            return Err("fusion.ignition_map needs at least two points".into());
        }
        if !f.ignition_map.windows(2).all(|w| w[0].0 < w[1].0) {
            return Err("fusion.ignition_map raw values must ascend".into());
        }

        Ok(())
    }
}
