//! Simulated plant for host-side execution.
//!
//! [`SimPlant`] models the actuator well enough for the control core's
//! diagnostics to behave as they would on the vehicle: a first-order
//! duty-to-speed DC motor bounded by two mechanical end stops, a load-to-
//! current map that jumps to stall current when the shaft is blocked, GMR
//! sine/cosine synthesis from the true shaft angle, and adjustable supply /
//! ignition / temperature / VDDA sources.
//!
//! The plant is split into the four collaborator roles ([`SimAdc`],
//! [`SimBridge`], [`SimBus`], [`MemStore`]) so the tick entry points can
//! borrow them independently; [`SimPlant::step`] couples them once per
//! 100 µs physics step. All role state is public for test assertions and
//! fault injection.

use std::f64::consts::PI;
use std::path::PathBuf;

use fwv_common::angle::wrap;
use fwv_common::config::ControlConfig;
use fwv_common::hal::{
    AnalogInputs, BusSignals, CalRecord, DiagRecord, MODE_NONE, MotorBridge, NvMemory, StoreError,
};
use fwv_common::state::MotorDirection;

/// GMR differential amplitude [ADC counts].
const GMR_AMPLITUDE: f64 = 4000.0;
/// GMR single-ended mid-scale [ADC counts].
const GMR_MID: f64 = 8192.0;
/// Shaft speed at full duty [0.1° per 100 µs step].
const FULL_DUTY_SPEED: f64 = 0.1;

// ─── ADC front end ──────────────────────────────────────────────────

/// Raw conversion results, refreshed by the physics step.
#[derive(Debug, Clone, Default)]
pub struct SimAdc {
    pub supply: u16,
    pub temperature: u16,
    pub current: u16,
    pub vdda: u16,
    pub ignition: u16,
    pub gmr_neg_cosine: u16,
    pub gmr_neg_sine: u16,
    pub gmr_pos_cosine: u16,
    pub gmr_pos_sine: u16,
}

impl AnalogInputs for SimAdc {
    fn raw_supply(&self) -> u16 {
        self.supply
    }
    fn raw_temperature(&self) -> u16 {
        self.temperature
    }
    fn raw_current(&self) -> u16 {
        self.current
    }
    fn raw_vdda(&self) -> u16 {
        self.vdda
    }
    fn raw_ignition(&self) -> u16 {
        self.ignition
    }
    fn raw_gmr_neg_cosine(&self) -> u16 {
        self.gmr_neg_cosine
    }
    fn raw_gmr_neg_sine(&self) -> u16 {
        self.gmr_neg_sine
    }
    fn raw_gmr_pos_cosine(&self) -> u16 {
        self.gmr_pos_cosine
    }
    fn raw_gmr_pos_sine(&self) -> u16 {
        self.gmr_pos_sine
    }
}

// ─── H-bridge ───────────────────────────────────────────────────────

/// Drive latch mirror plus injectable hardware protection latches.
#[derive(Debug, Clone, Default)]
pub struct SimBridge {
    pub direction: MotorDirection,
    pub duty: u16,
    pub enabled: bool,
    pub braking: bool,
    pub coasting: bool,

    pub overcurrent_pending: bool,
    pub vds_pending: bool,
    pub overvoltage_pending: bool,
    pub undervoltage_pending: bool,
    pub overtemperature_pending: bool,

    pub drive_rearms: u32,
    pub overvoltage_rearms: u32,
    pub undervoltage_rearms: u32,
    pub overtemperature_rearms: u32,
}

impl MotorBridge for SimBridge {
    fn start(&mut self, direction: MotorDirection, duty: u16) {
        self.direction = direction;
        self.duty = duty;
        self.enabled = true;
        self.braking = false;
        self.coasting = false;
    }

    fn set_duty(&mut self, direction: MotorDirection, duty: u16) {
        self.direction = direction;
        self.duty = duty;
        self.enabled = true;
        self.braking = false;
        self.coasting = false;
    }

    fn brake(&mut self) {
        self.enabled = false;
        self.duty = 0;
        self.braking = true;
        self.coasting = false;
    }

    fn coast(&mut self) {
        self.enabled = false;
        self.duty = 0;
        self.braking = false;
        self.coasting = true;
    }

    fn overcurrent_pending(&self) -> bool {
        self.overcurrent_pending
    }
    fn vds_pending(&self) -> bool {
        self.vds_pending
    }
    fn overvoltage_pending(&self) -> bool {
        self.overvoltage_pending
    }
    fn undervoltage_pending(&self) -> bool {
        self.undervoltage_pending
    }
    fn overtemperature_pending(&self) -> bool {
        self.overtemperature_pending
    }

    fn rearm_overvoltage(&mut self) {
        self.overvoltage_pending = false;
        self.overvoltage_rearms += 1;
    }
    fn rearm_undervoltage(&mut self) {
        self.undervoltage_pending = false;
        self.undervoltage_rearms += 1;
    }
    fn rearm_overtemperature(&mut self) {
        self.overtemperature_pending = false;
        self.overtemperature_rearms += 1;
    }
    fn rearm_drive(&mut self) {
        self.overcurrent_pending = false;
        self.vds_pending = false;
        self.drive_rearms += 1;
    }
}

// ─── Bus signal layer ───────────────────────────────────────────────

/// Command inputs set by the scenario, status outputs written by the core.
#[derive(Debug, Clone)]
pub struct SimBus {
    // Commands toward the node.
    pub move_enable: bool,
    pub forced_diag: bool,
    pub target_mode: u8,
    pub initial_request: bool,

    // Status mirror from the node.
    pub actual_mode: u8,
    pub position_fault: bool,
    pub fault_mode: bool,
    pub protect_mode: bool,
    pub initial_status: bool,
    pub calibration_fail: bool,
    pub move_status: bool,
    pub motor_stall: bool,
    pub open_circuit: bool,
    pub short_circuit: bool,
    pub undervoltage: bool,
    pub overvoltage: bool,
    pub overcurrent: bool,
    pub overtemperature: bool,
    pub diag_forced_status: bool,
    pub position_sensor_fault: bool,
    pub comm_error: bool,
    pub sw_version: u16,
    pub stall_zone: u8,

    pub sleep_requested: bool,
}

impl Default for SimBus {
    fn default() -> Self {
        Self {
            move_enable: false,
            forced_diag: false,
            target_mode: MODE_NONE,
            initial_request: false,
            actual_mode: MODE_NONE,
            position_fault: false,
            fault_mode: false,
            protect_mode: false,
            initial_status: false,
            calibration_fail: false,
            move_status: false,
            motor_stall: false,
            open_circuit: false,
            short_circuit: false,
            undervoltage: false,
            overvoltage: false,
            overcurrent: false,
            overtemperature: false,
            diag_forced_status: false,
            position_sensor_fault: false,
            comm_error: false,
            sw_version: 0,
            stall_zone: 0,
            sleep_requested: false,
        }
    }
}

impl BusSignals for SimBus {
    fn move_enable(&self) -> bool {
        self.move_enable
    }
    fn forced_diag(&self) -> bool {
        self.forced_diag
    }
    fn target_mode(&self) -> u8 {
        self.target_mode
    }
    fn initial_request(&self) -> bool {
        self.initial_request
    }

    fn write_actual_mode(&mut self, mode: u8) {
        self.actual_mode = mode;
    }
    fn write_position_fault(&mut self, on: bool) {
        self.position_fault = on;
    }
    fn write_fault_mode(&mut self, on: bool) {
        self.fault_mode = on;
    }
    fn write_protect_mode(&mut self, on: bool) {
        self.protect_mode = on;
    }
    fn write_initial_status(&mut self, on: bool) {
        self.initial_status = on;
    }
    fn write_calibration_fail(&mut self, on: bool) {
        self.calibration_fail = on;
    }
    fn write_move_status(&mut self, moving: bool) {
        self.move_status = moving;
    }
    fn write_motor_stall(&mut self, on: bool) {
        self.motor_stall = on;
    }
    fn write_open_circuit(&mut self, on: bool) {
        self.open_circuit = on;
    }
    fn write_short_circuit(&mut self, on: bool) {
        self.short_circuit = on;
    }
    fn write_undervoltage(&mut self, on: bool) {
        self.undervoltage = on;
    }
    fn write_overvoltage(&mut self, on: bool) {
        self.overvoltage = on;
    }
    fn write_overcurrent(&mut self, on: bool) {
        self.overcurrent = on;
    }
    fn write_overtemperature(&mut self, on: bool) {
        self.overtemperature = on;
    }
    fn write_diag_forced_status(&mut self, on: bool) {
        self.diag_forced_status = on;
    }
    fn write_position_sensor_fault(&mut self, on: bool) {
        self.position_sensor_fault = on;
    }
    fn write_comm_error(&mut self, on: bool) {
        self.comm_error = on;
    }
    fn write_sw_version(&mut self, version: u16) {
        self.sw_version = version;
    }
    fn write_stall_zone(&mut self, zone: u8) {
        self.stall_zone = zone;
    }

    fn request_sleep(&mut self) {
        self.sleep_requested = true;
    }
}

// ─── Non-volatile memory ────────────────────────────────────────────

/// In-memory persistence with write accounting.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    pub cal: Option<CalRecord>,
    pub diag: Option<DiagRecord>,
    pub cal_writes: u32,
    pub diag_writes: u32,
    /// Fail every write, for error-path tests.
    pub fail_writes: bool,
}

impl NvMemory for MemStore {
    fn read_valve_calibration(&mut self) -> Result<Option<CalRecord>, StoreError> {
        Ok(self.cal)
    }

    fn write_valve_calibration(&mut self, record: CalRecord) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Write("simulated cell failure"));
        }
        self.cal = Some(record);
        self.cal_writes += 1;
        Ok(())
    }

    fn read_diag_event(&mut self) -> Result<Option<DiagRecord>, StoreError> {
        Ok(self.diag)
    }

    fn write_diag_event(&mut self, record: DiagRecord) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Write("simulated cell failure"));
        }
        self.diag = Some(record);
        self.diag_writes += 1;
        Ok(())
    }
}

/// File-backed persistence: both records in one 12-byte little-endian file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_words(&self) -> Result<Option<[u16; 6]>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(_) => return Err(StoreError::Read("file unreadable")),
        };
        if bytes.len() != 12 {
            return Err(StoreError::Corrupt);
        }
        let mut words = [0u16; 6];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
        }
        Ok(Some(words))
    }

    fn write_words(&self, words: [u16; 6]) -> Result<(), StoreError> {
        let mut bytes = [0u8; 12];
        for (i, word) in words.iter().enumerate() {
            bytes[2 * i..2 * i + 2].copy_from_slice(&word.to_le_bytes());
        }
        std::fs::write(&self.path, bytes).map_err(|_| StoreError::Write("file unwritable"))
    }
}

impl NvMemory for FileStore {
    fn read_valve_calibration(&mut self) -> Result<Option<CalRecord>, StoreError> {
        Ok(self.read_words()?.and_then(|w| {
            (w[2] != 0).then_some(CalRecord {
                offset: w[0],
                last_angle: w[1],
                code: w[2],
            })
        }))
    }

    fn write_valve_calibration(&mut self, record: CalRecord) -> Result<(), StoreError> {
        let mut words = self.read_words()?.unwrap_or_default();
        words[0] = record.offset;
        words[1] = record.last_angle;
        words[2] = record.code;
        self.write_words(words)
    }

    fn read_diag_event(&mut self) -> Result<Option<DiagRecord>, StoreError> {
        Ok(self.read_words()?.and_then(|w| {
            (w[5] != 0).then_some(DiagRecord {
                cause: w[3],
                value: w[4],
                code: w[5],
            })
        }))
    }

    fn write_diag_event(&mut self, record: DiagRecord) -> Result<(), StoreError> {
        let mut words = self.read_words()?.unwrap_or_default();
        words[3] = record.cause;
        words[4] = record.value;
        words[5] = record.code;
        self.write_words(words)
    }
}

// ─── Plant ──────────────────────────────────────────────────────────

/// Complete simulated actuator: peripheral roles plus coupled physics.
#[derive(Debug)]
pub struct SimPlant {
    pub adc: SimAdc,
    pub bridge: SimBridge,
    pub bus: SimBus,
    pub nv: MemStore,

    /// True shaft angle in the sensor's geometric frame [0.1°].
    shaft: f64,
    /// Geometric angle of the low mechanical stop [0.1°].
    pub low_stop: f64,
    /// Geometric angle of the high mechanical stop [0.1°].
    pub high_stop: f64,
    /// Shaft speed at full duty [0.1° per step].
    pub full_speed: f64,
    /// Full-scale duty of the drive [PWM counts].
    max_duty: f64,
    /// Sensor zero-point assumed when placing the shaft [0.1°].
    nominal_offset: i16,

    /// Motor current while the shaft is driven into a stop [mA].
    pub stall_current_ma: u16,
    /// Idle term of the running-current map [mA].
    pub base_current_ma: u16,
    /// Forced current override for fault injection [mA].
    pub forced_current_ma: Option<u16>,
    /// Open winding: current reads zero regardless of drive.
    pub open_circuit: bool,

    supply_mv10: u16,
    temperature_c: i16,
    vdda_mv10: u16,
    ignition_on: bool,
}

impl SimPlant {
    /// Plant matching the configured geometry, parked at the mode B default.
    pub fn new(cfg: &ControlConfig) -> Self {
        let offset = cfg.fusion.default_sensor_offset;
        let low_stop = wrap(cfg.valve.low_stop_nominal - offset) as f64;
        let high_stop =
            wrap(cfg.valve.mode_a_default + cfg.valve.stopper_angle - offset) as f64;
        let shaft = wrap(cfg.valve.mode_b_default - offset) as f64;
        let mut plant = Self {
            adc: SimAdc::default(),
            bridge: SimBridge::default(),
            bus: SimBus::default(),
            nv: MemStore::default(),
            shaft,
            low_stop,
            high_stop,
            full_speed: FULL_DUTY_SPEED,
            max_duty: cfg.motor.max_duty as f64,
            nominal_offset: offset,
            stall_current_ma: 1200,
            base_current_ma: 150,
            forced_current_ma: None,
            open_circuit: false,
            supply_mv10: 1200,
            temperature_c: 25,
            vdda_mv10: 330,
            ignition_on: true,
        };
        plant.refresh_adc(plant.running_current());
        plant
    }

    // ─── Scenario controls ──────────────────────────────────────────

    pub fn set_supply(&mut self, mv10: u16) {
        self.supply_mv10 = mv10;
    }

    pub fn set_temperature(&mut self, celsius: i16) {
        self.temperature_c = celsius;
    }

    pub fn set_vdda(&mut self, mv10: u16) {
        self.vdda_mv10 = mv10;
    }

    pub fn set_ignition(&mut self, on: bool) {
        self.ignition_on = on;
    }

    /// Park the shaft at a measured angle (assuming the nominal zero-point).
    pub fn set_shaft_measured(&mut self, measured: i16) {
        self.shaft = wrap(measured - self.nominal_offset) as f64;
    }

    /// Measured angle the sensor pipeline should report (nominal zero-point).
    pub fn shaft_measured(&self) -> i16 {
        wrap(self.shaft.round() as i16 + self.nominal_offset)
    }

    /// Whether the drive is currently pushing the shaft into a stop.
    pub fn blocked(&self) -> bool {
        if !self.bridge.enabled || self.bridge.duty == 0 {
            return false;
        }
        match self.direction_sign() {
            s if s < 0.0 => self.shaft <= self.low_stop,
            s if s > 0.0 => self.shaft >= self.high_stop,
            _ => false,
        }
    }

    // ─── Physics ────────────────────────────────────────────────────

    /// Advance the plant by one 100 µs step and refresh the ADC outputs.
    pub fn step(&mut self) {
        if self.bridge.enabled && self.bridge.duty > 0 {
            let speed = self.full_speed * self.bridge.duty as f64 / self.max_duty;
            self.shaft = (self.shaft + speed * self.direction_sign())
                .clamp(self.low_stop, self.high_stop);
        }

        let current = if self.open_circuit {
            0
        } else if let Some(forced) = self.forced_current_ma {
            forced
        } else if self.blocked() {
            self.stall_current_ma
        } else {
            self.running_current()
        };
        self.refresh_adc(current);
    }

    /// Counter-clockwise increases the shaft angle.
    fn direction_sign(&self) -> f64 {
        match self.bridge.direction {
            MotorDirection::CounterClockwise => 1.0,
            MotorDirection::Clockwise => -1.0,
            MotorDirection::None => 0.0,
        }
    }

    fn running_current(&self) -> u16 {
        if !self.bridge.enabled || self.bridge.duty == 0 {
            return 0;
        }
        let load = 250.0 * self.bridge.duty as f64 / self.max_duty;
        self.base_current_ma + load as u16
    }

    fn refresh_adc(&mut self, current_ma: u16) {
        self.adc.supply = self.supply_mv10 / 2;
        self.adc.current = current_ma / 4;
        self.adc.vdda = ((self.vdda_mv10 as u32 * 1024) / 660) as u16;
        self.adc.temperature = ((self.temperature_c - 25) * 4 + 608).max(0) as u16;
        // Below the first map point the conversion reads 0 V.
        self.adc.ignition = if self.ignition_on { 0x178 } else { 0x100 };

        let theta = self.shaft * PI / 1800.0;
        let sin = GMR_AMPLITUDE * theta.sin();
        let cos = GMR_AMPLITUDE * theta.cos();
        self.adc.gmr_pos_sine = (GMR_MID + cos) as u16;
        self.adc.gmr_neg_sine = (GMR_MID - cos) as u16;
        self.adc.gmr_pos_cosine = (GMR_MID + sin) as u16;
        self.adc.gmr_neg_cosine = (GMR_MID - sin) as u16;
    }
}
