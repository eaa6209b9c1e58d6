//! Valve controller: top-level orchestration of the actuator.
//!
//! Owns the valve state machine, the calibrated position model, the bus
//! command/status exchange, the retry accounting for fault and protection
//! recovery, and the low-power sequencing. The motor controller and the
//! protection monitor surface sticky conditions; this controller is the sole
//! arbiter deciding whether a condition routes to `Fault` (motor-originated,
//! bounded retries) or `Protection` (environment-originated, auto-recovery).
//!
//! Cross-cutting rules evaluated before the per-state logic every tick:
//! ignition-off forces `PowerLatch` (except out of the low-power pair),
//! motor faults force `Fault`, protection conditions force `Protection`.
//! The pre-empted state is snapshotted for the eventual return.

pub mod calibration;

use tracing::{info, warn};

use fwv_common::angle::linear_diff;
use fwv_common::condition::{IgnitionCondition, ProtectCause, SupplyCondition, TemperatureCondition};
use fwv_common::config::ValveConfig;
use fwv_common::error::{DiagEvent, EventLog, MotorFaultFlags, StallFlags};
use fwv_common::hal::{
    BusSignals, CAL_VALID_CODE, CalRecord, DIAG_VALID_CODE, DiagRecord, MODE_A, MODE_B, MODE_NONE,
    MotorBridge, NvMemory,
};
use fwv_common::state::{CalibrationStep, MotionStatus, MotorState, ValveState};

use crate::fusion::SensorFusion;
use crate::motor::{FaultClearScope, MotorController, StallClearScope};
use crate::protection::ProtectionMonitor;

use calibration::Calibration;

/// Top-level orchestration state machine, one instance per node.
#[derive(Debug)]
pub struct ValveController {
    cfg: ValveConfig,

    state: ValveState,
    last_state: ValveState,
    entry: bool,
    elapsed: u16,

    /// Bus live-communication countdown [1 ms ticks].
    live_timeout: u16,
    /// Motor state cached at the top of the tick.
    motor_motion: MotorState,

    // Position model.
    target_angle: i16,
    current_angle: i16,
    /// Calibrated end positions, indexed by `MODE_A` / `MODE_B`.
    mode_angle: [i16; 2],
    position_fault: bool,
    position_retry: u8,

    calibration: Calibration,

    // Communication mirror.
    move_enable: bool,
    initial: bool,
    forced_diag: bool,
    target_mode: u8,
    last_mode: u8,
    actual_mode: u8,
    moving: bool,
    fault_mode: bool,
    comm_error: bool,
    diag_step: u8,

    // Persistence mirror.
    mem_offset: i16,
    mem_last_angle: i16,
    mem_event: DiagEvent,

    // Diagnostics caches and retry budget accounting.
    prot_cause: ProtectCause,
    cal_fault: bool,
    motor_fault: MotorFaultFlags,
    stall_fault: StallFlags,
    mismatch: bool,
    mismatch_count: u16,
    mismatch_retry: u8,
    mcu_retry: u8,
    uv_retry: u8,
    ov_retry: u8,
    temp_retry: u8,
    obstruction_retry: u8,
    oc_retry: u8,
    stall_retry: u8,
    cal_retry: u8,
    open_retry: u8,
    short_retry: u8,
}

impl ValveController {
    pub fn new(cfg: ValveConfig) -> Self {
        let live_timeout = cfg.live_timeout;
        let mode_angle = [cfg.mode_a_default, cfg.mode_b_default];
        Self {
            cfg,
            state: ValveState::Init,
            last_state: ValveState::Init,
            entry: true,
            elapsed: 0,
            live_timeout,
            motor_motion: MotorState::Init,
            target_angle: 0,
            current_angle: 0,
            mode_angle,
            position_fault: false,
            position_retry: 0,
            calibration: Calibration::new(),
            move_enable: false,
            initial: false,
            forced_diag: false,
            target_mode: MODE_NONE,
            last_mode: MODE_NONE,
            actual_mode: MODE_B,
            moving: false,
            fault_mode: false,
            comm_error: false,
            diag_step: 0,
            mem_offset: 0,
            mem_last_angle: 0,
            mem_event: DiagEvent::default(),
            prot_cause: ProtectCause::None,
            cal_fault: false,
            motor_fault: MotorFaultFlags::empty(),
            stall_fault: StallFlags::empty(),
            mismatch: false,
            mismatch_count: 0,
            mismatch_retry: 0,
            mcu_retry: 0,
            uv_retry: 0,
            ov_retry: 0,
            temp_retry: 0,
            obstruction_retry: 0,
            oc_retry: 0,
            stall_retry: 0,
            cal_retry: 0,
            open_retry: 0,
            short_retry: 0,
        }
    }

    /// Restore persisted calibration and the last diagnostic event at boot.
    pub fn boot(
        &mut self,
        nv: &mut impl NvMemory,
        fusion: &mut SensorFusion,
        events: &mut EventLog,
    ) {
        match nv.read_valve_calibration() {
            Ok(Some(rec)) if rec.code == CAL_VALID_CODE => {
                let offset = rec.offset as i16;
                if offset > 0 && offset <= fwv_common::angle::FULL_TURN {
                    fusion.set_sensor_offset(offset);
                }
                self.mem_offset = offset;
                self.mem_last_angle = rec.last_angle as i16;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "calibration record unreadable"),
        }
        match nv.read_diag_event() {
            Ok(Some(rec)) if rec.code == DIAG_VALID_CODE => {
                self.mem_event = DiagEvent {
                    cause: ProtectCause::from_u16(rec.cause),
                    value: rec.value,
                };
                events.restore(self.mem_event);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "diagnostic record unreadable"),
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────

    #[inline]
    pub fn state(&self) -> ValveState {
        self.state
    }

    #[inline]
    pub fn mode_angles(&self) -> [i16; 2] {
        self.mode_angle
    }

    #[inline]
    pub fn current_angle(&self) -> i16 {
        self.current_angle
    }

    #[inline]
    pub fn fault_mode(&self) -> bool {
        self.fault_mode
    }

    #[inline]
    pub fn protection_cause(&self) -> ProtectCause {
        self.prot_cause
    }

    #[inline]
    pub fn actual_mode(&self) -> u8 {
        self.actual_mode
    }

    /// Calibration sub-state, meaningful only while the state is
    /// `Calibration`.
    #[inline]
    pub fn calibration_step(&self) -> CalibrationStep {
        self.calibration.step()
    }

    /// Queue a calibration pass: `full` re-measures both stops, quick
    /// refreshes against the nearer one.
    pub fn request_calibration(&mut self, full: bool) {
        if full {
            self.calibration.request_full();
        } else {
            self.calibration.request_quick();
        }
    }

    // ─── 1 ms tick ──────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn tick<B, S, M>(
        &mut self,
        fusion: &mut SensorFusion,
        protection: &ProtectionMonitor,
        motor: &mut MotorController,
        bridge: &mut B,
        bus: &mut S,
        nv: &mut M,
        events: &mut EventLog,
        bus_request: bool,
        bus_response: bool,
    ) where
        B: MotorBridge,
        S: BusSignals,
        M: NvMemory,
    {
        self.intake_commands(bus, motor, bridge, events);

        // Snapshot motor-owned conditions once per tick.
        self.motor_motion = motor.state();
        self.motor_fault = motor.fault_flags();
        self.stall_fault = motor.stall_flags();
        self.current_angle = motor.current_position();
        self.moving = self.motor_motion.is_moving();
        self.track_actual_mode();
        self.sensor_mismatch_diag(fusion, motor);

        // Cross-cutting arbitration overrides the per-state logic. The power
        // states are exempt: the drive is already held and the bus is
        // expected to fall silent while the ignition is off.
        if protection.ignition_condition() == IgnitionCondition::Off
            && !self.state.holds_through_ignition_off()
        {
            self.switch_to(ValveState::PowerLatch, motor);
        } else if !self.state.holds_through_ignition_off() {
            if self.state != ValveState::Fault && self.check_fault_mode() {
                self.switch_to(ValveState::Fault, motor);
            } else if self.state != ValveState::Fault
                && self.state != ValveState::Protection
                && self.check_protect_mode(protection)
            {
                self.switch_to(ValveState::Protection, motor);
            }
        }

        let entry = core::mem::take(&mut self.entry);
        let next = match self.state {
            ValveState::Init => self.task_init(protection, motor, events),
            ValveState::Standby => self.task_standby(motor),
            ValveState::Ready => self.task_ready(entry, motor),
            ValveState::Operation => self.task_operation(entry, motor),
            ValveState::DiagRun => self.task_diag_run(entry, motor),
            ValveState::Calibration => self.task_calibration(entry, motor, fusion, nv, events),
            ValveState::Fault => self.task_fault(entry, motor, bridge),
            ValveState::Protection => self.task_protection(entry, protection, motor, bridge, events),
            ValveState::PowerLatch => self.task_power_latch(protection, motor),
            ValveState::LowPower => self.task_low_power(entry, protection, motor, bus, nv, fusion, events),
            ValveState::Undef => self.task_undef(),
        };
        if next != self.state {
            self.switch_to(next, motor);
        } else {
            self.elapsed = self.elapsed.saturating_add(1);
        }

        // Bus liveness: any frame edge reloads the countdown; expiry raises
        // the communication error consumed by Protection.
        if self.live_timeout > 0 {
            self.live_timeout -= 1;
        } else {
            self.comm_error = true;
        }
        if bus_request || bus_response {
            self.live_timeout = self.cfg.live_timeout;
        }

        self.publish_status(bus, protection);
    }

    /// State switch with snapshot, timer reset and calibration masking.
    fn switch_to(&mut self, next: ValveState, motor: &mut MotorController) {
        if next == self.state {
            return;
        }
        info!(from = ?self.state, to = ?next, "valve state");
        // Low power always resumes at Standby, never back into itself.
        if self.state != ValveState::LowPower {
            self.last_state = self.state;
        }
        if next == ValveState::Calibration {
            motor.set_obstruction_masked(true);
        } else if self.state == ValveState::Calibration {
            motor.set_obstruction_masked(false);
        }
        self.state = next;
        self.entry = true;
        self.elapsed = 0;
    }

    // ─── Bus exchange ───────────────────────────────────────────────

    fn intake_commands<S, B>(
        &mut self,
        bus: &S,
        motor: &mut MotorController,
        bridge: &mut B,
        events: &mut EventLog,
    ) where
        S: BusSignals,
        B: MotorBridge,
    {
        self.move_enable = bus.move_enable();

        // Initial-request edge forces a full recalibration from scratch.
        let initial = bus.initial_request();
        if initial != self.initial {
            self.initial = initial;
            if initial {
                self.calibration.request_full();
                self.fault_reset(motor, bridge, events);
            }
        }

        self.forced_diag = bus.forced_diag();

        if !self.forced_diag && self.move_enable {
            self.target_mode = bus.target_mode();
            if self.target_mode == MODE_A {
                self.target_angle = self.mode_angle[MODE_A as usize];
            } else if self.target_mode == MODE_B {
                self.target_angle = self.mode_angle[MODE_B as usize];
            }
        }
    }

    fn publish_status<S: BusSignals>(&mut self, bus: &mut S, protection: &ProtectionMonitor) {
        bus.write_actual_mode(self.actual_mode);
        bus.write_position_fault(self.position_fault);
        bus.write_fault_mode(self.fault_mode);
        bus.write_protect_mode(self.state == ValveState::Protection && !self.fault_mode);
        bus.write_initial_status(self.state == ValveState::Calibration);
        bus.write_calibration_fail(self.fault_mode && self.cal_fault);
        bus.write_move_status(self.moving);

        let stall_bit = if self.motor_motion == MotorState::Fault {
            !self.stall_fault.is_empty() && self.fault_mode
        } else {
            self.stall_fault.contains(StallFlags::TEMPORARY)
        };
        bus.write_motor_stall(stall_bit);
        bus.write_open_circuit(
            self.motor_fault.contains(MotorFaultFlags::PHASE_OPEN) && self.fault_mode,
        );
        bus.write_short_circuit(
            self.motor_fault.contains(MotorFaultFlags::PHASE_SHORT) && self.fault_mode,
        );

        match protection.supply_condition() {
            SupplyCondition::Undervoltage => {
                bus.write_undervoltage(true);
                bus.write_overvoltage(false);
            }
            SupplyCondition::Overvoltage => {
                bus.write_undervoltage(false);
                bus.write_overvoltage(true);
            }
            _ => {
                bus.write_undervoltage(false);
                bus.write_overvoltage(false);
            }
        }
        bus.write_overcurrent(self.motor_fault.contains(MotorFaultFlags::OVER_CURRENT));
        bus.write_overtemperature(
            protection.temperature_condition() == TemperatureCondition::High,
        );
        bus.write_diag_forced_status(self.state == ValveState::DiagRun);
        bus.write_position_sensor_fault(self.mismatch);
        bus.write_comm_error(self.comm_error);
        self.comm_error = false;
        bus.write_sw_version(self.cfg.sw_version);

        // Zone indicator: 0 when parked inside either mode window.
        let inside_a = self.current_angle
            >= self.mode_angle[MODE_A as usize] - self.cfg.accuracy_angle;
        let inside_b = self.current_angle
            <= self.mode_angle[MODE_B as usize] + self.cfg.accuracy_angle;
        bus.write_stall_zone(u8::from(!(inside_a || inside_b)));
    }

    /// Track which mode window the shaft last crossed into.
    fn track_actual_mode(&mut self) {
        let threshold = self.cfg.actual_mode_threshold;
        match self.actual_mode {
            MODE_A => {
                if self.current_angle <= self.mode_angle[MODE_B as usize] + threshold {
                    self.actual_mode = MODE_B;
                }
            }
            MODE_B => {
                if self.current_angle >= self.mode_angle[MODE_A as usize] - threshold {
                    self.actual_mode = MODE_A;
                }
            }
            _ => self.actual_mode = MODE_B,
        }
    }

    /// Position-sensor mismatch: current flowing, drive at speed, but the
    /// motion sensor reports standstill.
    fn sensor_mismatch_diag(&mut self, fusion: &SensorFusion, motor: &MotorController) {
        if self.state != ValveState::Calibration && self.motor_motion == MotorState::Running {
            let suspicious = fusion.motor_current() >= self.cfg.mismatch_current
                && motor.motion_status() == MotionStatus::Stopped;
            if suspicious {
                self.mismatch_count = self.mismatch_count.saturating_add(1);
            } else {
                self.mismatch_count = self.mismatch_count.saturating_sub(1);
            }
            if self.mismatch_count > self.cfg.mismatch_trip {
                self.mismatch_count = 0;
                self.mismatch = true;
                warn!("position sensor mismatch");
            }
        } else {
            self.mismatch_count = 0;
        }
    }

    // ─── Cross-cutting condition classification ─────────────────────

    /// Motor-originated faults routed to the `Fault` state.
    fn check_fault_mode(&self) -> bool {
        match self.motor_motion {
            MotorState::Fault => self
                .motor_fault
                .intersects(MotorFaultFlags::PHASE_OPEN | MotorFaultFlags::PHASE_SHORT),
            MotorState::Stalled => {
                self.state != ValveState::Calibration
                    && self.stall_fault.contains(StallFlags::PERMANENT)
            }
            _ => false,
        }
    }

    /// Environment/communication conditions routed to `Protection`.
    fn check_protect_mode(&self, protection: &ProtectionMonitor) -> bool {
        matches!(
            protection.supply_condition(),
            SupplyCondition::Undervoltage | SupplyCondition::Overvoltage
        ) || protection.temperature_condition() == TemperatureCondition::High
            || self.stall_fault.contains(StallFlags::TEMPORARY)
            || self.motor_fault.contains(MotorFaultFlags::OVER_CURRENT)
            || protection.mcu_fault()
            || self.mismatch
            || self.position_fault
            || self.live_timeout == 0
    }

    // ─── Retry accounting resets ────────────────────────────────────

    /// Reset protection retry counters on a genuine cause change.
    fn error_reset(&mut self) {
        if self.state == ValveState::Protection {
            self.oc_retry = 0;
            self.obstruction_retry = 0;
            self.position_retry = 0;
            self.mismatch_retry = 0;
            self.mcu_retry = 0;
            self.uv_retry = 0;
            self.ov_retry = 0;
            self.temp_retry = 0;
        }
    }

    /// Full fault reset: clears every sticky condition and retry counter.
    /// Only called on an explicit recalibration request.
    fn fault_reset<B: MotorBridge>(
        &mut self,
        motor: &mut MotorController,
        bridge: &mut B,
        events: &mut EventLog,
    ) {
        events.reset_latest();
        self.fault_mode = false;
        motor.clear_fault(FaultClearScope::All, bridge);
        motor.clear_stall(StallClearScope::All);
        self.position_fault = false;
        self.mismatch = false;

        self.oc_retry = 0;
        self.obstruction_retry = 0;
        self.position_retry = 0;
        self.mismatch_retry = 0;
        self.mcu_retry = 0;
        self.uv_retry = 0;
        self.ov_retry = 0;
        self.temp_retry = 0;
        self.stall_retry = 0;
        self.cal_retry = 0;
        self.open_retry = 0;
        self.short_retry = 0;
    }

    // ─── Per-state tasks ────────────────────────────────────────────

    fn task_init(
        &mut self,
        protection: &ProtectionMonitor,
        motor: &mut MotorController,
        events: &EventLog,
    ) -> ValveState {
        // Hold the target at the measured position until released.
        self.target_angle = self.current_angle;
        motor.set_target(self.target_angle);

        if protection.ignition_condition() != IgnitionCondition::Normal
            || self.elapsed < self.cfg.init_settle
        {
            return ValveState::Init;
        }

        // A recorded calibration fault always forces a full pass.
        if events.latest().cause == ProtectCause::CalibrationFault {
            self.calibration.request_full();
        }
        if self.mem_last_angle != 0 {
            if linear_diff(self.current_angle, self.mem_last_angle) > self.cfg.accuracy_angle {
                self.calibration.request_full();
            }
        } else {
            // Never persisted: trust the factory geometry only when the
            // shaft already sits near one of the mode positions.
            let reference = if self.current_angle
                <= self.mode_angle[MODE_B as usize] + self.cfg.quick_near_window
            {
                self.mode_angle[MODE_B as usize]
            } else {
                self.mode_angle[MODE_A as usize]
            };
            if linear_diff(self.current_angle, reference) > self.cfg.accuracy_angle {
                self.calibration.request_full();
            }
        }
        ValveState::Standby
    }

    fn task_standby(&mut self, motor: &mut MotorController) -> ValveState {
        motor.request_hard_stop();

        if self.calibration.pending() {
            return ValveState::Calibration;
        }
        if self.forced_diag {
            return ValveState::DiagRun;
        }
        if self.move_enable {
            let distance = linear_diff(self.target_angle, self.current_angle);
            let next = if self.last_mode != self.target_mode
                && distance >= self.cfg.accuracy_angle
            {
                ValveState::Ready
            } else {
                ValveState::Standby
            };
            self.last_mode = self.target_mode;
            return next;
        }
        ValveState::Standby
    }

    fn task_ready(&mut self, entry: bool, motor: &mut MotorController) -> ValveState {
        if entry {
            motor.clear_hard_stop();
        }
        motor.set_target(self.target_angle);
        ValveState::Operation
    }

    fn task_operation(&mut self, entry: bool, motor: &mut MotorController) -> ValveState {
        if entry {
            motor.clear_hard_stop();
        }

        if self.elapsed >= self.cfg.operation_timeout {
            self.position_fault = true;
            return ValveState::Protection;
        }
        if self.moving {
            return ValveState::Operation;
        }

        // Motion ended: the shaft must sit inside one of the mode windows.
        let acc = self.cfg.accuracy_angle;
        let in_a = linear_diff(self.current_angle, self.mode_angle[MODE_A as usize]) <= acc;
        let in_b = linear_diff(self.current_angle, self.mode_angle[MODE_B as usize]) <= acc;
        if !(in_a || in_b) {
            self.position_fault = true;
            return ValveState::Protection;
        }
        ValveState::Standby
    }

    fn task_diag_run(&mut self, entry: bool, motor: &mut MotorController) -> ValveState {
        if entry {
            self.diag_step = 0;
            motor.clear_hard_stop();
        }
        self.last_mode = MODE_NONE;

        if !self.forced_diag {
            if !self.moving {
                return ValveState::Standby;
            }
            return ValveState::DiagRun;
        }

        if self.moving {
            // Dwell is measured from the end of each leg.
            self.elapsed = 0;
        } else if self.elapsed >= self.cfg.diag_dwell {
            // Leg 0 parks at mode B, then the cycle alternates A/B for as
            // long as the input stays asserted.
            let target = if self.diag_step % 2 == 1 {
                self.mode_angle[MODE_A as usize]
            } else {
                self.mode_angle[MODE_B as usize]
            };
            self.diag_step = self.diag_step.wrapping_add(1);
            self.target_angle = target;
            motor.set_target(target);
        }
        ValveState::DiagRun
    }

    fn task_fault<B: MotorBridge>(
        &mut self,
        entry: bool,
        motor: &mut MotorController,
        bridge: &mut B,
    ) -> ValveState {
        motor.request_hard_stop();
        self.last_mode = MODE_NONE;

        if entry {
            if self.cal_fault {
                self.cal_retry = self.cal_retry.saturating_add(1);
            }
            if self.stall_fault.contains(StallFlags::PERMANENT) {
                self.stall_retry = self.stall_retry.saturating_add(1);
            }
            if self.motor_fault.contains(MotorFaultFlags::PHASE_OPEN) {
                self.open_retry = self.open_retry.saturating_add(1);
            }
            if self.motor_fault.contains(MotorFaultFlags::PHASE_SHORT) {
                self.short_retry = self.short_retry.saturating_add(1);
            }
        }

        if self.elapsed < self.cfg.fault_settle {
            return ValveState::Fault;
        }

        // Bounded retries: classes inside budget are released for another
        // attempt, exhausted classes latch the summary fault.
        let budget = self.cfg.fault_retry_budget;
        if self.cal_retry <= budget {
            self.cal_fault = false;
        }
        if self.stall_retry <= budget {
            motor.clear_stall(StallClearScope::All);
        }
        if self.open_retry <= budget {
            motor.clear_fault(FaultClearScope::OpenPhase, bridge);
        }
        if self.short_retry <= budget {
            motor.clear_fault(FaultClearScope::ShortCircuit, bridge);
        }

        let healthy = !self.cal_fault
            && motor.stall_flags().is_empty()
            && motor.fault_flags().is_empty();
        if healthy {
            return ValveState::Standby;
        }
        self.fault_mode = true;
        ValveState::Fault
    }

    fn task_protection<B: MotorBridge>(
        &mut self,
        entry: bool,
        protection: &ProtectionMonitor,
        motor: &mut MotorController,
        bridge: &mut B,
        events: &mut EventLog,
    ) -> ValveState {
        motor.request_hard_stop();
        self.last_mode = MODE_NONE;

        if entry {
            // Identify the single triggering cause, highest priority first.
            // A cause change resets the other counters so unrelated budgets
            // are not consumed; only the winning cause pays a retry.
            // The motor diagnostics already recorded their own events, so
            // only environment causes carry a reading here.
            let (cause, reading) = if protection.supply_condition() == SupplyCondition::Undervoltage
            {
                (ProtectCause::SupplyLow, Some(protection.supply_voltage()))
            } else if protection.supply_condition() == SupplyCondition::Overvoltage {
                (ProtectCause::SupplyHigh, Some(protection.supply_voltage()))
            } else if protection.temperature_condition() == TemperatureCondition::High {
                (ProtectCause::TempHigh, Some(protection.temperature() as u16))
            } else if self.motor_fault.contains(MotorFaultFlags::OVER_CURRENT) {
                (ProtectCause::MotorOvercurrent, None)
            } else if self.stall_fault.contains(StallFlags::TEMPORARY) {
                (ProtectCause::Obstruction, None)
            } else if self.position_fault {
                (ProtectCause::PositionFault, Some(self.current_angle as u16))
            } else if self.mismatch {
                (ProtectCause::SensorFault, Some(self.current_angle as u16))
            } else if protection.mcu_fault() {
                (ProtectCause::McuFault, Some(protection.supply_voltage()))
            } else {
                (ProtectCause::None, None)
            };

            if cause != ProtectCause::None {
                if cause != self.prot_cause {
                    self.error_reset();
                }
                self.prot_cause = cause;
                let retry = match cause {
                    ProtectCause::SupplyLow => &mut self.uv_retry,
                    ProtectCause::SupplyHigh => &mut self.ov_retry,
                    ProtectCause::TempHigh => &mut self.temp_retry,
                    ProtectCause::MotorOvercurrent => &mut self.oc_retry,
                    ProtectCause::Obstruction => &mut self.obstruction_retry,
                    ProtectCause::PositionFault => &mut self.position_retry,
                    ProtectCause::SensorFault => &mut self.mismatch_retry,
                    _ => &mut self.mcu_retry,
                };
                *retry = retry.saturating_add(1);
                if let Some(value) = reading {
                    events.record(DiagEvent::reading(cause, value));
                }
            }
        }

        // After the settle time, auto-clear the conditions still under
        // budget; exhausted ones latch the summary fault.
        if self.elapsed >= self.cfg.protection_settle {
            let budget = self.cfg.protection_retry_budget;
            if self.obstruction_retry < budget {
                motor.clear_stall(StallClearScope::Temporary);
            } else {
                self.fault_mode = true;
            }
            if self.oc_retry < budget {
                motor.clear_fault(FaultClearScope::OverCurrent, bridge);
            } else {
                self.fault_mode = true;
            }
            if self.position_retry < budget {
                self.position_fault = false;
            } else {
                self.fault_mode = true;
            }
            if self.mismatch_retry < budget {
                self.mismatch = false;
            } else {
                self.fault_mode = true;
            }
        }

        // Exit only once every protection input is quiet.
        let mut clear = true;
        if protection.supply_condition() != SupplyCondition::Normal {
            clear = false;
        } else {
            if self.uv_retry >= self.cfg.supply_retry_budget {
                clear = false;
                self.fault_mode = true;
            }
            if self.ov_retry >= self.cfg.supply_retry_budget {
                clear = false;
                self.fault_mode = true;
            }
        }
        if protection.temperature_condition() == TemperatureCondition::High {
            clear = false;
        } else if self.temp_retry >= self.cfg.protection_retry_budget {
            clear = false;
            self.fault_mode = true;
        }
        if protection.mcu_fault() {
            clear = false;
        } else if self.mcu_retry >= self.cfg.protection_retry_budget {
            clear = false;
            self.fault_mode = true;
        }
        if motor.stall_flags().contains(StallFlags::TEMPORARY) {
            clear = false;
        }
        if motor.fault_flags().contains(MotorFaultFlags::OVER_CURRENT) {
            clear = false;
        }
        if self.mismatch || self.position_fault {
            clear = false;
        }
        if self.live_timeout == 0 {
            clear = false;
        }

        if clear && !self.fault_mode {
            return ValveState::Standby;
        }
        ValveState::Protection
    }

    fn task_power_latch(
        &mut self,
        protection: &ProtectionMonitor,
        motor: &mut MotorController,
    ) -> ValveState {
        motor.request_hard_stop();

        if protection.ignition_condition() != IgnitionCondition::Off {
            // Grace period for the bus master to wake up with the ignition.
            self.live_timeout = self.cfg.live_timeout;
            return self.last_state;
        }
        if self.elapsed >= self.cfg.power_latch_to_lowpower {
            return ValveState::LowPower;
        }
        ValveState::PowerLatch
    }

    #[allow(clippy::too_many_arguments)]
    fn task_low_power<S, M>(
        &mut self,
        entry: bool,
        protection: &ProtectionMonitor,
        motor: &mut MotorController,
        bus: &mut S,
        nv: &mut M,
        fusion: &SensorFusion,
        events: &EventLog,
    ) -> ValveState
    where
        S: BusSignals,
        M: NvMemory,
    {
        if entry {
            motor.request_hard_stop();
            self.flush_persistence(nv, fusion, events);
            bus.request_sleep();
        }
        if protection.ignition_condition() != IgnitionCondition::Off {
            self.live_timeout = self.cfg.live_timeout;
            return ValveState::Standby;
        }
        ValveState::LowPower
    }

    fn task_undef(&mut self) -> ValveState {
        if self.elapsed >= self.cfg.undef_settle {
            return ValveState::Standby;
        }
        ValveState::Undef
    }

    // ─── Persistence ────────────────────────────────────────────────

    /// Write back the zero-point / last angle and the latest diagnostic
    /// event, but only when they drifted past the hysteresis since the last
    /// write (EEPROM wear).
    fn flush_persistence<M: NvMemory>(
        &mut self,
        nv: &mut M,
        fusion: &SensorFusion,
        events: &EventLog,
    ) {
        let offset = fusion.sensor_offset();
        if offset != self.mem_offset
            || linear_diff(self.current_angle, self.mem_last_angle) > self.cfg.accuracy_angle
        {
            let record = CalRecord {
                offset: offset as u16,
                last_angle: self.current_angle as u16,
                code: CAL_VALID_CODE,
            };
            match nv.write_valve_calibration(record) {
                Ok(()) => {
                    self.mem_offset = offset;
                    self.mem_last_angle = self.current_angle;
                }
                Err(e) => warn!(error = %e, "calibration record write failed"),
            }
        }

        let event = events.latest();
        if event != self.mem_event {
            let record = DiagRecord {
                cause: event.cause.as_u16(),
                value: event.value,
                code: DIAG_VALID_CODE,
            };
            match nv.write_diag_event(record) {
                Ok(()) => self.mem_event = event,
                Err(e) => warn!(error = %e, "diagnostic record write failed"),
            }
        }
    }
}
