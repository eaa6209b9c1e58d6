//! Motor controller: soft-start/soft-stop H-bridge drive with stall and
//! electrical-fault detection.
//!
//! Two independently clocked paths share the controller state:
//!
//! - the 1 ms housekeeping task runs the drive state machine, the motion
//!   sensor filter and the voltage-indexed threshold selection;
//! - the 100 µs fast path captures the shaft position, performs the
//!   position-reached test, runs the stall/fault diagnostics and applies
//!   the PWM output.
//!
//! Stall and fault flags are sticky. The detection paths only add bits;
//! the valve controller clears them once the underlying condition is
//! confirmed gone, which releases the `Stalled`/`Fault` states back to
//! `Stopped`.

pub mod diag;

use tracing::debug;

use fwv_common::angle::linear_diff;
use fwv_common::config::MotorConfig;
use fwv_common::error::{EventLog, MotorFaultFlags, StallFlags};
use fwv_common::hal::MotorBridge;
use fwv_common::state::{MotionStatus, MotorDirection, MotorState};

/// Scope selector for [`MotorController::clear_stall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallClearScope {
    All,
    Temporary,
    Permanent,
}

/// Scope selector for [`MotorController::clear_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClearScope {
    All,
    OpenPhase,
    ShortCircuit,
    OverCurrent,
}

/// Single H-bridge drive state machine and its diagnostics.
#[derive(Debug)]
pub struct MotorController {
    cfg: MotorConfig,

    state: MotorState,
    entry: bool,
    elapsed: u16,

    request_stop: bool,
    direction: MotorDirection,

    // Position model [0.1°].
    current: i16,
    target: i16,
    last_target: i16,
    delta: i16,
    new_target: bool,
    position_reached: bool,

    // Output.
    output_enabled: bool,
    duty: u16,
    min_duty: u16,
    softstop_done: bool,

    // Motion sensor filter.
    motion: MotionStatus,
    motion_delay: u16,
    motion_period: u16,
    motion_votes: i8,
    motion_delta: i16,
    motion_threshold: i16,
    motion_last_angle: i16,

    // Stall detection.
    stall_flags: StallFlags,
    stall_mask_timer: u16,
    stall_count: u16,
    obstruction_count: u16,
    obstruction_current: u16,
    stall_current: u16,
    obstruction_masked: bool,

    // Electrical fault detection.
    fault_flags: MotorFaultFlags,
    open_count: u16,
    overcurrent_count: u16,
}

impl MotorController {
    pub fn new(cfg: MotorConfig) -> Self {
        let nominal = cfg.tuning_for_voltage(1200);
        let motion_threshold = nominal.motion_threshold;
        let obstruction_current = nominal.obstruction_current;
        let stall_current = nominal.stall_current;
        let min_duty = nominal.min_duty;
        Self {
            cfg,
            state: MotorState::Stopped,
            entry: true,
            elapsed: 0,
            request_stop: false,
            direction: MotorDirection::None,
            current: 0,
            target: 0,
            last_target: 0,
            delta: 0,
            new_target: false,
            position_reached: false,
            output_enabled: false,
            duty: 0,
            min_duty,
            softstop_done: false,
            motion: MotionStatus::Off,
            motion_delay: 0,
            motion_period: 0,
            motion_votes: 0,
            motion_delta: 0,
            motion_threshold,
            motion_last_angle: 0,
            stall_flags: StallFlags::empty(),
            stall_mask_timer: 0,
            stall_count: 0,
            obstruction_count: 0,
            obstruction_current,
            stall_current,
            obstruction_masked: false,
            fault_flags: MotorFaultFlags::empty(),
            open_count: 0,
            overcurrent_count: 0,
        }
    }

    // ─── Public contract ────────────────────────────────────────────

    /// Hold the drive disabled until [`Self::clear_hard_stop`].
    pub fn request_hard_stop(&mut self) {
        self.request_stop = true;
    }

    pub fn clear_hard_stop(&mut self) {
        self.request_stop = false;
    }

    /// Commit a new target position [0.1°].
    ///
    /// A move is armed only when the target changed or the shaft sits more
    /// than the on-hysteresis away from it; repeating a reached target is a
    /// no-op and never re-triggers an acceleration phase.
    pub fn set_target(&mut self, target: i16) {
        self.target = target;
        if target != self.last_target
            || linear_diff(target, self.current) > self.cfg.on_hysteresis
        {
            self.new_target = true;
            self.last_target = target;
        }
    }

    /// Seed the position model (boot and tests).
    pub fn set_current_position(&mut self, position: i16) {
        self.current = position;
        self.motion_last_angle = position;
    }

    #[inline]
    pub fn state(&self) -> MotorState {
        self.state
    }

    #[inline]
    pub fn current_position(&self) -> i16 {
        self.current
    }

    #[inline]
    pub fn target_position(&self) -> i16 {
        self.target
    }

    #[inline]
    pub fn motion_status(&self) -> MotionStatus {
        self.motion
    }

    #[inline]
    pub fn motion_delta(&self) -> i16 {
        self.motion_delta
    }

    #[inline]
    pub fn stall_flags(&self) -> StallFlags {
        self.stall_flags
    }

    #[inline]
    pub fn fault_flags(&self) -> MotorFaultFlags {
        self.fault_flags
    }

    #[inline]
    pub fn position_reached(&self) -> bool {
        self.position_reached
    }

    #[inline]
    pub fn duty(&self) -> u16 {
        self.duty
    }

    #[inline]
    pub fn direction(&self) -> MotorDirection {
        self.direction
    }

    /// Suppress obstruction detection (end-stop calibration drives into the
    /// stops on purpose; only the hard-stall detector stays armed).
    pub fn set_obstruction_masked(&mut self, masked: bool) {
        self.obstruction_masked = masked;
    }

    /// Clear stall flags. Owner-called once the condition is confirmed gone.
    pub fn clear_stall(&mut self, scope: StallClearScope) {
        match scope {
            StallClearScope::All => self.stall_flags = StallFlags::empty(),
            StallClearScope::Temporary => self.stall_flags.remove(StallFlags::TEMPORARY),
            StallClearScope::Permanent => self.stall_flags.remove(StallFlags::PERMANENT),
        }
    }

    /// Clear fault flags; re-arms the bridge latch for the hardware-backed
    /// classes so the pre-driver can restart.
    pub fn clear_fault(&mut self, scope: FaultClearScope, bridge: &mut impl MotorBridge) {
        match scope {
            FaultClearScope::All => {
                self.fault_flags = MotorFaultFlags::empty();
                bridge.rearm_drive();
            }
            FaultClearScope::OpenPhase => self.fault_flags.remove(MotorFaultFlags::PHASE_OPEN),
            FaultClearScope::ShortCircuit => {
                self.fault_flags.remove(MotorFaultFlags::PHASE_SHORT);
                bridge.rearm_drive();
            }
            FaultClearScope::OverCurrent => {
                self.fault_flags.remove(MotorFaultFlags::OVER_CURRENT);
                bridge.rearm_drive();
            }
        }
    }

    // ─── 1 ms housekeeping ──────────────────────────────────────────

    /// Drive state machine, threshold selection and motion filter.
    pub fn tick_1ms(&mut self, bridge: &mut impl MotorBridge, supply_voltage: u16) {
        let entry = core::mem::take(&mut self.entry);

        let next = match self.state {
            MotorState::Init => MotorState::Stopped,
            MotorState::Stopped => self.task_stopped(entry, bridge),
            MotorState::Accelerating => self.task_accelerating(entry),
            MotorState::Running => self.task_running(entry),
            MotorState::Decelerating => self.task_decelerating(entry),
            MotorState::Paused => self.task_paused(entry),
            MotorState::Stalled => self.task_stalled(entry),
            MotorState::Fault => self.task_fault(entry, bridge),
        };

        if next != self.state {
            debug!(from = ?self.state, to = ?next, "motor state");
            self.state = next;
            self.entry = true;
            self.elapsed = 0;
        } else {
            self.elapsed = self.elapsed.saturating_add(1);
        }

        // Thresholds follow the supply while the drive is off, so the next
        // move starts with limits matched to the available voltage.
        if !self.output_enabled {
            let row = self.cfg.tuning_for_voltage(supply_voltage);
            self.motion_threshold = row.motion_threshold;
            self.obstruction_current = row.obstruction_current;
            self.stall_current = row.stall_current;
            self.min_duty = row.min_duty;
        }

        self.tick_motion_filter();
    }

    fn task_stopped(&mut self, _entry: bool, bridge: &mut impl MotorBridge) -> MotorState {
        self.output_enabled = false;
        self.duty = 0;
        self.position_reached = false;

        if self.request_stop {
            return MotorState::Stopped;
        }
        if self.new_target {
            self.new_target = false;
            let forward = self.delta > 0;
            self.direction = match (forward, self.cfg.invert_polarity) {
                (true, false) | (false, true) => MotorDirection::Clockwise,
                (false, false) | (true, true) => MotorDirection::CounterClockwise,
            };
            bridge.start(self.direction, 0);
            return MotorState::Accelerating;
        }
        MotorState::Stopped
    }

    fn task_accelerating(&mut self, entry: bool) -> MotorState {
        if entry {
            self.output_enabled = true;
            self.duty = self.cfg.start_duty;
        }
        if self.request_stop || self.position_reached {
            return MotorState::Stopped;
        }

        let remaining = linear_diff(self.target, self.current);
        self.duty = (self.duty + self.cfg.accel_step).min(self.cfg.max_duty);
        if remaining <= self.cfg.decel_window {
            if self.duty >= self.min_duty {
                return MotorState::Decelerating;
            }
        } else if self.duty >= self.cfg.run_entry_duty {
            return MotorState::Running;
        }
        MotorState::Accelerating
    }

    fn task_running(&mut self, entry: bool) -> MotorState {
        if entry {
            self.output_enabled = true;
        }
        self.duty = self.cfg.max_duty;

        if self.request_stop || self.position_reached {
            return MotorState::Stopped;
        }
        if self.direction_reversal_requested() {
            return MotorState::Paused;
        }
        if linear_diff(self.target, self.current) <= self.cfg.decel_window {
            return MotorState::Decelerating;
        }
        MotorState::Running
    }

    fn task_decelerating(&mut self, entry: bool) -> MotorState {
        if entry {
            self.output_enabled = true;
            self.softstop_done = false;
        }
        if self.request_stop || self.position_reached {
            return MotorState::Stopped;
        }
        if self.direction_reversal_requested() {
            return MotorState::Paused;
        }

        let braking = (linear_diff(self.target, self.current) >> 1) as u16 + self.cfg.decel_step;
        if !self.softstop_done {
            self.duty = self.duty.saturating_sub(braking).max(self.min_duty);
            if self.motion == MotionStatus::Stopped {
                // Shaft no longer advancing: one-shot duty kick so the move
                // can finish the last fraction of a degree.
                self.softstop_done = true;
                self.duty = (self.duty + braking).min(self.cfg.max_duty);
            }
        }
        MotorState::Decelerating
    }

    fn task_paused(&mut self, entry: bool) -> MotorState {
        if entry {
            self.output_enabled = false;
        }
        self.duty = 0;
        if self.elapsed > self.cfg.pause_settle {
            return MotorState::Stopped;
        }
        MotorState::Paused
    }

    fn task_stalled(&mut self, entry: bool) -> MotorState {
        if entry {
            self.output_enabled = false;
        }
        self.duty = 0;
        if self.stall_flags.is_empty() {
            return MotorState::Stopped;
        }
        MotorState::Stalled
    }

    fn task_fault(&mut self, entry: bool, bridge: &mut impl MotorBridge) -> MotorState {
        if entry {
            self.output_enabled = false;
        }
        self.duty = 0;
        if self.fault_flags.is_empty() {
            bridge.rearm_drive();
            return MotorState::Stopped;
        }
        MotorState::Fault
    }

    /// A reversal is pending when the position error sign no longer matches
    /// the engaged direction (honoring the configured pole polarity).
    fn direction_reversal_requested(&self) -> bool {
        let forward_dir = if self.cfg.invert_polarity {
            MotorDirection::CounterClockwise
        } else {
            MotorDirection::Clockwise
        };
        if self.direction == forward_dir {
            self.delta < 0
        } else {
            self.delta > 0
        }
    }

    /// 20 ms position-delta filter producing the Running/Stopped verdict.
    fn tick_motion_filter(&mut self) {
        if self.output_enabled {
            if self.motion_delay > 0 {
                self.motion_delay -= 1;
            }
            if self.motion_delay == 0 {
                self.motion_period += 1;
            }
        } else {
            self.motion_delay = self.cfg.motion_blanking;
            self.motion_period = self.cfg.motion_sample_period / 2;
            self.motion_votes = 0;
            self.motion_delta = 0;
            self.motion = MotionStatus::Off;
            self.motion_last_angle = self.current;
        }

        if self.motion_period >= self.cfg.motion_sample_period {
            self.motion_period = 0;
            self.motion_delta = linear_diff(self.current, self.motion_last_angle);
            self.motion_last_angle = self.current;

            if self.motion_delta >= self.motion_threshold {
                self.motion_votes = (self.motion_votes + 1).min(3);
            } else {
                self.motion_votes = (self.motion_votes - 1).max(-3);
            }
            if self.motion_votes >= 2 {
                self.motion = MotionStatus::Running;
            } else if self.motion_votes <= -2 {
                self.motion = MotionStatus::Stopped;
            }
        }
    }

    // ─── 100 µs fast path ───────────────────────────────────────────

    /// Position capture, reached test, diagnostics and output drive.
    pub fn tick_100us(
        &mut self,
        angle: i16,
        current_ma: u16,
        bridge: &mut impl MotorBridge,
        events: &mut EventLog,
    ) {
        self.current = angle;
        self.delta = self.target.wrapping_sub(self.current);

        if linear_diff(self.target, self.current) <= self.cfg.off_hysteresis {
            self.output_enabled = false;
            self.position_reached = true;
            self.new_target = false;
        }

        if self.output_enabled {
            self.stall_diag(current_ma, events);
        } else {
            self.stall_mask_timer = 0;
        }
        if !self.stall_flags.is_empty() {
            self.output_enabled = false;
            self.force_state(MotorState::Stalled);
        }

        self.fault_diag(current_ma, bridge, events);
        if !self.fault_flags.is_empty() {
            self.output_enabled = false;
            self.force_state(MotorState::Fault);
        }

        if self.output_enabled {
            bridge.set_duty(self.direction, self.duty);
        } else if self.elapsed >= self.cfg.brake_hold {
            bridge.coast();
        } else {
            bridge.brake();
        }
    }

    fn force_state(&mut self, state: MotorState) {
        if self.state != state {
            self.state = state;
            self.entry = true;
            self.elapsed = 0;
        }
    }
}
