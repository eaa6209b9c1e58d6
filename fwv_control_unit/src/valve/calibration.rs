//! End-stop calibration sequence.
//!
//! The valve travel is bounded by two mechanical stops at a known angular
//! offset from the mode positions. Calibration drives into a stop until the
//! hard-stall detector fires, which anchors the position model:
//!
//! 1. `SeekLowStop` — drive below the low stop; on stall, refine the sensor
//!    zero-point (once per boot) against the nominal stop angle.
//! 2. `Calc` — low-stop angle + stopper geometry gives mode B; a full pass
//!    continues to the high stop for mode A, a quick pass returns directly.
//! 3. `SeekHighStop` — drive beyond the high stop; on stall, mode A and the
//!    total travel are recorded.
//! 4. `SeekInit` — return to mode B; standstill there completes the pass.
//!
//! Every seek carries a tick-counted timeout; a stall during the return leg
//! or an exhausted timeout ends the pass in `Fault` with a recorded
//! calibration-fault event. The pass never hangs and never reports
//! `Completed` without reaching standstill at mode B.

use tracing::{debug, info};

use fwv_common::angle::{linear_diff, wrap};
use fwv_common::condition::ProtectCause;
use fwv_common::error::{DiagEvent, EventLog};
use fwv_common::hal::{CAL_VALID_CODE, CalRecord, MODE_A, MODE_B, NvMemory};
use fwv_common::state::{CalibrationStep, MotorState, ValveState};

use crate::fusion::SensorFusion;
use crate::motor::{MotorController, StallClearScope};

use super::ValveController;

/// Calibration sub-state, active only while the valve state is
/// `Calibration`.
#[derive(Debug)]
pub(crate) struct Calibration {
    step: CalibrationStep,
    /// Zero-point refinement already performed this boot.
    offset_done: bool,
    /// Full pass over both stops requested.
    full_request: bool,
    /// Quick pass against the nearer stop requested.
    quick_request: bool,
    /// Measured stop-to-stop travel [0.1°].
    travel: i16,
    low_angle: i16,
    /// Verdict delay after commanding a seek [1 ms ticks].
    delay: u16,
    /// Seek timeout counter [1 ms ticks].
    timer: u16,
}

impl Calibration {
    pub(crate) fn new() -> Self {
        Self {
            step: CalibrationStep::Reset,
            offset_done: false,
            full_request: false,
            quick_request: false,
            travel: 0,
            low_angle: 0,
            delay: 0,
            timer: 0,
        }
    }

    pub(crate) fn request_full(&mut self) {
        self.full_request = true;
    }

    pub(crate) fn request_quick(&mut self) {
        self.quick_request = true;
    }

    pub(crate) fn pending(&self) -> bool {
        self.full_request || self.quick_request
    }

    pub(crate) fn clear_requests(&mut self) {
        self.full_request = false;
        self.quick_request = false;
    }

    pub(crate) fn step(&self) -> CalibrationStep {
        self.step
    }
}

impl ValveController {
    /// One 1 ms slice of the calibration sequence.
    pub(crate) fn task_calibration<M>(
        &mut self,
        entry: bool,
        motor: &mut MotorController,
        fusion: &mut SensorFusion,
        nv: &mut M,
        events: &mut EventLog,
    ) -> ValveState
    where
        M: NvMemory,
    {
        let timeout = if self.calibration.full_request {
            self.cfg.full_cal_timeout
        } else {
            self.cfg.quick_cal_timeout
        };

        if entry {
            self.calibration.step = CalibrationStep::Reset;
            self.cal_fault = false;
        }
        self.last_mode = fwv_common::hal::MODE_NONE;

        match self.calibration.step {
            CalibrationStep::Reset => {
                motor.clear_stall(StallClearScope::All);
                motor.request_hard_stop();
                self.calibration.step = CalibrationStep::Start;
            }

            CalibrationStep::Start => {
                motor.clear_hard_stop();
                self.calibration.delay = self.cfg.seek_verdict_delay;
                self.calibration.timer = 0;
                let seek_low = self.calibration.full_request
                    || self.current_angle
                        <= self.mode_angle[MODE_B as usize] + self.cfg.quick_near_window;
                if seek_low {
                    self.target_angle = self.cfg.low_seek_target;
                    motor.set_target(self.target_angle);
                    self.calibration.step = CalibrationStep::SeekLowStop;
                } else {
                    self.target_angle = self.cfg.high_seek_target;
                    motor.set_target(self.target_angle);
                    self.calibration.step = CalibrationStep::SeekHighStop;
                }
            }

            CalibrationStep::SeekLowStop => {
                self.calibration.timer += 1;
                if self.calibration.timer >= timeout {
                    self.calibration.step = CalibrationStep::Fault;
                } else if self.calibration.delay > 0 {
                    self.calibration.delay -= 1;
                } else if self.motor_motion == MotorState::Stalled {
                    motor.clear_stall(StallClearScope::All);
                    motor.request_hard_stop();
                    self.refine_sensor_offset(fusion, nv);
                    self.calibration.delay = self.cfg.seek_verdict_delay;
                    self.calibration.timer = 0;
                    self.calibration.step = CalibrationStep::Calc;
                } else if self.motor_motion == MotorState::Stopped {
                    // Reached the seek target without touching the stop:
                    // the position model cannot be trusted.
                    self.calibration.step = CalibrationStep::Fault;
                }
            }

            CalibrationStep::SeekHighStop => {
                self.calibration.timer += 1;
                if self.calibration.timer >= timeout {
                    self.calibration.step = CalibrationStep::Fault;
                } else if self.calibration.delay > 0 {
                    self.calibration.delay -= 1;
                } else if self.motor_motion == MotorState::Stalled {
                    motor.clear_stall(StallClearScope::All);
                    let high = wrap(self.current_angle - self.cfg.stopper_angle);
                    self.mode_angle[MODE_A as usize] = high;
                    self.calibration.travel = high - self.calibration.low_angle;
                    debug!(
                        mode_a = high,
                        travel = self.calibration.travel,
                        "high stop anchored"
                    );
                    self.target_angle = self.mode_angle[MODE_B as usize];
                    motor.set_target(self.target_angle);
                    self.calibration.delay = self.cfg.seek_verdict_delay;
                    self.calibration.timer = 0;
                    self.calibration.step = CalibrationStep::SeekInit;
                } else if self.motor_motion == MotorState::Stopped {
                    self.calibration.step = CalibrationStep::Fault;
                }
            }

            CalibrationStep::Calc => {
                if self.calibration.delay > 0 {
                    self.calibration.delay -= 1;
                } else {
                    let low = wrap(self.current_angle + self.cfg.stopper_angle);
                    self.calibration.low_angle = low;
                    self.mode_angle[MODE_B as usize] = low;
                    debug!(mode_b = low, "low stop anchored");

                    if self.calibration.full_request {
                        self.target_angle = self.cfg.high_seek_target;
                        self.calibration.step = CalibrationStep::SeekHighStop;
                    } else {
                        self.target_angle = self.mode_angle[MODE_B as usize];
                        self.calibration.step = CalibrationStep::SeekInit;
                    }
                    self.calibration.timer = 0;
                    motor.clear_hard_stop();
                    motor.set_target(self.target_angle);
                }
            }

            CalibrationStep::SeekInit => {
                self.calibration.timer += 1;
                if self.calibration.timer >= timeout {
                    self.calibration.step = CalibrationStep::Fault;
                } else if self.calibration.delay > 0 {
                    self.calibration.delay -= 1;
                } else if self.motor_motion == MotorState::Stalled {
                    // Stalling on the way back means the geometry is wrong.
                    motor.clear_stall(StallClearScope::All);
                    motor.request_hard_stop();
                    self.calibration.step = CalibrationStep::Fault;
                } else if self.motor_motion == MotorState::Stopped {
                    self.calibration.step = CalibrationStep::Completed;
                }
            }

            CalibrationStep::Fault => {
                self.calibration.clear_requests();
                self.cal_fault = true;
                events.record(DiagEvent::reading(
                    ProtectCause::CalibrationFault,
                    self.current_angle as u16,
                ));
                info!(angle = self.current_angle, "calibration failed");
                return ValveState::Fault;
            }

            CalibrationStep::Completed => {
                self.calibration.clear_requests();
                // A verified pass refreshes the motor-fault retry budgets.
                self.cal_retry = 0;
                self.stall_retry = 0;
                self.open_retry = 0;
                self.short_retry = 0;
                info!(
                    mode_a = self.mode_angle[MODE_A as usize],
                    mode_b = self.mode_angle[MODE_B as usize],
                    "calibration complete"
                );
                return ValveState::Standby;
            }
        }
        ValveState::Calibration
    }

    /// Anchor the sensor zero-point against the nominal low-stop angle.
    /// Runs once per boot; persisted only when it moved past the hysteresis.
    fn refine_sensor_offset<M: NvMemory>(&mut self, fusion: &mut SensorFusion, nv: &mut M) {
        if self.calibration.offset_done {
            return;
        }
        self.calibration.offset_done = true;

        let correction = self.cfg.low_stop_nominal - self.current_angle;
        let offset = wrap(fusion.sensor_offset() + correction);
        fusion.set_sensor_offset(offset);
        debug!(offset, "sensor zero-point refined");

        if linear_diff(offset, self.mem_offset) > self.cfg.cal_hysteresis {
            let record = CalRecord {
                offset: offset as u16,
                last_angle: self.current_angle as u16,
                code: CAL_VALID_CODE,
            };
            if nv.write_valve_calibration(record).is_ok() {
                self.mem_offset = offset;
                self.mem_last_angle = self.current_angle;
            }
        }
    }
}
