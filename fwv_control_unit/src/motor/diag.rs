//! Stall and electrical-fault detection on the 100 µs fast path.
//!
//! Two motion diagnostics and three electrical diagnostics, each with its
//! own debounce counter so a disabled class never reaches the shared flags:
//!
//! | Detector     | Condition                                   | Flag          |
//! |--------------|---------------------------------------------|---------------|
//! | Obstruction  | current ≥ half threshold, delta low-nonzero | `TEMPORARY`   |
//! | Hard stall   | current ≥ full threshold, sensor stopped    | `PERMANENT`   |
//! | Open phase   | near-zero current while running             | `PHASE_OPEN`  |
//! | Over-current | current ≥ fixed ceiling while enabled       | `OVER_CURRENT`|
//! | Short / VDS  | bridge hardware latch                       | `PHASE_SHORT` |

use tracing::warn;

use fwv_common::condition::ProtectCause;
use fwv_common::error::{DiagEvent, EventLog, MotorFaultFlags, StallFlags};
use fwv_common::hal::MotorBridge;
use fwv_common::state::{MotionStatus, MotorState};

use super::MotorController;

impl MotorController {
    /// Motion diagnostics, masked for the first 100 ms after enable.
    pub(super) fn stall_diag(&mut self, current_ma: u16, events: &mut EventLog) {
        self.stall_mask_timer = self.stall_mask_timer.saturating_add(1);
        if self.stall_mask_timer < self.cfg.stall_mask {
            self.stall_count = 0;
            self.obstruction_count = 0;
            return;
        }

        // Obstruction: elevated current with motion in the suspicious
        // low-but-nonzero band.
        let suspicious = current_ma >= self.obstruction_current
            && self.motion_delta < self.motion_threshold
            && self.motion_delta > self.cfg.obstruction_delta_floor;
        if suspicious {
            self.obstruction_count = self.obstruction_count.saturating_add(1);
        } else {
            self.obstruction_count = self.obstruction_count.saturating_sub(1);
        }
        if self.obstruction_count >= self.cfg.obstruction_trip
            && self.cfg.stall_detect_enabled
            && !self.obstruction_masked
            && !self.stall_flags.contains(StallFlags::TEMPORARY)
        {
            self.stall_flags.insert(StallFlags::TEMPORARY);
            warn!(current_ma, delta = self.motion_delta, "motor obstruction");
            events.record(DiagEvent::motor(
                ProtectCause::Obstruction,
                current_ma,
                self.elapsed,
            ));
        }

        // Hard stall: full threshold current with the shaft at standstill.
        let stalled = current_ma >= self.stall_current && self.motion == MotionStatus::Stopped;
        if stalled {
            self.stall_count = self.stall_count.saturating_add(1);
        } else {
            self.stall_count = self.stall_count.saturating_sub(1);
        }
        if self.stall_count >= self.cfg.stall_trip
            && self.cfg.stall_detect_enabled
            && !self.stall_flags.contains(StallFlags::PERMANENT)
        {
            self.stall_flags.insert(StallFlags::PERMANENT);
            warn!(current_ma, "motor stall");
            events.record(DiagEvent::motor(
                ProtectCause::MotorStall,
                current_ma,
                self.elapsed,
            ));
        }
    }

    /// Electrical diagnostics: open phase, over-current, hardware short.
    pub(super) fn fault_diag(
        &mut self,
        current_ma: u16,
        bridge: &impl MotorBridge,
        events: &mut EventLog,
    ) {
        // Open phase: no current although the drive is at speed.
        if self.state == MotorState::Running {
            if current_ma <= self.cfg.open_current_max && self.motion == MotionStatus::Stopped {
                self.open_count = self.open_count.saturating_add(1);
            } else {
                self.open_count = self.open_count.saturating_sub(1);
            }
            if self.open_count >= self.cfg.open_trip
                && self.cfg.open_detect_enabled
                && !self.fault_flags.contains(MotorFaultFlags::PHASE_OPEN)
            {
                self.fault_flags.insert(MotorFaultFlags::PHASE_OPEN);
                warn!(current_ma, "open phase");
                events.record(DiagEvent::motor(
                    ProtectCause::MotorOpen,
                    current_ma,
                    self.elapsed,
                ));
            }
        } else {
            self.open_count = 0;
        }

        // Over-current: sustained current above the fixed ceiling.
        if self.output_enabled {
            if current_ma >= self.cfg.overcurrent_ceiling {
                self.overcurrent_count = self.overcurrent_count.saturating_add(1);
            } else {
                self.overcurrent_count = self.overcurrent_count.saturating_sub(1);
            }
            if self.overcurrent_count >= self.cfg.overcurrent_trip
                && self.cfg.overcurrent_detect_enabled
                && !self.fault_flags.contains(MotorFaultFlags::OVER_CURRENT)
            {
                self.fault_flags.insert(MotorFaultFlags::OVER_CURRENT);
                warn!(current_ma, "motor over-current");
                events.record(DiagEvent::motor(
                    ProtectCause::MotorOvercurrent,
                    current_ma,
                    self.elapsed,
                ));
            }
        } else {
            self.overcurrent_count = 0;
        }

        // Hardware latches adopt directly; the protection circuit already
        // debounced them.
        if bridge.vds_pending() && self.cfg.short_detect_enabled {
            if !self.fault_flags.contains(MotorFaultFlags::PHASE_SHORT) {
                self.fault_flags.insert(MotorFaultFlags::PHASE_SHORT);
                warn!("VDS short latched by bridge");
                events.record(DiagEvent::motor(
                    ProtectCause::MotorShort,
                    current_ma,
                    self.elapsed,
                ));
            }
        } else if bridge.overcurrent_pending() && self.cfg.overcurrent_detect_enabled {
            self.fault_flags.insert(MotorFaultFlags::OVER_CURRENT);
        }
    }
}
