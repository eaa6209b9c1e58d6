//! State enums for the valve orchestrator and the motor drive.

use serde::{Deserialize, Serialize};

/// Top-level valve orchestration state.
///
/// `Fault` is motor-originated and recoverable only through bounded retries;
/// `Protection` is environment-originated and auto-recovers once the physical
/// condition clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValveState {
    Init,
    Standby,
    Ready,
    Operation,
    DiagRun,
    Calibration,
    Fault,
    Protection,
    PowerLatch,
    LowPower,
    Undef,
}

impl ValveState {
    /// States that must never be pre-empted by a PowerLatch entry.
    #[inline]
    pub const fn holds_through_ignition_off(&self) -> bool {
        matches!(self, Self::PowerLatch | Self::LowPower)
    }
}

/// Motor drive state. Cycles for the device lifetime; no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotorState {
    Init,
    Stopped,
    Accelerating,
    Running,
    Decelerating,
    Paused,
    Stalled,
    Fault,
}

impl MotorState {
    /// Whether the drive is actively producing motion (ramping or at speed).
    #[inline]
    pub const fn is_moving(&self) -> bool {
        matches!(self, Self::Accelerating | Self::Running | Self::Decelerating)
    }
}

/// Calibration sub-state, active only while the valve state is `Calibration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStep {
    Reset,
    Start,
    SeekLowStop,
    SeekHighStop,
    Calc,
    SeekInit,
    Fault,
    Completed,
}

/// H-bridge drive direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotorDirection {
    #[default]
    None,
    Clockwise,
    CounterClockwise,
}

/// Verdict of the 20 ms motion sensor filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionStatus {
    /// Output disabled, no verdict.
    #[default]
    Off,
    /// Shaft position is advancing.
    Running,
    /// Shaft position is no longer advancing.
    Stopped,
}
