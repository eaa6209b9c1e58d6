//! Protection condition enums and diagnostic event causes.

/// Supply voltage health, debounced with hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupplyCondition {
    Normal,
    Undervoltage,
    Overvoltage,
    /// Power-up state, resolves on the first evaluation.
    #[default]
    Undefined,
}

/// Ignition input health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IgnitionCondition {
    Normal,
    Off,
    #[default]
    Undefined,
}

/// Chip temperature health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemperatureCondition {
    Normal,
    Low,
    High,
    #[default]
    Undefined,
}

/// Cause attached to a diagnostic event and to Protection-state accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum ProtectCause {
    #[default]
    None = 0,
    SupplyLow = 1,
    SupplyHigh = 2,
    TempHigh = 3,
    MotorOvercurrent = 4,
    Obstruction = 5,
    PositionFault = 6,
    SensorFault = 7,
    McuFault = 8,
    CalibrationFault = 9,
    MotorStall = 10,
    MotorShort = 11,
    MotorOpen = 12,
}

impl ProtectCause {
    /// Wire/persisted encoding.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Decode a persisted cause; unknown values fall back to `None`.
    pub const fn from_u16(raw: u16) -> Self {
        match raw {
            1 => Self::SupplyLow,
            2 => Self::SupplyHigh,
            3 => Self::TempHigh,
            4 => Self::MotorOvercurrent,
            5 => Self::Obstruction,
            6 => Self::PositionFault,
            7 => Self::SensorFault,
            8 => Self::McuFault,
            9 => Self::CalibrationFault,
            10 => Self::MotorStall,
            11 => Self::MotorShort,
            12 => Self::MotorOpen,
            _ => Self::None,
        }
    }
}
