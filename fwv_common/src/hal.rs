//! Collaborator interfaces.
//!
//! The control core never touches hardware registers, bus frames or EEPROM
//! cells directly; it reaches them through these traits. The real node wires
//! them to the peripheral drivers, the LIN signal layer and the EEPROM
//! library; the host build wires them to the simulated plant.

use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::state::MotorDirection;

/// Bus encoding of the two valve positions.
pub const MODE_A: u8 = 0;
pub const MODE_B: u8 = 1;
/// Bus encoding for "no valid mode commanded".
pub const MODE_NONE: u8 = 0xFF;

// ─── Analog front end ───────────────────────────────────────────────

/// Raw ADC sample access, one getter per conversion channel.
///
/// Samples are delivered already converted by the ADC sequencer; the fusion
/// layer owns averaging and scaling.
pub trait AnalogInputs {
    fn raw_supply(&self) -> u16;
    fn raw_temperature(&self) -> u16;
    fn raw_current(&self) -> u16;
    fn raw_vdda(&self) -> u16;
    fn raw_ignition(&self) -> u16;
    fn raw_gmr_neg_cosine(&self) -> u16;
    fn raw_gmr_neg_sine(&self) -> u16;
    fn raw_gmr_pos_cosine(&self) -> u16;
    fn raw_gmr_pos_sine(&self) -> u16;
}

// ─── H-bridge ───────────────────────────────────────────────────────

/// Single H-bridge drive plus the hardware protection latches.
///
/// Pending latches are set by the protection circuit and stay set until the
/// matching re-arm call; re-arming before the condition cleared re-trips
/// immediately.
pub trait MotorBridge {
    /// Begin driving in the given direction at the given duty [PWM counts].
    fn start(&mut self, direction: MotorDirection, duty: u16);
    /// Update the duty while driving.
    fn set_duty(&mut self, direction: MotorDirection, duty: u16);
    /// Disable drive with both low-side switches closed (active braking).
    fn brake(&mut self);
    /// Release all switches (coast).
    fn coast(&mut self);

    fn overcurrent_pending(&self) -> bool;
    fn vds_pending(&self) -> bool;
    fn overvoltage_pending(&self) -> bool;
    fn undervoltage_pending(&self) -> bool;
    fn overtemperature_pending(&self) -> bool;

    fn rearm_overvoltage(&mut self);
    fn rearm_undervoltage(&mut self);
    fn rearm_overtemperature(&mut self);
    /// Clear the over-current / VDS latch and re-enable the pre-driver.
    fn rearm_drive(&mut self);
}

// ─── Bus signal layer ───────────────────────────────────────────────

/// Named signal access into the bus frame buffers.
///
/// Reads return the most recently received command values; writes update the
/// response buffer transmitted on the next bus cycle.
pub trait BusSignals {
    fn move_enable(&self) -> bool;
    fn forced_diag(&self) -> bool;
    fn target_mode(&self) -> u8;
    fn initial_request(&self) -> bool;

    fn write_actual_mode(&mut self, mode: u8);
    fn write_position_fault(&mut self, on: bool);
    fn write_fault_mode(&mut self, on: bool);
    fn write_protect_mode(&mut self, on: bool);
    fn write_initial_status(&mut self, on: bool);
    fn write_calibration_fail(&mut self, on: bool);
    fn write_move_status(&mut self, moving: bool);
    fn write_motor_stall(&mut self, on: bool);
    fn write_open_circuit(&mut self, on: bool);
    fn write_short_circuit(&mut self, on: bool);
    fn write_undervoltage(&mut self, on: bool);
    fn write_overvoltage(&mut self, on: bool);
    fn write_overcurrent(&mut self, on: bool);
    fn write_overtemperature(&mut self, on: bool);
    fn write_diag_forced_status(&mut self, on: bool);
    fn write_position_sensor_fault(&mut self, on: bool);
    fn write_comm_error(&mut self, on: bool);
    fn write_sw_version(&mut self, version: u16);
    fn write_stall_zone(&mut self, zone: u8);

    /// Request transceiver sleep once low-power housekeeping is complete.
    fn request_sleep(&mut self);
}

// ─── Non-volatile memory ────────────────────────────────────────────

/// Marker code for a valid calibration record.
pub const CAL_VALID_CODE: u16 = 0x5555;
/// Marker code for a valid diagnostic record.
pub const DIAG_VALID_CODE: u16 = 0xAAAA;

/// Persisted calibration record: sensor zero-point, last known angle, marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CalRecord {
    pub offset: u16,
    pub last_angle: u16,
    pub code: u16,
}

/// Persisted diagnostic record: event cause, event value, marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DiagRecord {
    pub cause: u16,
    pub value: u16,
    pub code: u16,
}

// Fixed three-word layout owned by the storage collaborator.
const_assert_eq!(core::mem::size_of::<CalRecord>(), 6);
const_assert_eq!(core::mem::size_of::<DiagRecord>(), 6);

/// Non-volatile storage failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage read failed: {0}")]
    Read(&'static str),
    #[error("storage write failed: {0}")]
    Write(&'static str),
    #[error("record checksum mismatch")]
    Corrupt,
}

/// Persistence collaborator for the two application records.
///
/// `Ok(None)` means the cell was never written (blank device); corrupted
/// cells surface as [`StoreError::Corrupt`].
pub trait NvMemory {
    fn read_valve_calibration(&mut self) -> Result<Option<CalRecord>, StoreError>;
    fn write_valve_calibration(&mut self, record: CalRecord) -> Result<(), StoreError>;
    fn read_diag_event(&mut self) -> Result<Option<DiagRecord>, StoreError>;
    fn write_diag_event(&mut self, record: DiagRecord) -> Result<(), StoreError>;
}
