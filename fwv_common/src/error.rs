//! Motor fault bitflags and the diagnostic event log.
//!
//! Flags are sticky: the detection paths may only add bits, the owning task
//! clears them once the underlying condition is confirmed gone.

use bitflags::bitflags;
use heapless::Deque;

use crate::condition::ProtectCause;

bitflags! {
    /// Motion stall flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StallFlags: u8 {
        /// Transient obstruction: current high while motion is suspiciously slow.
        const TEMPORARY = 0x01;
        /// Hard stall: current high while motion is absent.
        const PERMANENT = 0x02;
    }
}

impl Default for StallFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Electrical motor fault flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MotorFaultFlags: u8 {
        /// Near-zero current while the sensor expects motion.
        const PHASE_OPEN   = 0x01;
        /// VDS / short-circuit latched by the bridge hardware.
        const PHASE_SHORT  = 0x02;
        /// Sustained current above the fixed ceiling.
        const OVER_CURRENT = 0x04;
    }
}

impl Default for MotorFaultFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// A single diagnostic event: what tripped and a compact reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiagEvent {
    pub cause: ProtectCause,
    pub value: u16,
}

impl DiagEvent {
    /// Event for a motor diagnostic trip: low byte carries the scaled current
    /// (1 LSB = 8 mA), high byte the coarse time-in-state (1 LSB = 256 ticks).
    #[inline]
    pub const fn motor(cause: ProtectCause, current_ma: u16, elapsed_ticks: u16) -> Self {
        let value = ((current_ma >> 3) & 0x00FF) | ((elapsed_ticks >> 8) << 8);
        Self { cause, value }
    }

    /// Event carrying a raw environment reading.
    #[inline]
    pub const fn reading(cause: ProtectCause, value: u16) -> Self {
        Self { cause, value }
    }
}

/// Number of events retained for post-mortem inspection.
pub const EVENT_HISTORY_DEPTH: usize = 8;

/// Latest diagnostic event plus a bounded history ring.
///
/// Recording never allocates; when the ring is full the oldest entry is
/// dropped. Duplicate consecutive events collapse into the existing entry.
#[derive(Debug, Default)]
pub struct EventLog {
    latest: DiagEvent,
    history: Deque<DiagEvent, EVENT_HISTORY_DEPTH>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event as the latest, appending to the history ring.
    pub fn record(&mut self, event: DiagEvent) {
        if event == self.latest {
            return;
        }
        self.latest = event;
        if self.history.is_full() {
            self.history.pop_front();
        }
        // Capacity was just ensured.
        let _ = self.history.push_back(event);
    }

    /// Restore the latest event from persistence without touching history.
    pub fn restore(&mut self, event: DiagEvent) {
        self.latest = event;
    }

    /// Clear the latest event (history is kept for inspection).
    pub fn reset_latest(&mut self) {
        self.latest = DiagEvent::default();
    }

    #[inline]
    pub fn latest(&self) -> DiagEvent {
        self.latest
    }

    pub fn history(&self) -> impl Iterator<Item = &DiagEvent> {
        self.history.iter()
    }
}
