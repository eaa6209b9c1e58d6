//! Tick dispatch: the cooperative 100 µs / 1 ms schedule.
//!
//! [`ControlUnit`] composes the four core components and the event log by
//! ownership; the peripheral collaborators (ADC, H-bridge, bus signal layer,
//! non-volatile memory) stay with the caller and are passed by exclusive
//! reference into the tick entry points, the way the node's timer loop owns
//! its peripheral handles.
//!
//! A single free-running counter orders the two rates: every call runs the
//! 100 µs motor path first, every tenth call additionally runs the 1 ms
//! application path, so motor-owned fields are always refreshed before the
//! valve orchestrator reads them. Bus frame events arriving between ticks
//! only set sticky flags consumed exactly once by the next 1 ms tick.

use std::time::Instant;

use fwv_common::condition::ProtectCause;
use fwv_common::config::ControlConfig;
use fwv_common::error::EventLog;
use fwv_common::hal::{AnalogInputs, BusSignals, MotorBridge, NvMemory};
use fwv_common::state::{MotorState, ValveState};

use crate::fusion::SensorFusion;
use crate::motor::MotorController;
use crate::protection::ProtectionMonitor;
use crate::valve::ValveController;

/// Number of 100 µs sub-ticks per 1 ms application tick.
const SUBTICKS_PER_MS: u8 = 10;

/// O(1) per-tick timing statistics for host-side observability.
#[derive(Debug, Clone)]
pub struct TickStats {
    /// Total dispatched ticks.
    pub tick_count: u64,
    /// Last tick duration [ns].
    pub last_ns: u64,
    /// Minimum tick duration [ns].
    pub min_ns: u64,
    /// Maximum tick duration [ns].
    pub max_ns: u64,
    /// Running sum for average computation.
    pub sum_ns: u64,
}

impl TickStats {
    pub const fn new() -> Self {
        Self {
            tick_count: 0,
            last_ns: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
        }
    }

    /// Record one tick duration. O(1), no allocation.
    #[inline]
    pub fn record(&mut self, ns: u64) {
        self.tick_count += 1;
        self.last_ns = ns;
        if ns < self.min_ns {
            self.min_ns = ns;
        }
        if ns > self.max_ns {
            self.max_ns = ns;
        }
        self.sum_ns += ns;
    }

    /// Average tick duration [ns] (0 before the first tick).
    #[inline]
    pub fn avg_ns(&self) -> u64 {
        if self.tick_count == 0 {
            0
        } else {
            self.sum_ns / self.tick_count
        }
    }
}

impl Default for TickStats {
    fn default() -> Self {
        Self::new()
    }
}

/// The complete control core: sensor fusion, protection monitor, motor
/// controller and valve orchestrator under one owner.
#[derive(Debug)]
pub struct ControlUnit {
    fusion: SensorFusion,
    protection: ProtectionMonitor,
    motor: MotorController,
    valve: ValveController,
    events: EventLog,

    /// Free-running 100 µs tick counter.
    tick_count: u64,
    /// Position inside the current 1 ms frame.
    subtick: u8,

    // Bus event flags, set by the frame entry points, drained once per
    // 1 ms tick.
    bus_request: bool,
    bus_response: bool,

    stats: TickStats,
}

impl ControlUnit {
    pub fn new(cfg: ControlConfig) -> Self {
        Self {
            fusion: SensorFusion::new(cfg.fusion),
            protection: ProtectionMonitor::new(cfg.protection),
            motor: MotorController::new(cfg.motor),
            valve: ValveController::new(cfg.valve),
            events: EventLog::new(),
            tick_count: 0,
            subtick: 0,
            bus_request: false,
            bus_response: false,
            stats: TickStats::new(),
        }
    }

    /// Restore persisted calibration and the last diagnostic event. Call once
    /// before the first tick.
    pub fn boot(&mut self, nv: &mut impl NvMemory) {
        self.valve.boot(nv, &mut self.fusion, &mut self.events);
    }

    // ─── Periodic entry points ──────────────────────────────────────

    /// 100 µs motor path: sensor averaging, position capture, reached test,
    /// stall/fault diagnostics, PWM output.
    pub fn motor_tick(&mut self, adc: &impl AnalogInputs, bridge: &mut impl MotorBridge) {
        self.fusion.update(adc);
        self.motor.tick_100us(
            self.fusion.angle(),
            self.fusion.motor_current(),
            bridge,
            &mut self.events,
        );
    }

    /// 1 ms application path: protection monitors, hardware latch
    /// supervision, motor housekeeping, valve orchestration, bus exchange.
    pub fn valve_tick<B, S, M>(&mut self, bridge: &mut B, bus: &mut S, nv: &mut M)
    where
        B: MotorBridge,
        S: BusSignals,
        M: NvMemory,
    {
        self.protection.tick(&self.fusion);
        self.protection.supervise_latches(bridge);
        self.motor.tick_1ms(bridge, self.fusion.supply_voltage());

        let bus_request = core::mem::take(&mut self.bus_request);
        let bus_response = core::mem::take(&mut self.bus_response);
        self.valve.tick(
            &mut self.fusion,
            &self.protection,
            &mut self.motor,
            bridge,
            bus,
            nv,
            &mut self.events,
            bus_request,
            bus_response,
        );
    }

    /// Free-running dispatcher: call every 100 µs. Runs the motor path on
    /// every call and the application path on every tenth, motor first.
    pub fn tick_100us<A, B, S, M>(&mut self, adc: &A, bridge: &mut B, bus: &mut S, nv: &mut M)
    where
        A: AnalogInputs,
        B: MotorBridge,
        S: BusSignals,
        M: NvMemory,
    {
        let started = Instant::now();

        self.motor_tick(adc, bridge);
        self.subtick += 1;
        if self.subtick >= SUBTICKS_PER_MS {
            self.subtick = 0;
            self.valve_tick(bridge, bus, nv);
        }
        self.tick_count += 1;

        self.stats.record(started.elapsed().as_nanos() as u64);
    }

    // ─── Bus frame events ───────────────────────────────────────────

    /// A command frame addressed to this node was received.
    pub fn on_bus_request_received(&mut self) {
        self.bus_request = true;
    }

    /// The status response frame was transmitted on the bus.
    pub fn on_bus_response_transmitted(&mut self) {
        self.bus_response = true;
    }

    // ─── Requests ───────────────────────────────────────────────────

    /// Queue a calibration pass for the next Standby evaluation.
    pub fn request_calibration(&mut self, full: bool) {
        self.valve.request_calibration(full);
    }

    // ─── Status getters ─────────────────────────────────────────────

    #[inline]
    pub fn valve_state(&self) -> ValveState {
        self.valve.state()
    }

    #[inline]
    pub fn motor_state(&self) -> MotorState {
        self.motor.state()
    }

    #[inline]
    pub fn valve_mode(&self) -> u8 {
        self.valve.actual_mode()
    }

    #[inline]
    pub fn current_angle(&self) -> i16 {
        self.motor.current_position()
    }

    #[inline]
    pub fn mode_angles(&self) -> [i16; 2] {
        self.valve.mode_angles()
    }

    #[inline]
    pub fn supply_voltage(&self) -> u16 {
        self.fusion.supply_voltage()
    }

    #[inline]
    pub fn temperature(&self) -> i16 {
        self.fusion.temperature()
    }

    #[inline]
    pub fn motor_current(&self) -> u16 {
        self.fusion.motor_current()
    }

    #[inline]
    pub fn fault_mode(&self) -> bool {
        self.valve.fault_mode()
    }

    #[inline]
    pub fn protection_cause(&self) -> ProtectCause {
        self.valve.protection_cause()
    }

    #[inline]
    pub fn latest_event(&self) -> fwv_common::error::DiagEvent {
        self.events.latest()
    }

    #[inline]
    pub fn stats(&self) -> &TickStats {
        &self.stats
    }

    #[inline]
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    // Component access for in-crate tests and the simulation binary.

    #[inline]
    pub fn protection(&self) -> &ProtectionMonitor {
        &self.protection
    }

    #[inline]
    pub fn sensor_offset(&self) -> i16 {
        self.fusion.sensor_offset()
    }
}
