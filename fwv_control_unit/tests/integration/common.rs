//! Shared test rig: control unit wired to the simulated plant.

use fwv_common::config::ControlConfig;
use fwv_common::state::ValveState;
use fwv_control_unit::cycle::ControlUnit;
use fwv_control_unit::sim::SimPlant;

/// 100 µs ticks per millisecond.
pub const TICKS_PER_MS: u64 = 10;

/// Bus cycle period [100 µs ticks]: one request/response edge per 100 ms.
const BUS_PERIOD: u64 = 1000;

/// Control unit plus plant, stepped together.
pub struct Rig {
    pub cu: ControlUnit,
    pub plant: SimPlant,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_config(ControlConfig::default())
    }

    pub fn with_config(cfg: ControlConfig) -> Self {
        Self::with_plant_setup(cfg, |_| {})
    }

    /// Build the rig with the plant adjusted before the control unit boots
    /// (persisted records, shifted mechanics, fault injection).
    pub fn with_plant_setup(cfg: ControlConfig, setup: impl FnOnce(&mut SimPlant)) -> Self {
        let mut plant = SimPlant::new(&cfg);
        setup(&mut plant);
        let mut cu = ControlUnit::new(cfg);
        cu.boot(&mut plant.nv);
        Self { cu, plant }
    }

    /// One 100 µs step with live bus traffic.
    pub fn step(&mut self) {
        if self.cu.tick_count() % BUS_PERIOD == 0 {
            self.cu.on_bus_request_received();
            self.cu.on_bus_response_transmitted();
        }
        self.step_silent();
    }

    /// One 100 µs step without any bus frame events.
    pub fn step_silent(&mut self) {
        self.plant.step();
        self.cu.tick_100us(
            &self.plant.adc,
            &mut self.plant.bridge,
            &mut self.plant.bus,
            &mut self.plant.nv,
        );
    }

    /// Run for a fixed number of milliseconds with live bus traffic.
    pub fn run_ms(&mut self, ms: u64) {
        for _ in 0..ms * TICKS_PER_MS {
            self.step();
        }
    }

    /// Run for a fixed number of milliseconds with the bus silent.
    pub fn run_ms_silent(&mut self, ms: u64) {
        for _ in 0..ms * TICKS_PER_MS {
            self.step_silent();
        }
    }

    /// Run until the predicate holds, checking once per millisecond.
    /// Returns false if the timeout elapses first.
    pub fn run_until(&mut self, timeout_ms: u64, pred: impl Fn(&Rig) -> bool) -> bool {
        for _ in 0..timeout_ms {
            for _ in 0..TICKS_PER_MS {
                self.step();
            }
            if pred(self) {
                return true;
            }
        }
        false
    }

    /// Boot settle: ignition resolves, Init releases into Standby.
    pub fn boot_to_standby(&mut self) {
        assert!(
            self.run_until(200, |r| r.cu.valve_state() == ValveState::Standby),
            "valve never reached Standby after boot (state {:?})",
            self.cu.valve_state()
        );
    }
}
