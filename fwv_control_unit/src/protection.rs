//! Protection monitor: supply, ignition, temperature and MCU health.
//!
//! Each monitored quantity runs a small condition machine with separate
//! entry ("stop") and exit ("return") thresholds and an up/down debounce
//! counter: the counter increments while the reading sits past the active
//! threshold, decrements otherwise, floors at zero and commits the
//! transition at the configured count. The power-up `Undefined` states
//! resolve on first evaluation (ignition with a fast bootstrap filter).
//!
//! The monitor also supervises the bridge's hardware protection latches:
//! a pending latch raises the matching software condition and is re-armed
//! only once the converted reading is back inside the safe band.

use tracing::warn;

use fwv_common::condition::{IgnitionCondition, SupplyCondition, TemperatureCondition};
use fwv_common::config::ProtectionConfig;
use fwv_common::hal::MotorBridge;

use crate::fusion::SensorFusion;

/// Debounced condition classifier, one instance per control unit.
#[derive(Debug, Clone)]
pub struct ProtectionMonitor {
    cfg: ProtectionConfig,

    supply: SupplyCondition,
    supply_voltage: u16,
    uv_timer: u16,
    ov_timer: u16,

    ignition: IgnitionCondition,
    ignition_voltage: u16,
    ign_timer: u16,
    ign_boot_timer: u16,

    temperature: TemperatureCondition,
    temperature_deg: i16,
    temp_timer: u16,

    mcu_fault: bool,
    vdda_low_timer: u16,
    vdda_high_timer: u16,

    hw_overvoltage: bool,
    hw_undervoltage: bool,
    hw_overtemperature: bool,
}

impl ProtectionMonitor {
    pub fn new(cfg: ProtectionConfig) -> Self {
        Self {
            cfg,
            supply: SupplyCondition::Undefined,
            supply_voltage: 0,
            uv_timer: 0,
            ov_timer: 0,
            ignition: IgnitionCondition::Undefined,
            ignition_voltage: 0,
            ign_timer: 0,
            ign_boot_timer: 0,
            temperature: TemperatureCondition::Undefined,
            temperature_deg: 0,
            temp_timer: 0,
            mcu_fault: false,
            vdda_low_timer: 0,
            vdda_high_timer: 0,
            hw_overvoltage: false,
            hw_undervoltage: false,
            hw_overtemperature: false,
        }
    }

    /// Evaluate all monitors against the latest converted readings. 1 ms tick.
    pub fn tick(&mut self, fusion: &SensorFusion) {
        self.tick_supply(fusion.supply_voltage());
        self.tick_temperature(fusion.temperature());
        self.tick_ignition(fusion.ignition_voltage());
        self.tick_mcu(fusion.vdda_voltage());
    }

    /// Adopt pending hardware latches and re-arm the ones whose reading has
    /// returned inside the safe band. Never re-arms early.
    pub fn supervise_latches(&mut self, bridge: &mut impl MotorBridge) {
        if bridge.overvoltage_pending() {
            self.hw_overvoltage = true;
        } else if self.hw_overvoltage && self.supply_voltage < self.cfg.supply.over_return {
            bridge.rearm_overvoltage();
            self.hw_overvoltage = false;
        }

        if bridge.undervoltage_pending() {
            self.hw_undervoltage = true;
        } else if self.hw_undervoltage && self.supply_voltage > self.cfg.supply.under_return {
            bridge.rearm_undervoltage();
            self.hw_undervoltage = false;
        }

        if bridge.overtemperature_pending() {
            self.hw_overtemperature = true;
        } else if self.hw_overtemperature
            && self.temperature_deg < self.cfg.temperature.high_return
        {
            bridge.rearm_overtemperature();
            self.hw_overtemperature = false;
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────

    #[inline]
    pub fn supply_condition(&self) -> SupplyCondition {
        self.supply
    }

    #[inline]
    pub fn supply_voltage(&self) -> u16 {
        self.supply_voltage
    }

    #[inline]
    pub fn ignition_condition(&self) -> IgnitionCondition {
        self.ignition
    }

    #[inline]
    pub fn ignition_voltage(&self) -> u16 {
        self.ignition_voltage
    }

    #[inline]
    pub fn temperature_condition(&self) -> TemperatureCondition {
        self.temperature
    }

    #[inline]
    pub fn temperature(&self) -> i16 {
        self.temperature_deg
    }

    #[inline]
    pub fn mcu_fault(&self) -> bool {
        self.mcu_fault
    }

    #[inline]
    pub fn hw_latch_active(&self) -> bool {
        self.hw_overvoltage || self.hw_undervoltage || self.hw_overtemperature
    }

    // ─── Per-quantity machines ──────────────────────────────────────

    fn tick_supply(&mut self, voltage: u16) {
        self.supply_voltage = voltage;
        let t = &self.cfg.supply;
        match self.supply {
            SupplyCondition::Normal => {
                if voltage <= t.under_stop {
                    self.uv_timer += 1;
                    if self.uv_timer >= t.debounce {
                        self.uv_timer = 0;
                        self.supply = SupplyCondition::Undervoltage;
                        warn!(voltage, "supply undervoltage");
                    }
                } else if voltage >= t.over_stop {
                    self.ov_timer += 1;
                    if self.ov_timer >= t.debounce {
                        self.ov_timer = 0;
                        self.supply = SupplyCondition::Overvoltage;
                        warn!(voltage, "supply overvoltage");
                    }
                } else {
                    self.uv_timer = self.uv_timer.saturating_sub(1);
                    self.ov_timer = self.ov_timer.saturating_sub(1);
                }
            }
            SupplyCondition::Undervoltage => {
                if voltage >= t.under_return {
                    self.uv_timer += 1;
                    if self.uv_timer >= t.debounce {
                        self.uv_timer = 0;
                        self.supply = SupplyCondition::Normal;
                    }
                } else {
                    self.uv_timer = self.uv_timer.saturating_sub(1);
                }
            }
            SupplyCondition::Overvoltage => {
                if voltage <= t.over_return {
                    self.ov_timer += 1;
                    if self.ov_timer >= t.debounce {
                        self.ov_timer = 0;
                        self.supply = SupplyCondition::Normal;
                    }
                } else {
                    self.ov_timer = self.ov_timer.saturating_sub(1);
                }
            }
            SupplyCondition::Undefined => {
                self.uv_timer = 0;
                self.ov_timer = 0;
                self.supply = SupplyCondition::Normal;
            }
        }
    }

    fn tick_temperature(&mut self, deg: i16) {
        self.temperature_deg = deg;
        let t = &self.cfg.temperature;
        match self.temperature {
            TemperatureCondition::Normal => {
                if deg > t.high_stop {
                    self.temp_timer += 1;
                    if self.temp_timer >= t.debounce {
                        self.temp_timer = 0;
                        self.temperature = TemperatureCondition::High;
                        warn!(deg, "chip overtemperature");
                    }
                } else if deg < t.low_stop {
                    self.temp_timer += 1;
                    if self.temp_timer >= t.debounce {
                        self.temp_timer = 0;
                        self.temperature = TemperatureCondition::Low;
                    }
                } else {
                    self.temp_timer = self.temp_timer.saturating_sub(1);
                }
            }
            TemperatureCondition::Low => {
                if deg >= t.low_return {
                    self.temp_timer += 1;
                    if self.temp_timer >= t.debounce {
                        self.temp_timer = 0;
                        self.temperature = TemperatureCondition::Normal;
                    }
                } else {
                    self.temp_timer = self.temp_timer.saturating_sub(1);
                }
            }
            TemperatureCondition::High => {
                if deg <= t.high_return {
                    self.temp_timer += 1;
                    if self.temp_timer >= t.debounce {
                        self.temp_timer = 0;
                        self.temperature = TemperatureCondition::Normal;
                    }
                } else {
                    self.temp_timer = self.temp_timer.saturating_sub(1);
                }
            }
            TemperatureCondition::Undefined => {
                self.temp_timer = 0;
                self.temperature = TemperatureCondition::Normal;
            }
        }
    }

    fn tick_ignition(&mut self, voltage: u16) {
        self.ignition_voltage = voltage;
        let t = &self.cfg.ignition;
        match self.ignition {
            IgnitionCondition::Normal => {
                if voltage <= t.off_stop {
                    self.ign_timer += 1;
                    if self.ign_timer >= t.debounce {
                        self.ign_timer = 0;
                        self.ignition = IgnitionCondition::Off;
                    }
                } else {
                    self.ign_timer = self.ign_timer.saturating_sub(1);
                }
            }
            IgnitionCondition::Off => {
                if voltage >= t.off_return {
                    self.ign_timer += 1;
                    if self.ign_timer >= t.debounce {
                        self.ign_timer = 0;
                        self.ignition = IgnitionCondition::Normal;
                    }
                } else {
                    self.ign_timer = self.ign_timer.saturating_sub(1);
                }
            }
            IgnitionCondition::Undefined => {
                // Fast bootstrap filter resolving the power-up state.
                if voltage > t.off_stop {
                    self.ign_boot_timer += 1;
                    self.ign_timer = 0;
                    if self.ign_boot_timer >= t.bootstrap_count {
                        self.ignition = IgnitionCondition::Normal;
                    }
                } else {
                    self.ign_timer += 1;
                    self.ign_boot_timer = 0;
                    if self.ign_timer >= t.bootstrap_count {
                        self.ign_timer = 0;
                        self.ignition = IgnitionCondition::Off;
                    }
                }
            }
        }
    }

    fn tick_mcu(&mut self, vdda: u16) {
        let t = &self.cfg.mcu;
        if !self.mcu_fault {
            self.vdda_high_timer = 0;
            if vdda <= t.fault_below {
                self.vdda_low_timer += 1;
                if self.vdda_low_timer >= t.debounce {
                    self.mcu_fault = true;
                    warn!(vdda, "VDDA below operating range");
                }
            } else {
                self.vdda_low_timer = self.vdda_low_timer.saturating_sub(1);
            }
        } else {
            self.vdda_low_timer = 0;
            if vdda >= t.clear_above {
                self.vdda_high_timer += 1;
                if self.vdda_high_timer >= t.debounce {
                    self.mcu_fault = false;
                }
            } else {
                self.vdda_high_timer = self.vdda_high_timer.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwv_common::config::FusionConfig;
    use fwv_common::state::MotorDirection;

    fn monitor() -> ProtectionMonitor {
        let mut m = ProtectionMonitor::new(ProtectionConfig::default());
        // Resolve the power-up states.
        m.tick_supply(1200);
        m.tick_temperature(25);
        for _ in 0..10 {
            m.tick_ignition(1200);
        }
        m
    }

    #[test]
    fn supply_undefined_resolves_to_normal() {
        let mut m = ProtectionMonitor::new(ProtectionConfig::default());
        m.tick_supply(1200);
        assert_eq!(m.supply_condition(), SupplyCondition::Normal);
    }

    #[test]
    fn undervoltage_requires_full_debounce() {
        let mut m = monitor();
        for _ in 0..999 {
            m.tick_supply(700);
        }
        assert_eq!(m.supply_condition(), SupplyCondition::Normal);
        m.tick_supply(700);
        assert_eq!(m.supply_condition(), SupplyCondition::Undervoltage);
    }

    #[test]
    fn single_good_sample_decrements_not_resets() {
        let mut m = monitor();
        for _ in 0..999 {
            m.tick_supply(700);
        }
        // One in-band sample decrements the counter by one.
        m.tick_supply(1200);
        m.tick_supply(700);
        assert_eq!(m.supply_condition(), SupplyCondition::Normal);
        m.tick_supply(700);
        assert_eq!(m.supply_condition(), SupplyCondition::Undervoltage);
    }

    #[test]
    fn undervoltage_recovers_through_return_threshold() {
        let mut m = monitor();
        for _ in 0..1000 {
            m.tick_supply(700);
        }
        assert_eq!(m.supply_condition(), SupplyCondition::Undervoltage);
        // 8.50 V sits above the stop but below the return threshold.
        for _ in 0..2000 {
            m.tick_supply(850);
        }
        assert_eq!(m.supply_condition(), SupplyCondition::Undervoltage);
        for _ in 0..1000 {
            m.tick_supply(1000);
        }
        assert_eq!(m.supply_condition(), SupplyCondition::Normal);
    }

    #[test]
    fn overvoltage_detection_and_recovery() {
        let mut m = monitor();
        for _ in 0..1000 {
            m.tick_supply(1750);
        }
        assert_eq!(m.supply_condition(), SupplyCondition::Overvoltage);
        for _ in 0..1000 {
            m.tick_supply(1500);
        }
        assert_eq!(m.supply_condition(), SupplyCondition::Normal);
    }

    #[test]
    fn temperature_high_with_hysteresis() {
        let mut m = monitor();
        for _ in 0..100 {
            m.tick_temperature(140);
        }
        assert_eq!(m.temperature_condition(), TemperatureCondition::High);
        // 130 °C is inside the hysteresis band.
        for _ in 0..500 {
            m.tick_temperature(130);
        }
        assert_eq!(m.temperature_condition(), TemperatureCondition::High);
        for _ in 0..100 {
            m.tick_temperature(120);
        }
        assert_eq!(m.temperature_condition(), TemperatureCondition::Normal);
    }

    #[test]
    fn low_temperature_flags_without_protection_weight() {
        let mut m = monitor();
        for _ in 0..100 {
            m.tick_temperature(-10);
        }
        assert_eq!(m.temperature_condition(), TemperatureCondition::Low);
        // 5 °C is inside the hysteresis band.
        for _ in 0..500 {
            m.tick_temperature(5);
        }
        assert_eq!(m.temperature_condition(), TemperatureCondition::Low);
        for _ in 0..100 {
            m.tick_temperature(20);
        }
        assert_eq!(m.temperature_condition(), TemperatureCondition::Normal);
    }

    #[test]
    fn ignition_bootstrap_is_fast() {
        let mut m = ProtectionMonitor::new(ProtectionConfig::default());
        for _ in 0..10 {
            m.tick_ignition(1200);
        }
        assert_eq!(m.ignition_condition(), IgnitionCondition::Normal);

        let mut m = ProtectionMonitor::new(ProtectionConfig::default());
        for _ in 0..10 {
            m.tick_ignition(200);
        }
        assert_eq!(m.ignition_condition(), IgnitionCondition::Off);
    }

    #[test]
    fn ignition_off_needs_500_counts_when_running() {
        let mut m = monitor();
        for _ in 0..499 {
            m.tick_ignition(300);
        }
        assert_eq!(m.ignition_condition(), IgnitionCondition::Normal);
        m.tick_ignition(300);
        assert_eq!(m.ignition_condition(), IgnitionCondition::Off);
    }

    #[test]
    fn mcu_fault_filter_is_asymmetric() {
        let mut m = monitor();
        for _ in 0..500 {
            m.tick_mcu(295);
        }
        assert!(m.mcu_fault());
        // 3.10 V is not enough to clear.
        for _ in 0..1000 {
            m.tick_mcu(310);
        }
        assert!(m.mcu_fault());
        for _ in 0..500 {
            m.tick_mcu(325);
        }
        assert!(!m.mcu_fault());
    }

    // ── Hardware latch supervision ──

    #[derive(Default)]
    struct StubBridge {
        ov_pending: bool,
        uv_pending: bool,
        ovt_pending: bool,
        ov_rearms: u32,
        uv_rearms: u32,
        ovt_rearms: u32,
    }

    impl MotorBridge for StubBridge {
        fn start(&mut self, _direction: MotorDirection, _duty: u16) {}
        fn set_duty(&mut self, _direction: MotorDirection, _duty: u16) {}
        fn brake(&mut self) {}
        fn coast(&mut self) {}
        fn overcurrent_pending(&self) -> bool {
            false
        }
        fn vds_pending(&self) -> bool {
            false
        }
        fn overvoltage_pending(&self) -> bool {
            self.ov_pending
        }
        fn undervoltage_pending(&self) -> bool {
            self.uv_pending
        }
        fn overtemperature_pending(&self) -> bool {
            self.ovt_pending
        }
        fn rearm_overvoltage(&mut self) {
            self.ov_rearms += 1;
        }
        fn rearm_undervoltage(&mut self) {
            self.uv_rearms += 1;
        }
        fn rearm_overtemperature(&mut self) {
            self.ovt_rearms += 1;
        }
        fn rearm_drive(&mut self) {}
    }

    #[test]
    fn latch_rearms_only_inside_safe_band() {
        let mut m = monitor();
        let mut bridge = StubBridge {
            ov_pending: true,
            ..Default::default()
        };

        m.tick_supply(1750);
        m.supervise_latches(&mut bridge);
        assert!(m.hw_latch_active());
        assert_eq!(bridge.ov_rearms, 0);

        // Latch released by hardware but the reading is still high.
        bridge.ov_pending = false;
        m.tick_supply(1650);
        m.supervise_latches(&mut bridge);
        assert_eq!(bridge.ov_rearms, 0);

        m.tick_supply(1400);
        m.supervise_latches(&mut bridge);
        assert_eq!(bridge.ov_rearms, 1);
        assert!(!m.hw_latch_active());
    }

    #[test]
    fn tick_consumes_fusion_readings() {
        let fusion = SensorFusion::new(FusionConfig::default());
        let mut m = ProtectionMonitor::new(ProtectionConfig::default());
        m.tick(&fusion);
        // Seeded averages: supply 0xFF*2 = 510, far below the under stop.
        assert_eq!(m.supply_voltage(), 510);
    }
}
