//! Sensor fusion: averaged ADC channels and the GMR angle pipeline.
//!
//! Nine raw channels run through 8-sample moving averages refreshed once per
//! 100 µs conversion cycle. The four GMR channels form a differential
//! sine/cosine pair that feeds the fixed-point atan2 and an 8-octant
//! piecewise-linear remap to tenths of a degree; the persisted zero-point
//! offset is applied last. Converted supply / temperature / current /
//! ignition readings for the protection monitor come from the same averages.
//!
//! Deterministic and branch-bounded: same raw inputs, same outputs; the only
//! state is the averaging windows and the zero-point offset.

use fwv_common::angle::{self, FULL_TURN};
use fwv_common::config::FusionConfig;
use fwv_common::hal::AnalogInputs;
use fwv_common::math::atan2_q15;

/// Window length of every channel filter.
const AVG_WINDOW: usize = 8;

/// Integer sliding-window moving average.
#[derive(Debug, Clone, Copy)]
struct MovingAverage {
    window: [u16; AVG_WINDOW],
    index: usize,
    sum: u32,
}

impl MovingAverage {
    /// Pre-fill the window so conversions are sane before real samples land.
    const fn seeded(seed: u16) -> Self {
        Self {
            window: [seed; AVG_WINDOW],
            index: 0,
            sum: seed as u32 * AVG_WINDOW as u32,
        }
    }

    #[inline]
    fn push(&mut self, sample: u16) {
        self.sum -= self.window[self.index] as u32;
        self.window[self.index] = sample;
        self.sum += sample as u32;
        self.index = (self.index + 1) % AVG_WINDOW;
    }

    #[inline]
    fn value(&self) -> u16 {
        (self.sum / AVG_WINDOW as u32) as u16
    }
}

/// Owner of the averaging windows and the calibrated zero-point.
#[derive(Debug, Clone)]
pub struct SensorFusion {
    cfg: FusionConfig,
    supply: MovingAverage,
    temperature: MovingAverage,
    current: MovingAverage,
    vdda: MovingAverage,
    ignition: MovingAverage,
    gmr_neg_cosine: MovingAverage,
    gmr_neg_sine: MovingAverage,
    gmr_pos_cosine: MovingAverage,
    gmr_pos_sine: MovingAverage,
    sensor_offset: i16,
}

impl SensorFusion {
    pub fn new(cfg: FusionConfig) -> Self {
        let supply = MovingAverage::seeded(cfg.supply_seed);
        let temperature = MovingAverage::seeded(cfg.temperature_seed);
        let sensor_offset = cfg.default_sensor_offset;
        Self {
            cfg,
            supply,
            temperature,
            current: MovingAverage::seeded(0),
            vdda: MovingAverage::seeded(0),
            ignition: MovingAverage::seeded(0),
            gmr_neg_cosine: MovingAverage::seeded(0),
            gmr_neg_sine: MovingAverage::seeded(0),
            gmr_pos_cosine: MovingAverage::seeded(0),
            gmr_pos_sine: MovingAverage::seeded(0),
            sensor_offset,
        }
    }

    /// Feed one conversion cycle into every channel filter.
    pub fn update(&mut self, adc: &impl AnalogInputs) {
        self.supply.push(adc.raw_supply());
        self.temperature.push(adc.raw_temperature());
        self.current.push(adc.raw_current());
        self.vdda.push(adc.raw_vdda());
        self.ignition.push(adc.raw_ignition());
        self.gmr_neg_cosine.push(adc.raw_gmr_neg_cosine());
        self.gmr_neg_sine.push(adc.raw_gmr_neg_sine());
        self.gmr_pos_cosine.push(adc.raw_gmr_pos_cosine());
        self.gmr_pos_sine.push(adc.raw_gmr_pos_sine());
    }

    // ─── GMR pipeline ───────────────────────────────────────────────

    /// Differential sine output, offset-corrected and clamped.
    pub fn sine(&self) -> i16 {
        let pos = self.gmr_pos_sine.value() as i32;
        let neg = self.gmr_neg_sine.value() as i32;
        let raw = pos - neg - self.cfg.sine_offset as i32;
        raw.clamp(-(self.cfg.swing_max as i32), self.cfg.swing_max as i32) as i16
    }

    /// Differential cosine output, offset-corrected and clamped.
    pub fn cosine(&self) -> i16 {
        let pos = self.gmr_pos_cosine.value() as i32;
        let neg = self.gmr_neg_cosine.value() as i32;
        let raw = pos - neg - self.cfg.cosine_offset as i32;
        raw.clamp(-(self.cfg.swing_max as i32), self.cfg.swing_max as i32) as i16
    }

    /// Calibrated shaft angle in tenths of a degree, `[0, 3600)`.
    pub fn angle(&self) -> i16 {
        let fraction = atan2_q15(self.cosine(), self.sine());
        let mapped = octant_remap(fraction);
        angle::wrap(mapped + self.sensor_offset)
    }

    #[inline]
    pub fn sensor_offset(&self) -> i16 {
        self.sensor_offset
    }

    /// Replace the persisted zero-point. Calibration is the only writer.
    #[inline]
    pub fn set_sensor_offset(&mut self, offset: i16) {
        self.sensor_offset = offset;
    }

    // ─── Converted readings ─────────────────────────────────────────

    /// Supply voltage [10 mV].
    pub fn supply_voltage(&self) -> u16 {
        self.supply.value().saturating_mul(2)
    }

    /// VDDA rail voltage [10 mV].
    pub fn vdda_voltage(&self) -> u16 {
        ((self.vdda.value() as u32 * 660) / 1024) as u16
    }

    /// Chip temperature [°C], floored at the sensor's −40 °C limit.
    pub fn temperature(&self) -> i16 {
        let raw = self.temperature.value() as i32;
        (((raw - 608) / 4) + 25).max(-40) as i16
    }

    /// Motor shunt current [mA].
    pub fn motor_current(&self) -> u16 {
        self.current.value().saturating_mul(4)
    }

    /// Ignition input voltage [10 mV], via the calibration interpolation map.
    pub fn ignition_voltage(&self) -> u16 {
        let raw = self.ignition.value();
        let map = &self.cfg.ignition_map;
        let first = map[0];
        let last = map[map.len() - 1];
        if raw < first.0 {
            return 0;
        }
        if raw > last.0 {
            return last.1;
        }
        let mut segment = 0;
        while segment < map.len() - 2 && raw > map[segment + 1].0 {
            segment += 1;
        }
        let (x0, y0) = map[segment];
        let (x1, y1) = map[segment + 1];
        interpolate(raw, x0, x1, y0, y1)
    }
}

/// Forward linear interpolation between two calibration points.
fn interpolate(x: u16, x0: u16, x1: u16, y0: u16, y1: u16) -> u16 {
    if x1 == x0 {
        return y0;
    }
    let span = (y1 as i32 - y0 as i32) * (x as i32 - x0 as i32);
    (y0 as i32 + span / (x1 as i32 - x0 as i32)) as u16
}

/// Map a Q16 turn fraction onto tenths of a degree through eight 45° pieces.
fn octant_remap(fraction: u16) -> i16 {
    let (residual, base) = match fraction {
        0x0000..=0x1FFF => (fraction, 0),
        0x2000..=0x3FFF => (fraction - 0x2000, 450),
        0x4000..=0x5FFF => (fraction - 0x4000, 900),
        0x6000..=0x7FFF => (fraction - 0x6000, 1350),
        0x8000..=0x9FFF => (fraction - 0x8000, 1800),
        0xA000..=0xBFFF => (fraction - 0xA000, 2250),
        0xC000..=0xDFFF => (fraction - 0xC000, 2700),
        _ => (fraction - 0xE000, 3150),
    };
    let residual = (residual >> 6) as u32;
    let mut mapped = ((450 * residual) >> 7) as i16 + base;
    if mapped >= FULL_TURN {
        mapped -= FULL_TURN;
    }
    mapped
}
