//! Tick-path micro-benchmark.
//!
//! Measures throughput of the hot paths that must fit the 100 µs budget on
//! the target: the fixed-point angle pipeline, the motor fast path inside
//! the full dispatch, and the complete 100 µs tick against the simulated
//! plant (including the 1 ms application slice every tenth call).

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use fwv_common::config::ControlConfig;
use fwv_common::math::atan2_q15;
use fwv_control_unit::cycle::ControlUnit;
use fwv_control_unit::fusion::SensorFusion;
use fwv_control_unit::sim::SimPlant;

fn bench_atan2(c: &mut Criterion) {
    let mut step = 0i32;
    c.bench_function("atan2_q15", |b| {
        b.iter(|| {
            step = (step + 37) % 720;
            let theta = step as f64 * core::f64::consts::PI / 360.0;
            let x = (theta.cos() * 10_000.0) as i16;
            let y = (theta.sin() * 10_000.0) as i16;
            atan2_q15(black_box(y), black_box(x))
        });
    });
}

fn bench_angle_pipeline(c: &mut Criterion) {
    let cfg = ControlConfig::default();
    let mut plant = SimPlant::new(&cfg);
    let mut fusion = SensorFusion::new(cfg.fusion.clone());
    plant.step();

    c.bench_function("gmr_angle_pipeline", |b| {
        b.iter(|| {
            fusion.update(black_box(&plant.adc));
            black_box(fusion.angle())
        });
    });
}

fn bench_full_tick(c: &mut Criterion) {
    let cfg = ControlConfig::default();
    let mut plant = SimPlant::new(&cfg);
    let mut cu = ControlUnit::new(cfg);
    cu.boot(&mut plant.nv);

    c.bench_function("tick_100us", |b| {
        b.iter(|| {
            plant.step();
            cu.tick_100us(&plant.adc, &mut plant.bridge, &mut plant.bus, &mut plant.nv);
        });
    });
}

criterion_group!(benches, bench_atan2, bench_angle_pipeline, bench_full_tick);
criterion_main!(benches);
