//! # FWV Control Unit
//!
//! Host-side simulation runner for the valve actuator control core.
//!
//! Drives the full control unit against the simulated plant at the nominal
//! 100 µs tick rate and prints a summary of the final state. Scenarios cover
//! the commanded move, the end-stop calibration pass, the forced diagnostic
//! cycle and an undervoltage excursion.

use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use fwv_common::config::ControlConfig;
use fwv_common::hal::MODE_A;
use fwv_control_unit::config::load_config;
use fwv_control_unit::cycle::ControlUnit;
use fwv_control_unit::sim::SimPlant;

/// Bus cycle period [100 µs ticks]: one request/response edge per 100 ms.
const BUS_PERIOD: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Command a move from mode B to mode A.
    Move,
    /// Run a full end-stop calibration pass.
    Calibrate,
    /// Force the production diagnostic cycle.
    DiagRun,
    /// Hold the supply below the undervoltage stop, then restore it.
    Undervoltage,
}

/// FWV Control Unit — valve actuator control core simulation
#[derive(Parser, Debug)]
#[command(name = "fwv_control_unit")]
#[command(version)]
#[command(about = "Simulated valve actuator control core")]
struct Args {
    /// Scenario to run.
    #[arg(value_enum)]
    scenario: Scenario,

    /// Number of 100 µs ticks to simulate.
    #[arg(long, default_value_t = 500_000)]
    ticks: u64,

    /// Optional TOML configuration overriding the tuned defaults.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    info!("FWV Control Unit v{} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&args) {
        error!("FATAL: {e}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = match &args.config {
        Some(path) => load_config(path)?,
        None => ControlConfig::default(),
    };

    let mut plant = SimPlant::new(&cfg);
    let mut cu = ControlUnit::new(cfg);
    cu.boot(&mut plant.nv);

    match args.scenario {
        Scenario::Move => {
            // Let the boot settle resolve, then command the far mode.
            advance(&mut cu, &mut plant, 20_000);
            plant.bus.move_enable = true;
            plant.bus.target_mode = MODE_A;
            info!("commanding mode A");
            advance(&mut cu, &mut plant, args.ticks.saturating_sub(20_000));
        }
        Scenario::Calibrate => {
            plant.bus.initial_request = true;
            info!("full calibration requested");
            advance(&mut cu, &mut plant, args.ticks);
            info!(
                mode_a = cu.mode_angles()[0],
                mode_b = cu.mode_angles()[1],
                offset = cu.sensor_offset(),
                "calibration result"
            );
        }
        Scenario::DiagRun => {
            plant.bus.forced_diag = true;
            info!("forced diagnostic asserted");
            advance(&mut cu, &mut plant, args.ticks);
        }
        Scenario::Undervoltage => {
            let third = args.ticks / 3;
            advance(&mut cu, &mut plant, third);
            plant.set_supply(700);
            info!("supply dropped to 7.00 V");
            advance(&mut cu, &mut plant, third);
            info!(condition = ?cu.protection().supply_condition(), "after excursion");
            plant.set_supply(1200);
            info!("supply restored to 12.00 V");
            advance(&mut cu, &mut plant, third);
        }
    }

    let stats = cu.stats();
    info!(
        valve = ?cu.valve_state(),
        motor = ?cu.motor_state(),
        angle = cu.current_angle(),
        mode = cu.valve_mode(),
        supply = cu.supply_voltage(),
        temperature = cu.temperature(),
        event = ?cu.latest_event().cause,
        "final state"
    );
    info!(
        ticks = stats.tick_count,
        avg_ns = stats.avg_ns(),
        max_ns = stats.max_ns,
        "tick statistics"
    );
    Ok(())
}

/// Run the plant and the control unit for `ticks` 100 µs steps, with a bus
/// request/response edge every bus cycle to keep communication live.
fn advance(cu: &mut ControlUnit, plant: &mut SimPlant, ticks: u64) {
    for _ in 0..ticks {
        if cu.tick_count() % BUS_PERIOD == 0 {
            cu.on_bus_request_received();
            cu.on_bus_response_transmitted();
        }
        plant.step();
        cu.tick_100us(&plant.adc, &mut plant.bridge, &mut plant.bus, &mut plant.nv);
    }
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
