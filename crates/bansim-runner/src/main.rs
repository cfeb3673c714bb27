//! # bansim
//!
//! CLI runner for the BAN simulator.
//!
//! This is the main entry point for running IEEE 802.15.6 body area network
//! simulations from a flat JSON or YAML configuration file.

use std::path::PathBuf;

use bansim_model::{properties::ALL_PROPERTIES, ResolvedProperties};
use bansim_runner::{
    build_simulation, create_event_loop, load_config, parse_duration, RunnerError, SimTime,
    SimulationConfig, SimulationStats,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// CLI Configuration
// ============================================================================

/// bansim - IEEE 802.15.6 Body Area Network Simulator
#[derive(Parser, Debug)]
#[command(name = "bansim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation from a JSON or YAML configuration file
    Run(RunnerConfig),
    /// List all configuration properties with descriptions and defaults
    Properties,
}

/// Configuration for running a simulation
#[derive(Parser, Debug)]
pub struct RunnerConfig {
    /// Path to the configuration file (.json for JSON, anything else is read as YAML)
    pub config: PathBuf,

    /// Simulation duration, overriding simulation_time.
    /// Accepts plain seconds or units: 60, 60s, 500ms, 10m, 1h30m
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Random seed, overriding the seed property
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Logging
// ============================================================================

/// Install the stderr subscriber. RUST_LOG wins over the configured level.
fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

// ============================================================================
// Commands
// ============================================================================

pub fn run_simulation(config: RunnerConfig) -> Result<SimulationStats, RunnerError> {
    let props: ResolvedProperties = load_config(&config.config)?;
    let mut sim_config = SimulationConfig::from_properties(&props)?;

    init_logging(&sim_config.log_level);

    if let Some(seed) = config.seed {
        sim_config.set_seed(seed);
    }
    let duration = match config.duration {
        Some(secs) => SimTime::from_secs(secs),
        None => sim_config.simulation_time,
    };

    if config.verbose {
        eprintln!(
            "Loaded configuration from {} ({} peripherals)",
            config.config.display(),
            sim_config.node_count
        );
        eprintln!("Using seed: {}", sim_config.seed);
    }

    let simulation = build_simulation(&sim_config)?;

    if config.verbose {
        eprintln!(
            "Built simulation with {} entities, running for {}",
            simulation.entities.len(),
            duration
        );
    }

    let mut event_loop = create_event_loop(simulation);
    let stats = event_loop.run(duration)?;

    if config.verbose {
        eprintln!(
            "Processed {} events in {} ms wall time",
            stats.total_events, stats.wall_time_ms
        );
    }

    Ok(stats)
}

/// Print information about all available properties
fn print_properties_info() {
    println!("bansim Configuration Properties");
    println!("===============================\n");

    println!("A configuration file is one flat mapping from property name to value,");
    println!("in JSON (.json) or YAML. Missing keys take the defaults below.");
    println!("Numeric properties also accept numeric strings.\n");

    for prop in ALL_PROPERTIES {
        println!("  {}", prop.name);
        println!("    {}", prop.description);
        print!("    Default: {}", prop.default);
        if let Some(unit) = prop.unit {
            print!(" {}", unit);
        }
        println!();
        println!();
    }

    println!("## Example\n");
    println!("```yaml");
    println!("node_count: 4");
    println!("simulation_time: 60");
    println!("use_q_learning: true");
    println!("exploration_rate: 0.2");
    println!("```");
}

fn main() -> Result<(), RunnerError> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(config) => {
            let stats = run_simulation(config)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Properties => {
            print_properties_info();
        }
    }

    Ok(())
}
