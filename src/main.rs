use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use run_gate::config::{self, GateConfig};
use run_gate::log::parse_log_level;
use run_gate::simulate::{load_scenario, simulate};

#[derive(Parser)]
#[command(name = "run-gate", about = "Dependency and concurrency gate for workflow runs")]
struct Cli {
    /// Path to config file
    #[arg(long, default_value = "run-gate.toml")]
    config: PathBuf,

    /// Log verbosity level (error, warn, info, debug); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the config file and print the effective settings
    CheckConfig,
    /// Replay a scenario against an in-memory store and print final statuses as JSON
    Simulate {
        /// Scenario file (TOML)
        scenario: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let level_name = cli.log_level.as_deref().unwrap_or(&config.log.level);
    match parse_log_level(level_name) {
        Ok(level) => run_gate::log::init(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let result = match cli.command {
        Commands::CheckConfig => handle_check_config(&cli.config, &config),
        Commands::Simulate { scenario } => handle_simulate(&scenario, &config).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn handle_check_config(path: &Path, config: &GateConfig) -> Result<(), String> {
    if path.exists() {
        println!("{}: ok", path.display());
    } else {
        println!("{}: not found, using defaults", path.display());
    }
    println!(
        "queue: batch_length={} workers={} retry_delay_ms={}",
        config.queue.batch_length, config.queue.workers, config.queue.retry_delay_ms
    );
    println!(
        "coordinator: channel_capacity={}",
        config.coordinator.channel_capacity
    );
    println!("limits: max_name_len={}", config.limits.max_name_len);
    println!("log: level={}", config.log.level);
    Ok(())
}

async fn handle_simulate(path: &Path, config: &GateConfig) -> Result<(), String> {
    let scenario = load_scenario(path).map_err(|e| e.to_string())?;
    let report = simulate(&scenario, config)
        .await
        .map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| format!("Failed to serialize report: {}", e))?;
    println!("{}", json);
    Ok(())
}
