//! `ballast`: run the allocation and risk engine from the command line.
//!
//! `allocate` computes cohort weights from a returns file, `risk` evaluates
//! realized risk and the breaker for one strategy, and `check` validates a
//! configuration file.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod commands;
mod config;
mod input;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ballast_telemetry::logging::init_logging;
use ballast_telemetry::metrics::{init_metrics, snapshot};
use commands::{allocate, check, risk};
use config::AppConfig;

/// Ballast - regime-aware capital allocation across trading strategies
#[derive(Parser)]
#[command(name = "ballast")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (YAML, TOML or JSON)
    #[arg(short, long, global = true, default_value = "ballast.yaml")]
    config: PathBuf,

    /// Dump recorded metrics to stderr before exiting
    #[arg(long, global = true)]
    print_metrics: bool,

    /// What to run
    #[command(subcommand)]
    command: Commands,
}

/// Subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Compute weights for a cohort
    Allocate(allocate::AllocateArgs),

    /// Evaluate realized risk for a strategy
    Risk(risk::RiskArgs),

    /// Validate the configuration and list environment overrides
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.config)?;
    if cli.verbose {
        config.logging = config.logging.with_level("debug");
    }
    let _guards = init_logging(&config.logging).context("Failed to initialize logging")?;
    init_metrics(&config.metrics).context("Failed to initialize metrics")?;

    match cli.command {
        Commands::Allocate(args) => allocate::run(&config, args).await?,
        Commands::Risk(args) => risk::run(&config, args).await?,
        Commands::CheckConfig => check::run(&config, &cli.config)?,
    }

    if cli.print_metrics
        && let Some(text) = snapshot()
    {
        eprintln!("{text}");
    }
    Ok(())
}
