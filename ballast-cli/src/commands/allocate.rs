//! Allocation command.
//!
//! Computes one cohort allocation from a returns file and prints the weights
//! in force afterwards.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use ballast_core::types::StrategyId;
use ballast_engine::{AllocationOutcome, CohortConfig, Scheme};

use super::{OutputFormat, engine_over, to_json};
use crate::config::AppConfig;
use crate::input::{load_macro, load_returns};

/// Arguments for the allocate command
#[derive(Parser)]
pub struct AllocateArgs {
    /// Cohort key; unconfigured keys allocate across every series in the file
    #[arg(short = 'k', long)]
    pub cohort: String,

    /// JSON file holding the member return series
    #[arg(short, long)]
    pub returns: PathBuf,

    /// JSON file holding the macro snapshot
    #[arg(long = "macro")]
    pub macro_file: Option<PathBuf>,

    /// Weighting scheme (max_sharpe, tangency, risk_parity, min_variance,
    /// black_litterman, robust, equal_weight)
    #[arg(short, long, default_value = "max_sharpe")]
    pub scheme: Scheme,

    /// Annualized volatility target, clamped to the configured band
    #[arg(long)]
    pub risk_target: Option<f64>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t)]
    pub output: OutputFormat,
}

/// Runs one allocation.
///
/// # Errors
///
/// Returns error if the inputs cannot be read or the engine fails.
pub async fn run(config: &AppConfig, args: AllocateArgs) -> Result<()> {
    let outcome = allocate(config, &args).await?;
    let rendered = match args.output {
        OutputFormat::Json => to_json(&outcome)?,
        OutputFormat::Table => render(&outcome),
    };
    println!("{rendered}");
    Ok(())
}

async fn allocate(config: &AppConfig, args: &AllocateArgs) -> Result<AllocationOutcome> {
    let series = load_returns(&args.returns)?;
    let macro_snapshot = args.macro_file.as_deref().map(load_macro).transpose()?;

    let cohort = StrategyId::from(args.cohort.as_str());
    let mut engine_config = config.engine.clone();
    if engine_config.members(&cohort).is_none() {
        let members = series.iter().map(|s| s.strategy().clone()).collect();
        info!(cohort = %cohort, "cohort not configured, using every series in the file");
        engine_config.cohorts.push(CohortConfig {
            strategy: cohort.clone(),
            members,
        });
    }

    let engine = engine_over(engine_config, series, macro_snapshot)?;
    engine
        .compute_weights(&cohort, args.scheme, args.risk_target)
        .await
        .with_context(|| format!("Allocation for {cohort} failed"))
}

fn render(outcome: &AllocationOutcome) -> String {
    let weights = outcome.weights();
    let mut out = String::new();
    let _ = writeln!(out, "outcome:  {}", outcome.label());
    if let Some(reason) = outcome.rejection() {
        let _ = writeln!(out, "reason:   {reason}");
    }
    if let AllocationOutcome::Allocated(allocation) = outcome {
        let _ = writeln!(
            out,
            "regime:   {} (cci {:.2})",
            allocation.regime.classification,
            allocation.regime.cci
        );
        if let Some(as_of) = allocation.as_of {
            let _ = writeln!(out, "as of:    {as_of}");
        }
        if allocation.stale {
            let _ = writeln!(out, "warning:  computed from cached inputs");
        }
    }
    let _ = writeln!(out, "exposure: {:.4}", weights.exposure());
    let _ = writeln!(out, "{:<20} {:>10} {:>10}", "strategy", "weight", "invested");
    for (strategy, weight) in weights.iter() {
        let invested = weights.invested(strategy).unwrap_or(0.0);
        let _ = writeln!(out, "{:<20} {weight:>10.4} {invested:>10.4}", strategy.as_str());
    }
    out.trim_end().to_string()
}
