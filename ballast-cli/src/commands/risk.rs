//! Risk command.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::Parser;
use serde::Serialize;

use ballast_core::types::StrategyId;
use ballast_risk::{BreakerStatus, RiskSnapshot};

use super::{OutputFormat, engine_over, to_json};
use crate::config::AppConfig;
use crate::input::load_returns;

/// Arguments for the risk command
#[derive(Parser)]
pub struct RiskArgs {
    /// Strategy to evaluate
    #[arg(short = 'k', long)]
    pub strategy: String,

    /// Evaluation date (YYYY-MM-DD); defaults to the last period in the file
    #[arg(short, long)]
    pub date: Option<NaiveDate>,

    /// JSON file holding the return series
    #[arg(short, long)]
    pub returns: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t)]
    pub output: OutputFormat,
}

/// Snapshot plus the breaker status it left behind.
#[derive(Debug, Serialize)]
struct RiskReport {
    snapshot: RiskSnapshot,
    breaker: BreakerStatus,
}

/// Evaluates one strategy.
///
/// # Errors
///
/// Returns error if the returns cannot be read or the snapshot fails.
pub async fn run(config: &AppConfig, args: RiskArgs) -> Result<()> {
    let report = evaluate(config, &args).await?;
    let rendered = match args.output {
        OutputFormat::Json => to_json(&report)?,
        OutputFormat::Table => render(&report),
    };
    println!("{rendered}");
    Ok(())
}

async fn evaluate(config: &AppConfig, args: &RiskArgs) -> Result<RiskReport> {
    let series = load_returns(&args.returns)?;
    let strategy = StrategyId::from(args.strategy.as_str());
    let Some(own) = series.iter().find(|s| s.strategy() == &strategy) else {
        bail!("No series for {strategy} in {}", args.returns.display());
    };
    let date = match args.date.or_else(|| own.last_date()) {
        Some(date) => date,
        None => bail!("Series for {strategy} is empty"),
    };

    let engine = engine_over(config.engine.clone(), series, None)?;
    let snapshot = engine
        .evaluate_risk(&strategy, date)
        .await
        .with_context(|| format!("Risk evaluation for {strategy} failed"))?;
    let breaker = engine.breaker_status(&strategy);
    Ok(RiskReport { snapshot, breaker })
}

fn render(report: &RiskReport) -> String {
    let s = &report.snapshot;
    let mut out = String::new();
    let _ = writeln!(out, "strategy:     {} as of {} ({} periods)", s.strategy, s.date, s.observations);
    let _ = writeln!(out, "VaR 95/99:    {:.4} / {:.4}", s.var95, s.var99);
    let _ = writeln!(out, "CVaR 95/99:   {:.4} / {:.4}", s.cvar95, s.cvar99);
    let _ = writeln!(out, "max drawdown: {:.4}", s.max_drawdown);
    let _ = writeln!(out, "volatility:   {:.4}", s.volatility);
    let _ = writeln!(out, "sharpe:       {:.3}", s.sharpe);
    let _ = writeln!(out, "sortino:      {:.3}", s.sortino);
    let _ = writeln!(out, "beta/alpha:   {:.3} / {:.4}", s.beta, s.alpha);
    match &report.breaker {
        BreakerStatus::Ok => {
            let _ = writeln!(out, "breaker:      ok");
        }
        BreakerStatus::Tripped { cause, since } => {
            let _ = writeln!(out, "breaker:      TRIPPED at {since}: {cause}");
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn returns_file(values: &[f64]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let points: Vec<serde_json::Value> = values
            .iter()
            .zip(start.iter_days())
            .map(|(v, date)| serde_json::json!({"date": date, "value": v}))
            .collect();
        let body = serde_json::json!([{"strategy": "carry", "points": points}]);
        write!(file, "{body}").unwrap();
        file
    }

    fn args(file: &tempfile::NamedTempFile) -> RiskArgs {
        RiskArgs {
            strategy: "carry".to_string(),
            date: None,
            returns: file.path().to_path_buf(),
            output: OutputFormat::Table,
        }
    }

    #[tokio::test]
    async fn test_defaults_to_last_period() {
        let file = returns_file(&[0.01, -0.02, 0.015, 0.005, -0.01]);
        let report = evaluate(&AppConfig::default(), &args(&file)).await.unwrap();

        assert_eq!(report.snapshot.date, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(report.snapshot.observations, 5);
        assert_eq!(report.breaker, BreakerStatus::Ok);
    }

    #[tokio::test]
    async fn test_deep_drawdown_trips_breaker() {
        let file = returns_file(&[0.01, -0.2, -0.25, 0.01]);
        let report = evaluate(&AppConfig::default(), &args(&file)).await.unwrap();

        assert!(report.breaker.is_tripped());
        assert!(render(&report).contains("TRIPPED"));
    }

    #[tokio::test]
    async fn test_unknown_strategy_fails() {
        let file = returns_file(&[0.01, 0.02]);
        let mut args = args(&file);
        args.strategy = "momentum".to_string();
        let err = evaluate(&AppConfig::default(), &args).await.unwrap_err();
        assert!(err.to_string().contains("No series"));
    }
}
