//! CLI command implementations.

pub mod allocate;
pub mod check;
pub mod risk;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;

use ballast_core::types::ReturnSeries;
use ballast_engine::{
    AllocationEngine, EngineConfig, MacroSnapshot, StaticMacroProvider, StaticReturnsProvider,
};

/// Output format for results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// Pretty-printed JSON
    Json,
}

/// Serializes `value` as pretty JSON.
pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("Failed to serialize output")
}

/// Builds an engine over the series read from a file, with fixed macro
/// readings when given.
pub(crate) fn engine_over(
    config: EngineConfig,
    series: Vec<ReturnSeries>,
    macro_snapshot: Option<MacroSnapshot>,
) -> Result<AllocationEngine> {
    let provider = Arc::new(StaticReturnsProvider::with_series(
        config.sanitizer.min_periods,
        series,
    ));
    let mut builder = AllocationEngine::builder(config, provider);
    if let Some(snapshot) = macro_snapshot {
        builder = builder.macro_provider(Arc::new(StaticMacroProvider::new(snapshot)));
    }
    builder.build().context("Failed to build engine")
}
