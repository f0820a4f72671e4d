//! Reading returns and macro readings from JSON files.

use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::debug;

use ballast_core::types::ReturnSeries;
use ballast_engine::MacroSnapshot;

/// Reads a JSON array of return series.
pub fn load_returns(path: &Path) -> Result<Vec<ReturnSeries>> {
    if !path.exists() {
        bail!("Returns file not found: {}", path.display());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let series: Vec<ReturnSeries> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse return series in {}", path.display()))?;
    debug!(path = %path.display(), series = series.len(), "returns loaded");
    Ok(series)
}

/// Reads a JSON macro snapshot.
pub fn load_macro(path: &Path) -> Result<MacroSnapshot> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse macro snapshot in {}", path.display()))
}
