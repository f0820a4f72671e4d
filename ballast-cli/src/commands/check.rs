//! Configuration check command.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use tracing::info;

use ballast_core::config::Configurable;

use crate::config::{AppConfig, ENV_PREFIX};

/// Prints the effective configuration and the environment variables that can
/// override it. Loading already validated it.
///
/// # Errors
///
/// Returns error if the configuration cannot be serialized.
pub fn run(config: &AppConfig, path: &Path) -> Result<()> {
    info!(path = %path.display(), cohorts = config.engine.cohorts.len(), "configuration valid");
    println!("{}", summary(config)?);
    Ok(())
}

fn summary(config: &AppConfig) -> Result<String> {
    let mut out = serde_yaml::to_string(config)?;
    out.push_str("\n# environment overrides\n");
    for name in AppConfig::env_var_names(ENV_PREFIX) {
        let marker = if std::env::var_os(&name).is_some() { "set" } else { "-" };
        let _ = writeln!(out, "# {name} [{marker}]");
    }
    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_lists_overrides() {
        let text = summary(&AppConfig::default()).unwrap();
        assert!(text.contains("engine:"));
        assert!(text.contains("BALLAST_IO_FETCH_TIMEOUT_MS"));
    }
}
