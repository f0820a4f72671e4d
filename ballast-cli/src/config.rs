//! Application configuration: the engine plus its telemetry.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use ballast_core::config::{Configurable, ConfigLoader, Validatable, ValidationContext};
use ballast_engine::EngineConfig;
use ballast_telemetry::logging::LogConfig;
use ballast_telemetry::metrics::MetricsConfig;

/// Prefix of the environment overrides read by the binary.
pub const ENV_PREFIX: &str = "BALLAST";

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LogConfig,
    /// Metrics.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Validatable for AppConfig {
    fn validate_with_context(&self, ctx: &mut ValidationContext) {
        ctx.enter("engine");
        self.engine.validate_with_context(ctx);
        ctx.exit();
    }
}

impl Configurable for AppConfig {
    fn apply_env_overrides(&mut self, prefix: &str) {
        self.engine.apply_env_overrides(prefix);
        if let Ok(level) = std::env::var(format!("{prefix}_LOG_LEVEL")) {
            self.logging.level = level;
        }
    }

    fn env_var_names(prefix: &str) -> Vec<String> {
        let mut names = EngineConfig::env_var_names(prefix);
        names.push(format!("{prefix}_LOG_LEVEL"));
        names
    }
}

impl AppConfig {
    /// Loads `path`, or the defaults when it does not exist. Environment
    /// overrides and validation apply either way.
    pub fn load(path: &Path) -> Result<Self> {
        let loader = ConfigLoader::new().with_env_prefix(ENV_PREFIX);
        if path.exists() {
            return loader
                .load(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()));
        }

        debug!(path = %path.display(), "configuration file not found, using defaults");
        let mut config = Self::default();
        loader
            .finish(&mut config)
            .context("Default configuration rejected")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.yaml")).unwrap();
        assert!(config.engine.cohorts.is_empty());
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_loads_yaml_sections() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "engine:\n  cohorts:\n    - strategy: book\n      members: [a, b]\nlogging:\n  level: warn\n"
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.engine.cohorts.len(), 1);
        assert_eq!(config.engine.cohorts[0].members.len(), 2);
    }

    #[test]
    fn test_invalid_engine_section_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "engine:\n  cohorts:\n    - strategy: book\n      members: []\n"
        )
        .unwrap();

        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_env_var_names_include_log_level() {
        let names = AppConfig::env_var_names(ENV_PREFIX);
        assert!(names.contains(&"BALLAST_LOG_LEVEL".to_string()));
        assert!(names.contains(&"BALLAST_IO_FETCH_TIMEOUT_MS".to_string()));
    }
}
