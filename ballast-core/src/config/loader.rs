//! Reading engine settings from YAML, TOML or JSON files.
//!
//! The file extension picks the parser. [`ConfigLoader::load`] parses, then
//! lets `BALLAST_*` environment variables override individual fields, then
//! validates the result.

use super::traits::{Configurable, Validatable};
use crate::error::ConfigError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::debug;

/// File syntax, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    /// `.yaml` or `.yml`
    #[default]
    Yaml,
    /// `.toml`
    Toml,
    /// `.json`
    Json,
}

impl ConfigFormat {
    /// `None` for an unknown or missing extension. Case is ignored.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("yml") {
            return Some(Self::Yaml);
        }
        [Self::Yaml, Self::Toml, Self::Json]
            .into_iter()
            .find(|f| ext.eq_ignore_ascii_case(f.extension()))
    }

    /// Canonical extension, without the dot.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Toml => "toml",
            Self::Json => "json",
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Yaml => "YAML",
            Self::Toml => "TOML",
            Self::Json => "JSON",
        }
    }

    fn of(path: &Path) -> Result<Self, ConfigError> {
        Self::from_path(path).ok_or_else(|| ConfigError::Parse {
            origin: path.display().to_string(),
            reason: "unrecognized extension, expected .yaml, .yml, .toml or .json".to_string(),
        })
    }
}

/// Turns a settings file into a typed, validated configuration.
///
/// ```rust,ignore
/// let config: EngineConfig = ConfigLoader::new()
///     .with_env_prefix("BALLAST")
///     .load("ballast.yaml")?;
/// ```
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    env_prefix: Option<String>,
    validate: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// No environment overrides; validation on.
    #[must_use]
    pub fn new() -> Self {
        Self {
            env_prefix: None,
            validate: true,
        }
    }

    /// Reads overrides from variables named `{prefix}_{SECTION}_{FIELD}`.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Turns validation off or back on.
    #[must_use]
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Override prefix, if any.
    #[must_use]
    pub fn env_prefix(&self) -> Option<&str> {
        self.env_prefix.as_deref()
    }

    /// Parses `path`, applies overrides and validates.
    pub fn load<T, P>(&self, path: P) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Configurable + Validatable,
        P: AsRef<Path>,
    {
        let mut config: T = self.load_file(path)?;
        self.finish(&mut config)?;
        Ok(config)
    }

    /// The override and validation half of [`ConfigLoader::load`], for
    /// configurations built in code.
    pub fn finish<T>(&self, config: &mut T) -> Result<(), ConfigError>
    where
        T: Configurable + Validatable,
    {
        if let Some(prefix) = &self.env_prefix {
            debug!(prefix = %prefix, "applying environment overrides");
            config.apply_env_overrides(prefix);
        }
        if self.validate {
            config.validate()?;
        }
        Ok(())
    }

    /// Parses `path` without overrides or validation.
    pub fn load_file<T, P>(&self, path: P) -> Result<T, ConfigError>
    where
        T: DeserializeOwned,
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let format = ConfigFormat::of(path)?;
        let origin = path.display().to_string();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::io("read", origin.as_str(), &e))?;
        self.parse(&content, format, &origin)
    }

    /// Parses in-memory content.
    pub fn load_str<T>(&self, content: &str, format: ConfigFormat) -> Result<T, ConfigError>
    where
        T: DeserializeOwned,
    {
        self.parse(content, format, "<string>")
    }

    #[allow(clippy::unused_self)]
    fn parse<T>(&self, content: &str, format: ConfigFormat, origin: &str) -> Result<T, ConfigError>
    where
        T: DeserializeOwned,
    {
        let parsed = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| e.to_string()),
            ConfigFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        };
        parsed.map_err(|e| ConfigError::Parse {
            origin: origin.to_string(),
            reason: format!("{} parse error: {e}", format.label()),
        })
    }

    /// Renders `config` in `format`.
    pub fn serialize<T: Serialize>(config: &T, format: ConfigFormat) -> Result<String, ConfigError> {
        let rendered = match format {
            ConfigFormat::Yaml => serde_yaml::to_string(config).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::to_string_pretty(config).map_err(|e| e.to_string()),
            ConfigFormat::Json => serde_json::to_string_pretty(config).map_err(|e| e.to_string()),
        };
        rendered.map_err(|e| ConfigError::Parse {
            origin: "<serialize>".to_string(),
            reason: format!("{} serialization error: {e}", format.label()),
        })
    }

    /// Writes `config` to `path` in the format its extension names.
    pub fn save_file<T: Serialize, P: AsRef<Path>>(config: &T, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = Self::serialize(config, ConfigFormat::of(path)?)?;
        std::fs::write(path, content)
            .map_err(|e| ConfigError::io("write", path.display().to_string(), &e))
    }
}
