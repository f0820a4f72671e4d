//! Configuration-related error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a configuration could not be loaded, saved or accepted.
///
/// # Examples
///
/// ```
/// use ballast_core::error::ConfigError;
///
/// let error = ConfigError::MissingField {
///     field: "members".to_string(),
///     section: Some("cohorts".to_string()),
/// };
/// assert_eq!(error.to_string(), "missing field 'members' in 'cohorts'");
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    /// A required field is absent or empty.
    #[error("missing field '{field}'{}", section.as_ref().map(|s| format!(" in '{s}'")).unwrap_or_default())]
    MissingField {
        /// Field name.
        field: String,
        /// Dotted path of the enclosing section.
        section: Option<String>,
    },

    /// A field holds a value outside its domain.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The file could not be read or written.
    #[error("cannot {operation} '{path}': {reason}")]
    Io {
        /// `read` or `write`.
        operation: String,
        /// File path.
        path: String,
        /// OS error text.
        reason: String,
    },

    /// The content is not valid YAML, TOML or JSON for the target type, or
    /// the file extension is not one of those.
    #[error("cannot parse '{origin}': {reason}")]
    Parse {
        /// File path, or a placeholder for in-memory content.
        origin: String,
        /// Parser message.
        reason: String,
    },

    /// More than one validation rule failed.
    #[error("{} configuration problems: {}", .problems.len(), join(.problems))]
    Invalid {
        /// Every failure, in the order found.
        problems: Vec<ConfigError>,
    },
}

fn join(problems: &[ConfigError]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConfigError {
    /// Returns the severity level of this error.
    #[must_use]
    pub fn severity(&self) -> super::ErrorSeverity {
        use super::ErrorSeverity;
        match self {
            Self::Io { .. } => ErrorSeverity::Warning,
            Self::MissingField { .. }
            | Self::InvalidValue { .. }
            | Self::Parse { .. }
            | Self::Invalid { .. } => ErrorSeverity::Fatal,
        }
    }

    /// Creates a missing field error without a section.
    #[must_use]
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
            section: None,
        }
    }

    /// Creates an invalid value error.
    #[must_use]
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates an I/O error for `path`.
    #[must_use]
    pub fn io(operation: &str, path: impl Into<String>, error: &std::io::Error) -> Self {
        Self::Io {
            operation: operation.to_string(),
            path: path.into(),
            reason: error.to_string(),
        }
    }

    /// Folds validation failures into one error. `None` when there are none.
    #[must_use]
    pub fn from_problems(mut problems: Vec<ConfigError>) -> Option<Self> {
        match problems.len() {
            0 => None,
            1 => problems.pop(),
            _ => Some(Self::Invalid { problems }),
        }
    }

    /// The individual failures behind this error.
    #[must_use]
    pub fn problems(&self) -> &[ConfigError] {
        match self {
            Self::Invalid { problems } => problems,
            other => std::slice::from_ref(other),
        }
    }
}
