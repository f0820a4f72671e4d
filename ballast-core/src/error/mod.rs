//! Shared error types.
//!
//! `DataError` covers malformed return and macro series, `ConfigError`
//! covers loading and validating settings and `StorageError` covers the
//! persistence boundary. `ballast-risk` and `ballast-engine` wrap these in
//! their own error enums with `#[from]`, so there is no umbrella type here.

use serde::{Deserialize, Serialize};
use std::fmt;

mod config;
mod data;
mod storage;

pub use config::ConfigError;
pub use data::DataError;
pub use storage::StorageError;

/// How bad an error is for the caller that received it.
///
/// # Examples
///
/// ```
/// use ballast_core::error::ErrorSeverity;
///
/// assert!(ErrorSeverity::Warning.is_recoverable());
/// assert!(ErrorSeverity::Fatal.is_fatal());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// The run cannot continue.
    Fatal,

    /// This run failed; the next one may succeed.
    #[default]
    Recoverable,

    /// A degraded result was produced.
    Warning,

    /// Nothing failed.
    Info,
}

impl ErrorSeverity {
    /// Anything short of fatal.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }

    /// Whether the run must stop.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal)
    }

    /// Lowercase label used as a metric tag.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Recoverable => "recoverable",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_label() {
        assert_eq!(ErrorSeverity::Fatal.to_string(), "fatal");
        assert_eq!(ErrorSeverity::Warning.label(), "warning");
    }

    #[test]
    fn test_short_series_is_recoverable() {
        let err = DataError::InsufficientData {
            available: 3,
            required: 4,
        };
        assert!(err.severity().is_recoverable());
    }

    #[test]
    fn test_missing_field_is_fatal() {
        assert!(ConfigError::missing_field("cohorts").severity().is_fatal());
    }
}
