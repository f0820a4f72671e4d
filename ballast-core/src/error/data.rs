//! Data-related error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or validating return and macro series.
///
/// # Examples
///
/// ```
/// use ballast_core::error::DataError;
///
/// let error = DataError::InsufficientData { available: 3, required: 4 };
/// assert!(error.to_string().contains("3"));
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataError {
    /// Fewer periods than the minimum needed for estimation.
    #[error("only {available} periods available, {required} required")]
    InsufficientData {
        /// Periods available for the cohort.
        available: usize,
        /// Minimum periods required.
        required: usize,
    },

    /// A series contains the same period twice.
    #[error("series '{strategy}' has {date} twice")]
    DuplicatePeriod {
        /// Strategy owning the series.
        strategy: String,
        /// Offending period-end date.
        date: String,
    },

    /// A series is not in chronological order.
    #[error("series '{strategy}' goes back in time at {date}")]
    OutOfOrder {
        /// Strategy owning the series.
        strategy: String,
        /// First out-of-order date.
        date: String,
    },

    /// A value is NaN or infinite.
    #[error("non-finite value in '{field}'")]
    NonFinite {
        /// Field or series holding the value.
        field: String,
    },

    /// Empty data where non-empty was expected.
    #[error("no data: {description}")]
    EmptyData {
        /// Description of what data was expected.
        description: String,
    },

    /// Two inputs that must agree in shape do not.
    #[error("shape mismatch: {reason}")]
    DimensionMismatch {
        /// What did not line up.
        reason: String,
    },

    /// Failed to parse data.
    #[error("cannot parse '{field}': {reason}")]
    ParseFailed {
        /// Field that failed to parse.
        field: String,
        /// Reason for the parse failure.
        reason: String,
    },
}

impl DataError {
    /// Returns the severity level of this error.
    #[must_use]
    pub fn severity(&self) -> super::ErrorSeverity {
        use super::ErrorSeverity;
        match self {
            Self::InsufficientData { .. } | Self::EmptyData { .. } => ErrorSeverity::Recoverable,
            Self::NonFinite { .. } | Self::DimensionMismatch { .. } => ErrorSeverity::Warning,
            Self::DuplicatePeriod { .. } | Self::OutOfOrder { .. } | Self::ParseFailed { .. } => {
                ErrorSeverity::Fatal
            }
        }
    }

    /// Returns true if callers should degrade to equal weighting.
    #[must_use]
    pub const fn is_insufficient(&self) -> bool {
        matches!(
            self,
            Self::InsufficientData { .. } | Self::EmptyData { .. }
        )
    }

    /// Creates a parse error for a specific field.
    #[must_use]
    pub fn parse_failed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ParseFailed {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorSeverity;

    #[test]
    fn test_insufficient_is_recoverable() {
        let err = DataError::InsufficientData {
            available: 2,
            required: 4,
        };
        assert!(err.is_insufficient());
        assert_eq!(err.severity(), ErrorSeverity::Recoverable);
    }

    #[test]
    fn test_ordering_errors_are_fatal() {
        let err = DataError::OutOfOrder {
            strategy: "carry".to_string(),
            date: "2024-02-02".to_string(),
        };
        assert!(!err.is_insufficient());
        assert!(err.severity().is_fatal());
    }
}
