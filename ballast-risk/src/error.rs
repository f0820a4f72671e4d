//! Risk module error types.

use ballast_core::error::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from risk analytics and rule management.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskError {
    /// Not enough realized returns in the window.
    #[error("insufficient history for {strategy}: {available} periods, {required} required")]
    InsufficientHistory {
        /// Strategy being evaluated.
        strategy: String,
        /// Periods available up to the evaluation date.
        available: usize,
        /// Minimum periods required.
        required: usize,
    },

    /// A rule with this id is already registered.
    #[error("rule {id} already exists")]
    DuplicateRule {
        /// Rule identifier.
        id: String,
    },

    /// No rule with this id is registered.
    #[error("unknown rule {id}")]
    UnknownRule {
        /// Rule identifier.
        id: String,
    },

    /// Operator text that is not one of `<`, `>`, `<=`, `>=`.
    #[error("unknown comparison operator '{operator}'")]
    UnknownOperator {
        /// Offending text.
        operator: String,
    },

    /// Metric name outside the supported catalog.
    #[error("unknown risk metric '{name}'")]
    UnknownMetric {
        /// Offending name.
        name: String,
    },

    /// A rule threshold is NaN or infinite.
    #[error("rule threshold must be finite, got {threshold}")]
    InvalidThreshold {
        /// Offending threshold.
        threshold: f64,
    },
}

impl RiskError {
    /// Returns true if the error is due to missing data rather than misuse.
    #[must_use]
    pub const fn is_insufficient_history(&self) -> bool {
        matches!(self, Self::InsufficientHistory { .. })
    }
}

/// Errors from circuit breaker transitions.
///
/// A transition that returns an error has not taken effect.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerError {
    /// Reset requested for a breaker that is not tripped.
    #[error("breaker for {strategy} is not tripped")]
    NotTripped {
        /// Strategy key.
        strategy: String,
    },

    /// Reset requested before the cool-down elapsed.
    #[error("breaker for {strategy} is cooling down, {remaining_secs}s remaining")]
    CooldownActive {
        /// Strategy key.
        strategy: String,
        /// Seconds until reset is allowed.
        remaining_secs: u64,
    },

    /// Neither the journal nor the local spool accepted the transition.
    #[error("transition for {strategy} could not be recorded durably: {reason}")]
    NotDurable {
        /// Strategy key.
        strategy: String,
        /// Last failure seen.
        reason: String,
    },

    /// Journal or spool failure outside a transition (flush, restore).
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl BreakerError {
    /// Returns true if the caller can retry later and expect success.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(
            self,
            Self::CooldownActive { .. } | Self::NotDurable { .. } | Self::Storage(_)
        )
    }
}
