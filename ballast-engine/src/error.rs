//! Engine error types.
//!
//! Estimation problems and breaker halts do not surface here: `compute_weights`
//! turns them into a rejected outcome carrying fallback weights. These errors
//! are for misuse and for failures with no degraded path.

use ballast_core::error::{ConfigError, DataError, ErrorSeverity, StorageError};
use ballast_risk::{BreakerError, RiskError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures of an external collaborator (returns or macro provider).
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProviderError {
    /// The provider has fewer periods than required.
    #[error("insufficient data for {strategy}: {available} periods, {required} required")]
    InsufficientData {
        /// Strategy requested.
        strategy: String,
        /// Periods the provider holds.
        available: usize,
        /// Periods requested.
        required: usize,
    },

    /// Unknown series.
    #[error("no series for {strategy}")]
    NotFound {
        /// Strategy requested.
        strategy: String,
    },

    /// The provider could not be reached.
    #[error("{collaborator} unavailable: {reason}")]
    Unavailable {
        /// Provider name.
        collaborator: String,
        /// Reported reason.
        reason: String,
    },

    /// The call exceeded its bound.
    #[error("{collaborator} timed out after {timeout_ms}ms")]
    Timeout {
        /// Provider name.
        collaborator: String,
        /// Bound in milliseconds.
        timeout_ms: u64,
    },

    /// The provider returned malformed data.
    #[error(transparent)]
    Data(#[from] DataError),
}

impl ProviderError {
    /// True when a cached input may stand in for the failed fetch.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }

    /// True for the explicit insufficient-data signal.
    #[must_use]
    pub const fn is_insufficient(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }
}

/// Numerical estimation failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EstimationError {
    /// Fewer periods than the estimator needs.
    #[error("need at least {required} periods, got {available}")]
    TooFewPeriods {
        /// Periods supplied.
        available: usize,
        /// Periods required.
        required: usize,
    },

    /// A NaN or infinity appeared at `stage`.
    #[error("non-finite value in {stage}")]
    NonFinite {
        /// Computation stage.
        stage: String,
    },

    /// Shrinkage could not restore positive semi-definiteness.
    #[error("covariance not positive semi-definite: min eigenvalue {min_eigenvalue:e}")]
    NotPositiveSemidefinite {
        /// Smallest eigenvalue after the last shrinkage step.
        min_eigenvalue: f64,
    },

    /// Inputs of incompatible shape.
    #[error("dimension mismatch: {reason}")]
    DimensionMismatch {
        /// Description.
        reason: String,
    },
}

/// Top-level engine error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The key is not a configured allocation cohort.
    #[error("unknown allocation cohort {strategy}")]
    UnknownCohort {
        /// Requested key.
        strategy: String,
    },

    /// The allocation bounds cannot hold for this many strategies.
    #[error("bounds [{min}, {max}] infeasible for {members} strategies")]
    InfeasibleBounds {
        /// Active strategies.
        members: usize,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// `check_rules` called before any snapshot exists.
    #[error("no risk snapshot for {strategy}")]
    NoSnapshot {
        /// Strategy key.
        strategy: String,
    },

    /// Collaborator failure with no cached fallback.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Estimation failure outside the allocation path.
    #[error(transparent)]
    Estimation(#[from] EstimationError),

    /// Risk analytics or rule management failure.
    #[error(transparent)]
    Risk(#[from] RiskError),

    /// Breaker transition failure.
    #[error(transparent)]
    Breaker(#[from] BreakerError),

    /// Persistence failure with no degraded path.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Severity used for logging.
    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::UnknownCohort { .. } | Self::InfeasibleBounds { .. } | Self::Config(_) => {
                ErrorSeverity::Fatal
            }
            Self::NoSnapshot { .. } => ErrorSeverity::Info,
            Self::Provider(e) if e.is_transient() => ErrorSeverity::Recoverable,
            Self::Storage(e) => e.severity(),
            Self::Breaker(e) if e.is_temporary() => ErrorSeverity::Recoverable,
            _ => ErrorSeverity::Warning,
        }
    }
}
