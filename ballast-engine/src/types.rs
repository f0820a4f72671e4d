//! Allocation outcome types.

use crate::regime::RegimeState;
use ballast_core::types::{StrategyId, WeightVector};
use ballast_risk::TripCause;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Weighting scheme for the raw optimizer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    /// Positive part of `inv(S) * mu`.
    #[default]
    MaxSharpe,
    /// Positive part of `inv(S) * (mu - rf)`.
    Tangency,
    /// Equal risk contributions.
    RiskParity,
    /// Long-only minimum variance.
    MinVariance,
    /// Tangency on the Black-Litterman posterior.
    BlackLitterman,
    /// Tangency on worst-case returns and covariance.
    Robust,
    /// Uniform weights.
    EqualWeight,
}

impl Scheme {
    /// All schemes.
    pub const ALL: [Self; 7] = [
        Self::MaxSharpe,
        Self::Tangency,
        Self::RiskParity,
        Self::MinVariance,
        Self::BlackLitterman,
        Self::Robust,
        Self::EqualWeight,
    ];

    /// Stable name, used for metrics labels and CLI arguments.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MaxSharpe => "max_sharpe",
            Self::Tangency => "tangency",
            Self::RiskParity => "risk_parity",
            Self::MinVariance => "min_variance",
            Self::BlackLitterman => "black_litterman",
            Self::Robust => "robust",
            Self::EqualWeight => "equal_weight",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|scheme| scheme.as_str() == normalized)
            .ok_or_else(|| format!("unknown scheme: {s}"))
    }
}

/// A computed allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Run identifier, shared with the diagnostics record.
    pub run_id: Uuid,
    /// Cohort key.
    pub strategy: StrategyId,
    /// Bounded unit-sum weights with the regime exposure.
    pub weights: WeightVector,
    /// Wall-clock time of the computation.
    pub computed_at: DateTime<Utc>,
    /// Last return period used.
    pub as_of: Option<NaiveDate>,
    /// Scheme requested.
    pub scheme: Scheme,
    /// Regime adjustments applied.
    pub regime: RegimeState,
    /// Equal weights because the cohort history was too short.
    pub insufficient_data: bool,
    /// Some input came from the stale cache.
    pub stale: bool,
    /// The iterative solver met its tolerance.
    pub converged: bool,
}

/// Why an allocation was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The cohort breaker is tripped.
    BreakerTrip {
        /// Trip cause.
        cause: TripCause,
        /// Trip time.
        since: DateTime<Utc>,
    },
    /// Portfolio volatility was non-finite or above the ceiling.
    AnomalousVolatility {
        /// Annualized volatility of the discarded weights.
        volatility: f64,
    },
    /// Covariance or optimizer output unusable.
    EstimationFailure {
        /// Description.
        reason: String,
    },
}

impl RejectionReason {
    /// Stable label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BreakerTrip { .. } => "breaker_trip",
            Self::AnomalousVolatility { .. } => "anomalous_volatility",
            Self::EstimationFailure { .. } => "estimation_failure",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BreakerTrip { cause, since } => write!(f, "breaker tripped at {since}: {cause}"),
            Self::AnomalousVolatility { volatility } => {
                write!(f, "anomalous portfolio volatility {volatility:.4}")
            }
            Self::EstimationFailure { reason } => write!(f, "estimation failure: {reason}"),
        }
    }
}

/// A rejected allocation and the weights left in force.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Run identifier.
    pub run_id: Uuid,
    /// Cohort key.
    pub strategy: StrategyId,
    /// Reason.
    pub reason: RejectionReason,
    /// Previous weights, equal weights, or the halted vector.
    pub fallback: WeightVector,
    /// Wall-clock time of the computation.
    pub computed_at: DateTime<Utc>,
    /// Some input came from the stale cache.
    pub stale: bool,
}

/// Result of `compute_weights`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AllocationOutcome {
    /// New weights.
    Allocated(Allocation),
    /// No new weights.
    Rejected(Rejection),
}

impl AllocationOutcome {
    /// Weights in force after this outcome.
    #[must_use]
    pub fn weights(&self) -> &WeightVector {
        match self {
            Self::Allocated(a) => &a.weights,
            Self::Rejected(r) => &r.fallback,
        }
    }

    /// Run identifier.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::Allocated(a) => a.run_id,
            Self::Rejected(r) => r.run_id,
        }
    }

    /// True for a rejection.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// The rejection reason, if any.
    #[must_use]
    pub fn rejection(&self) -> Option<&RejectionReason> {
        match self {
            Self::Allocated(_) => None,
            Self::Rejected(r) => Some(&r.reason),
        }
    }

    /// Label for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Allocated(a) if a.insufficient_data => "insufficient_data",
            Self::Allocated(_) => "allocated",
            Self::Rejected(r) => r.reason.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_parse() {
        assert_eq!("risk-parity".parse::<Scheme>().unwrap(), Scheme::RiskParity);
        assert_eq!("MAX_SHARPE".parse::<Scheme>().unwrap(), Scheme::MaxSharpe);
        assert!("kelly".parse::<Scheme>().is_err());
        assert_eq!("black-litterman".parse::<Scheme>().unwrap(), Scheme::BlackLitterman);
        for scheme in Scheme::ALL {
            assert_eq!(scheme.as_str().parse::<Scheme>().unwrap(), scheme);
        }
    }

    #[test]
    fn test_rejection_serializes_tagged() {
        let reason = RejectionReason::AnomalousVolatility { volatility: 7.5 };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "anomalous_volatility");
        assert_eq!(reason.as_str(), "anomalous_volatility");
    }

    #[test]
    fn test_every_rejection_reason_survives_json() {
        let reasons = [
            RejectionReason::BreakerTrip {
                cause: TripCause::Manual {
                    reason: "desk halt".to_string(),
                    operator: Some("ops".to_string()),
                },
                since: DateTime::<Utc>::UNIX_EPOCH,
            },
            RejectionReason::AnomalousVolatility { volatility: 7.5 },
            RejectionReason::EstimationFailure {
                reason: "covariance not PSD".to_string(),
            },
        ];
        for reason in reasons {
            let json = serde_json::to_value(&reason).unwrap();
            assert_eq!(json["kind"], reason.as_str());
            let back: RejectionReason = serde_json::from_value(json).unwrap();
            assert_eq!(back, reason);
        }
    }
}
