//! # Ballast Risk
//!
//! Realized-risk evaluation for the Ballast engine.
//!
//! This crate provides:
//! - [`RiskAnalytics`] - VaR/CVaR, drawdown, volatility, Sharpe/Sortino and
//!   benchmark regression over a trailing window
//! - [`AlertRuleEngine`] - threshold rules producing [`RiskAlert`]s
//! - [`CircuitBreaker`] - hard drawdown/loss limits per strategy with a durable
//!   transition journal and a local spool for when the journal is unreachable
//! - [`RetryPolicy`] - backoff schedule for best-effort writes
//!
//! # Example
//!
//! ```
//! use ballast_risk::analytics::{historical_var, conditional_var};
//!
//! let returns = [-0.05, -0.02, 0.01, 0.03, -0.01];
//! let var = historical_var(&returns, 0.95);
//! assert!((var - 0.044).abs() < 1e-12);
//! assert!((conditional_var(&returns, 0.95) - 0.05).abs() < 1e-12);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod analytics;
mod circuit_breaker;
mod error;
pub mod journal;
mod retry;
mod rules;

pub use analytics::{RiskAnalytics, RiskAnalyticsConfig, RiskMetric, RiskSnapshot};
pub use circuit_breaker::{
    BreakerConfig, BreakerLimits, BreakerStatus, CircuitBreaker, CircuitBreakerState, Durability,
    RestoreReport, TripCause,
};
pub use error::{BreakerError, RiskError};
pub use journal::{
    BreakerJournal, BreakerTransition, InMemoryBreakerJournal, TransitionKind, TripSpool,
};
pub use retry::{BackoffStrategy, RetryConfig, RetryPolicy};
pub use rules::{AlertId, AlertRuleEngine, Comparison, RiskAlert, RiskRule, RuleId};
