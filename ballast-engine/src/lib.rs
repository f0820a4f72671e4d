//! # Ballast Engine
//!
//! Regime-aware capital allocation across trading strategies.
//!
//! This crate provides:
//! - Return sanitization, shrinkage covariance estimation and a family of
//!   weighting schemes (max-Sharpe, tangency, risk parity, minimum variance)
//! - Post-processing: volatility targeting, bounded-simplex projection,
//!   turnover filtering and an anomaly guard
//! - Exposure scaling from a macro crisis indicator and a correlation regime
//! - [`AllocationEngine`], the facade tying allocation to realized risk, alert
//!   rules and the circuit breaker
//!
//! # Architecture
//!
//! The numerical path is a pure function of its inputs ([`AllocationPipeline`]).
//! Everything with I/O sits behind the collaborator traits
//! ([`ReturnsProvider`], [`MacroProvider`], [`AllocationStore`],
//! [`DiagnosticsStore`], [`BroadcastSink`]), each bounded by a timeout with a
//! cached fallback.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ballast_engine::{AllocationEngine, EngineConfig, Scheme, StaticReturnsProvider};
//!
//! # async fn run(config: EngineConfig) -> Result<(), ballast_engine::EngineError> {
//! let provider = Arc::new(StaticReturnsProvider::new(config.sanitizer.min_periods));
//! let engine = AllocationEngine::builder(config, provider).build()?;
//! let outcome = engine
//!     .compute_weights(&"book".into(), Scheme::RiskParity, Some(0.11))
//!     .await?;
//! println!("{}", outcome.label());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::similar_names)]

pub mod config;
pub mod covariance;
pub mod diagnostics;
mod engine;
pub mod error;
pub mod optimizer;
pub mod pipeline;
pub mod providers;
pub mod regime;
pub mod sanitizer;
pub mod sink;
pub mod store;
pub mod types;

pub use config::{CohortConfig, EngineConfig, IoConfig};
pub use covariance::{CovarianceConfig, CovarianceEstimate, CovarianceEstimator, ShrinkageTarget};
pub use diagnostics::{
    AllocationDiagnostics, CovarianceSnapshot, DiagnosticsLog, DiagnosticsStore,
    InMemoryDiagnosticsStore,
};
pub use engine::{AllocationEngine, AllocationEngineBuilder};
pub use error::{EngineError, EstimationError, ProviderError};
pub use optimizer::{AllocationConfig, Optimization, PortfolioOptimizer, SolverConfig};
pub use pipeline::{AllocationInputs, AllocationPipeline, PipelineOutput};
pub use providers::{
    MacroProvider, NullMacroProvider, ReturnsProvider, StaticMacroProvider, StaticReturnsProvider,
};
pub use regime::{MacroSnapshot, Regime, RegimeConfig, RegimeDetector, RegimeState};
pub use sanitizer::{ReturnPanel, ReturnsSanitizer, SanitizerConfig, ZScoreMode};
pub use sink::{BroadcastSink, ChannelSink, EngineEvent, NullSink};
pub use store::{AllocationStore, InMemoryAllocationStore};
pub use types::{Allocation, AllocationOutcome, Rejection, RejectionReason, Scheme};
