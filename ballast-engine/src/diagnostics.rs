//! Append-only audit log of optimizer runs.
//!
//! Every `compute_weights` call that reaches the optimizer produces one
//! [`AllocationDiagnostics`] record. Writes are spawned in the background and
//! retried with backoff; a write that still fails is logged and counted, and
//! never affects the allocation that produced it.

use crate::covariance::{CovarianceEstimate, ShrinkageTarget};
use crate::regime::RegimeState;
use crate::types::{RejectionReason, Scheme};
use async_trait::async_trait;
use ballast_core::error::StorageError;
use ballast_core::types::StrategyId;
use ballast_risk::{RetryConfig, RetryPolicy};
use ballast_telemetry::metrics::EngineMetrics;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Covariance used by a run, with a fingerprint for replay checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceSnapshot {
    /// Row-major annualized matrix.
    pub matrix: Vec<Vec<f64>>,
    /// Shrinkage intensity.
    pub shrinkage: f64,
    /// Target used.
    pub target: ShrinkageTarget,
    /// Periods estimated from.
    pub periods: usize,
    /// SHA-256 of the matrix entries.
    pub fingerprint: String,
}

impl From<&CovarianceEstimate> for CovarianceSnapshot {
    fn from(estimate: &CovarianceEstimate) -> Self {
        Self {
            matrix: estimate.rows(),
            shrinkage: estimate.shrinkage,
            target: estimate.target,
            periods: estimate.periods,
            fingerprint: estimate.fingerprint(),
        }
    }
}

/// One optimizer run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationDiagnostics {
    /// Run identifier.
    pub run_id: Uuid,
    /// Cohort key.
    pub strategy: StrategyId,
    /// Run timestamp; with `run_id`, the record key.
    pub recorded_at: DateTime<Utc>,
    /// Scheme requested.
    pub scheme: Scheme,
    /// Active strategies, in vector order.
    pub strategies: Vec<StrategyId>,
    /// Annualized expected returns. Empty when estimation did not run.
    pub expected_returns: Vec<f64>,
    /// Covariance used, if estimated.
    pub covariance: Option<CovarianceSnapshot>,
    /// Regime adjustments.
    pub regime: RegimeState,
    /// Volatility targeting factor.
    pub volatility_scale: f64,
    /// Optimizer output before post-processing.
    pub raw_weights: Vec<f64>,
    /// Weights in force after the run.
    pub final_weights: Vec<f64>,
    /// Exposure in force after the run.
    pub exposure: f64,
    /// Set when the run was rejected.
    pub rejection: Option<RejectionReason>,
    /// Return entries replaced or filled by the sanitizer.
    pub replaced_returns: usize,
    /// Equal weights because history was too short.
    pub insufficient_data: bool,
    /// Some input came from the stale cache.
    pub stale: bool,
    /// Solver convergence.
    pub converged: bool,
    /// Assets held by the turnover filter.
    pub frozen: usize,
}

impl AllocationDiagnostics {
    /// Record key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.recorded_at.to_rfc3339(), self.run_id)
    }
}

/// Append-only diagnostics storage.
#[async_trait]
pub trait DiagnosticsStore: Send + Sync {
    /// Appends a record. A key that already exists is an error.
    async fn append(&self, record: &AllocationDiagnostics) -> Result<(), StorageError>;
}

/// In-memory diagnostics store.
#[derive(Debug)]
pub struct InMemoryDiagnosticsStore {
    records: RwLock<Vec<AllocationDiagnostics>>,
    available: AtomicBool,
}

impl Default for InMemoryDiagnosticsStore {
    fn default() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryDiagnosticsStore {
    /// Creates an empty, available store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the store going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Stored records, in append order.
    #[must_use]
    pub fn records(&self) -> Vec<AllocationDiagnostics> {
        self.records.read().clone()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True if nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl DiagnosticsStore for InMemoryDiagnosticsStore {
    async fn append(&self, record: &AllocationDiagnostics) -> Result<(), StorageError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                store: "diagnostics".to_string(),
                reason: "store offline".to_string(),
            });
        }
        let mut records = self.records.write();
        if records.iter().any(|r| r.run_id == record.run_id) {
            return Err(StorageError::AlreadyExists { key: record.key() });
        }
        records.push(record.clone());
        Ok(())
    }
}

/// Best-effort writer in front of a [`DiagnosticsStore`].
#[derive(Clone)]
pub struct DiagnosticsLog {
    store: Arc<dyn DiagnosticsStore>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for DiagnosticsLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticsLog")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl DiagnosticsLog {
    /// Creates a log.
    #[must_use]
    pub fn new(store: Arc<dyn DiagnosticsStore>, retry: RetryConfig) -> Self {
        Self {
            store,
            retry: RetryPolicy::new(retry),
        }
    }

    /// Spawns the write of `record`. The handle resolves to whether the record
    /// was stored; callers are not expected to await it.
    pub fn record(&self, record: AllocationDiagnostics) -> JoinHandle<bool> {
        let store = Arc::clone(&self.store);
        let retry = self.retry.clone();
        tokio::spawn(async move {
            let result = retry
                .run(
                    "diagnostics.append",
                    || store.append(&record),
                    StorageError::is_temporary,
                )
                .await;
            match result {
                Ok(()) => {
                    debug!(run_id = %record.run_id, strategy = %record.strategy, "diagnostics recorded");
                    true
                }
                Err(e) => {
                    warn!(
                        run_id = %record.run_id,
                        strategy = %record.strategy,
                        error = %e,
                        "diagnostics record dropped"
                    );
                    EngineMetrics::diagnostics_dropped();
                    false
                }
            }
        })
    }
}
