//! Persistence contract for weights, risk snapshots and alerts.
//!
//! Weights and snapshots are upserted by `(strategy, date)`: writing the same
//! key again replaces the record. Alerts are append-only apart from the
//! acknowledgment flag.

use async_trait::async_trait;
use ballast_core::error::StorageError;
use ballast_core::types::{StrategyId, WeightVector};
use ballast_risk::{AlertId, RiskAlert, RiskSnapshot};
use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Store for engine outputs.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Upserts the weights in force for `strategy` as of `date`.
    async fn upsert_weights(
        &self,
        strategy: &StrategyId,
        date: NaiveDate,
        weights: &WeightVector,
    ) -> Result<(), StorageError>;

    /// The most recent weights for `strategy`.
    async fn latest_weights(&self, strategy: &StrategyId)
    -> Result<Option<WeightVector>, StorageError>;

    /// Upserts a snapshot keyed by its strategy and date.
    async fn upsert_snapshot(&self, snapshot: &RiskSnapshot) -> Result<(), StorageError>;

    /// The most recent snapshot for `strategy`.
    async fn latest_snapshot(&self, strategy: &StrategyId)
    -> Result<Option<RiskSnapshot>, StorageError>;

    /// Appends alerts. An id that is already stored is an error.
    async fn append_alerts(&self, alerts: &[RiskAlert]) -> Result<(), StorageError>;

    /// Sets the acknowledgment flag and returns the updated alert.
    async fn acknowledge_alert(&self, id: AlertId) -> Result<RiskAlert, StorageError>;

    /// Alerts for `strategy`, oldest first.
    async fn alerts(&self, strategy: &StrategyId) -> Result<Vec<RiskAlert>, StorageError>;
}

/// In-memory store.
#[derive(Debug)]
pub struct InMemoryAllocationStore {
    weights: DashMap<StrategyId, BTreeMap<NaiveDate, WeightVector>>,
    snapshots: DashMap<StrategyId, BTreeMap<NaiveDate, RiskSnapshot>>,
    alerts: RwLock<Vec<RiskAlert>>,
    available: AtomicBool,
}

impl Default for InMemoryAllocationStore {
    fn default() -> Self {
        Self {
            weights: DashMap::new(),
            snapshots: DashMap::new(),
            alerts: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryAllocationStore {
    /// Creates an empty, available store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the store going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of weight records for `strategy`.
    #[must_use]
    pub fn weight_records(&self, strategy: &StrategyId) -> usize {
        self.weights.get(strategy).map_or(0, |m| m.len())
    }

    /// Number of snapshot records for `strategy`.
    #[must_use]
    pub fn snapshot_records(&self, strategy: &StrategyId) -> usize {
        self.snapshots.get(strategy).map_or(0, |m| m.len())
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                store: "allocation_store".to_string(),
                reason: "store offline".to_string(),
            })
        }
    }
}

#[async_trait]
impl AllocationStore for InMemoryAllocationStore {
    async fn upsert_weights(
        &self,
        strategy: &StrategyId,
        date: NaiveDate,
        weights: &WeightVector,
    ) -> Result<(), StorageError> {
        self.ensure_available()?;
        self.weights
            .entry(strategy.clone())
            .or_default()
            .insert(date, weights.clone());
        debug!(strategy = %strategy, %date, "weights upserted");
        Ok(())
    }

    async fn latest_weights(
        &self,
        strategy: &StrategyId,
    ) -> Result<Option<WeightVector>, StorageError> {
        self.ensure_available()?;
        Ok(self
            .weights
            .get(strategy)
            .and_then(|m| m.values().next_back().cloned()))
    }

    async fn upsert_snapshot(&self, snapshot: &RiskSnapshot) -> Result<(), StorageError> {
        self.ensure_available()?;
        self.snapshots
            .entry(snapshot.strategy.clone())
            .or_default()
            .insert(snapshot.date, snapshot.clone());
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        strategy: &StrategyId,
    ) -> Result<Option<RiskSnapshot>, StorageError> {
        self.ensure_available()?;
        Ok(self
            .snapshots
            .get(strategy)
            .and_then(|m| m.values().next_back().cloned()))
    }

    async fn append_alerts(&self, alerts: &[RiskAlert]) -> Result<(), StorageError> {
        self.ensure_available()?;
        let mut stored = self.alerts.write();
        if let Some(dup) = alerts.iter().find(|a| stored.iter().any(|s| s.id == a.id)) {
            return Err(StorageError::AlreadyExists {
                key: dup.id.to_string(),
            });
        }
        stored.extend(alerts.iter().cloned());
        Ok(())
    }

    async fn acknowledge_alert(&self, id: AlertId) -> Result<RiskAlert, StorageError> {
        self.ensure_available()?;
        let mut stored = self.alerts.write();
        let alert = stored
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| StorageError::NotFound { key: id.to_string() })?;
        alert.acknowledge();
        Ok(alert.clone())
    }

    async fn alerts(&self, strategy: &StrategyId) -> Result<Vec<RiskAlert>, StorageError> {
        self.ensure_available()?;
        Ok(self
            .alerts
            .read()
            .iter()
            .filter(|a| &a.strategy == strategy)
            .cloned()
            .collect())
    }
}
