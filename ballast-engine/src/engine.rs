//! The allocation engine facade.
//!
//! [`AllocationEngine`] owns the collaborators and the per-strategy state that
//! lives between cycles: the serialization locks, the stale-input caches and
//! the carried regime fits. Numerical work is delegated to
//! [`AllocationPipeline`], risk to `ballast-risk`.

use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticsLog, DiagnosticsStore, InMemoryDiagnosticsStore};
use crate::error::{EngineError, ProviderError};
use crate::optimizer::bounds_feasible;
use crate::pipeline::{AllocationInputs, AllocationPipeline};
use crate::providers::{MacroProvider, NullMacroProvider, ReturnsProvider};
use crate::regime::{CachedFit, MacroSnapshot};
use crate::sink::{BroadcastSink, EngineEvent, NullSink};
use crate::store::{AllocationStore, InMemoryAllocationStore};
use crate::types::{AllocationOutcome, Rejection, RejectionReason, Scheme};
use ballast_core::config::Validatable;
use ballast_core::error::StorageError;
use ballast_core::types::{ReturnSeries, StrategyId, WeightVector};
use ballast_risk::{
    AlertId, AlertRuleEngine, BreakerError, BreakerJournal, BreakerStatus, CircuitBreaker,
    InMemoryBreakerJournal, RestoreReport, RiskAlert, RiskAnalytics, RiskRule, RiskSnapshot, RuleId,
    TripCause,
};
use ballast_telemetry::metrics::EngineMetrics;
use ballast_telemetry::spans::{allocation_span, io_span, risk_span, rules_span};
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{Instrument, info, warn};
use uuid::Uuid;

/// Runs `fut` under `limit`, mapping expiry to `on_timeout`.
async fn within<T, E>(
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(on_timeout()))
}

#[allow(clippy::cast_possible_truncation)]
fn millis(limit: Duration) -> u64 {
    limit.as_millis() as u64
}

/// Builder for [`AllocationEngine`].
///
/// Only the returns provider is required. The other collaborators default to
/// the null macro provider, in-memory stores, an in-memory breaker journal and
/// the null sink.
pub struct AllocationEngineBuilder {
    config: EngineConfig,
    returns: Arc<dyn ReturnsProvider>,
    macro_provider: Arc<dyn MacroProvider>,
    store: Arc<dyn AllocationStore>,
    diagnostics: Arc<dyn DiagnosticsStore>,
    journal: Arc<dyn BreakerJournal>,
    sink: Arc<dyn BroadcastSink>,
    rules: Vec<RiskRule>,
}

impl AllocationEngineBuilder {
    /// Sets the macro provider.
    #[must_use]
    pub fn macro_provider(mut self, provider: Arc<dyn MacroProvider>) -> Self {
        self.macro_provider = provider;
        self
    }

    /// Sets the weights, snapshot and alert store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn AllocationStore>) -> Self {
        self.store = store;
        self
    }

    /// Sets the diagnostics store.
    #[must_use]
    pub fn diagnostics(mut self, store: Arc<dyn DiagnosticsStore>) -> Self {
        self.diagnostics = store;
        self
    }

    /// Sets the breaker journal.
    #[must_use]
    pub fn journal(mut self, journal: Arc<dyn BreakerJournal>) -> Self {
        self.journal = journal;
        self
    }

    /// Sets the broadcast sink.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn BroadcastSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Preloads alert rules.
    #[must_use]
    pub fn rules(mut self, rules: impl IntoIterator<Item = RiskRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Validates the configuration and builds the engine.
    pub fn build(self) -> Result<AllocationEngine, EngineError> {
        self.config.validate()?;
        let rules = AlertRuleEngine::with_rules(self.rules)?;
        info!(
            cohorts = self.config.cohorts.len(),
            rules = rules.len(),
            correlation_observations = self.config.correlation_observations(),
            "allocation engine built"
        );
        Ok(AllocationEngine {
            pipeline: AllocationPipeline::new(&self.config),
            analytics: RiskAnalytics::new(self.config.risk.clone()),
            breaker: CircuitBreaker::new(self.config.breaker.clone(), self.journal),
            diagnostics: DiagnosticsLog::new(self.diagnostics, self.config.diagnostics_retry.clone()),
            rules,
            returns: self.returns,
            macro_provider: self.macro_provider,
            store: self.store,
            sink: self.sink,
            locks: DashMap::new(),
            returns_cache: DashMap::new(),
            risk_cache: DashMap::new(),
            macro_cache: RwLock::new(None),
            weights_cache: DashMap::new(),
            snapshot_cache: DashMap::new(),
            fits: DashMap::new(),
            config: self.config,
        })
    }
}

/// Return fetch result for one member.
enum Fetched {
    Series { series: ReturnSeries, stale: bool },
    Insufficient,
}

/// Computes allocations and evaluates realized risk.
///
/// At most one `compute_weights` runs per cohort key at a time; different
/// keys run concurrently.
pub struct AllocationEngine {
    config: EngineConfig,
    pipeline: AllocationPipeline,
    analytics: RiskAnalytics,
    breaker: CircuitBreaker,
    rules: AlertRuleEngine,
    diagnostics: DiagnosticsLog,
    returns: Arc<dyn ReturnsProvider>,
    macro_provider: Arc<dyn MacroProvider>,
    store: Arc<dyn AllocationStore>,
    sink: Arc<dyn BroadcastSink>,
    locks: DashMap<StrategyId, Arc<Mutex<()>>>,
    returns_cache: DashMap<StrategyId, ReturnSeries>,
    risk_cache: DashMap<StrategyId, ReturnSeries>,
    macro_cache: RwLock<Option<MacroSnapshot>>,
    weights_cache: DashMap<StrategyId, WeightVector>,
    snapshot_cache: DashMap<StrategyId, RiskSnapshot>,
    fits: DashMap<StrategyId, CachedFit>,
}

impl std::fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("cohorts", &self.config.cohorts.len())
            .field("breaker", &self.breaker)
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}

impl AllocationEngine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder(config: EngineConfig, returns: Arc<dyn ReturnsProvider>) -> AllocationEngineBuilder {
        AllocationEngineBuilder {
            config,
            returns,
            macro_provider: Arc::new(NullMacroProvider),
            store: Arc::new(InMemoryAllocationStore::new()),
            diagnostics: Arc::new(InMemoryDiagnosticsStore::new()),
            journal: Arc::new(InMemoryBreakerJournal::new()),
            sink: Arc::new(NullSink),
            rules: Vec::new(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Computes the weights for cohort `strategy`.
    ///
    /// Insufficient history, estimation failures, anomalous volatility and a
    /// tripped breaker are reported in the outcome, not as errors. When
    /// excluding tripped members leaves too few to satisfy the bounds, the
    /// survivors get equal weights in a rejected outcome. Errors are reserved
    /// for an unknown cohort, bounds the full cohort cannot satisfy, and a
    /// collaborator failure with nothing cached to fall back on.
    pub async fn compute_weights(
        &self,
        strategy: &StrategyId,
        scheme: Scheme,
        risk_target: Option<f64>,
    ) -> Result<AllocationOutcome, EngineError> {
        let members = self
            .config
            .members(strategy)
            .ok_or_else(|| EngineError::UnknownCohort {
                strategy: strategy.to_string(),
            })?
            .to_vec();
        let run_id = Uuid::new_v4();
        let span = allocation_span(strategy.as_str(), scheme.as_str(), &run_id.to_string());
        self.allocate(strategy, members, scheme, risk_target, run_id)
            .instrument(span)
            .await
    }

    async fn allocate(
        &self,
        strategy: &StrategyId,
        members: Vec<StrategyId>,
        scheme: Scheme,
        risk_target: Option<f64>,
        run_id: Uuid,
    ) -> Result<AllocationOutcome, EngineError> {
        let started = Instant::now();
        let lock = Arc::clone(self.locks.entry(strategy.clone()).or_default().value());
        let _guard = lock.lock().await;

        if let Some(outcome) = self.halted(strategy, &members, run_id) {
            return Ok(self.finish(strategy, outcome, started));
        }
        let cfg = &self.config.allocation;
        if !bounds_feasible(members.len(), 1.0, cfg.min_allocation, cfg.max_allocation) {
            return Err(EngineError::InfeasibleBounds {
                members: members.len(),
                min: cfg.min_allocation,
                max: cfg.max_allocation,
            });
        }
        let (active, excluded): (Vec<StrategyId>, Vec<StrategyId>) = members
            .into_iter()
            .partition(|m| !self.breaker.is_tripped(m));
        if !bounds_feasible(active.len(), 1.0, cfg.min_allocation, cfg.max_allocation) {
            let outcome = self.degraded(strategy, &active, &excluded, run_id);
            return Ok(self.finish(strategy, outcome, started));
        }

        let window = self.pipeline.sanitizer().config().lookback;
        let fetched = join_all(active.iter().map(|m| self.fetch_returns(m, window))).await;
        let mut series = Vec::with_capacity(active.len());
        let mut stale = false;
        let mut insufficient = false;
        for result in fetched {
            match result? {
                Fetched::Series { series: s, stale: was_stale } => {
                    stale |= was_stale;
                    series.push(s);
                }
                Fetched::Insufficient => insufficient = true,
            }
        }

        let (macro_snapshot, macro_stale) = self.fetch_macro().await;
        stale |= macro_stale;
        let previous = self.previous_weights(strategy).await;
        let cached_fit = self.fits.get(strategy).map(|f| f.value().clone());

        let output = self.pipeline.run(&AllocationInputs {
            run_id,
            now: Utc::now(),
            strategy,
            members: &active,
            scheme,
            risk_target,
            returns: (!insufficient).then_some(series.as_slice()),
            macro_snapshot: &macro_snapshot,
            previous: previous.as_ref(),
            cached_fit: cached_fit.as_ref(),
            stale,
        });

        match output.fit {
            Some(fit) => {
                self.fits.insert(strategy.clone(), fit);
            }
            None => {
                self.fits.remove(strategy);
            }
        }
        drop(self.diagnostics.record(output.diagnostics));

        if let AllocationOutcome::Allocated(allocation) = &output.outcome {
            self.weights_cache
                .insert(strategy.clone(), allocation.weights.clone());
            let date = allocation
                .as_of
                .unwrap_or_else(|| allocation.computed_at.date_naive());
            self.persist_weights(strategy, date, &allocation.weights).await;
        }
        Ok(self.finish(strategy, output.outcome, started))
    }

    /// Halted outcome when the cohort, or every member, is tripped.
    fn halted(
        &self,
        strategy: &StrategyId,
        members: &[StrategyId],
        run_id: Uuid,
    ) -> Option<AllocationOutcome> {
        let status = match self.breaker.status(strategy) {
            BreakerStatus::Ok => {
                let statuses: Vec<BreakerStatus> =
                    members.iter().map(|m| self.breaker.status(m)).collect();
                if !statuses.iter().all(BreakerStatus::is_tripped) {
                    return None;
                }
                statuses.into_iter().next()?
            }
            tripped => tripped,
        };
        let BreakerStatus::Tripped { cause, since } = status else {
            return None;
        };
        warn!(strategy = %strategy, cause = %cause, "allocation halted by circuit breaker");
        Some(AllocationOutcome::Rejected(Rejection {
            run_id,
            strategy: strategy.clone(),
            reason: RejectionReason::BreakerTrip { cause, since },
            fallback: WeightVector::halted(members),
            computed_at: Utc::now(),
            stale: false,
        }))
    }

    /// Equal weights over the surviving members when tripped exclusions leave
    /// the bounds unreachable. Reported as a rejection carrying the trip of
    /// the first excluded member.
    fn degraded(
        &self,
        strategy: &StrategyId,
        active: &[StrategyId],
        excluded: &[StrategyId],
        run_id: Uuid,
    ) -> AllocationOutcome {
        let reason = excluded
            .iter()
            .find_map(|m| match self.breaker.status(m) {
                BreakerStatus::Tripped { cause, since } => {
                    Some(RejectionReason::BreakerTrip { cause, since })
                }
                BreakerStatus::Ok => None,
            })
            .unwrap_or_else(|| RejectionReason::EstimationFailure {
                reason: format!("{} members excluded", excluded.len()),
            });
        warn!(
            strategy = %strategy,
            survivors = active.len(),
            excluded = excluded.len(),
            reason = %reason,
            "bounds infeasible after exclusions, equal weights over survivors"
        );
        AllocationOutcome::Rejected(Rejection {
            run_id,
            strategy: strategy.clone(),
            reason,
            fallback: WeightVector::equal(active),
            computed_at: Utc::now(),
            stale: false,
        })
    }

    fn finish(
        &self,
        strategy: &StrategyId,
        outcome: AllocationOutcome,
        started: Instant,
    ) -> AllocationOutcome {
        let weights = outcome.weights();
        info!(
            outcome = outcome.label(),
            exposure = weights.exposure(),
            strategies = weights.len(),
            "compute_weights finished"
        );
        EngineMetrics::allocation(strategy.as_str(), outcome.label(), started.elapsed());
        EngineMetrics::exposure(strategy.as_str(), weights.exposure());
        self.sink.publish(EngineEvent::Allocation(outcome.clone()));
        outcome
    }

    async fn fetch_returns(
        &self,
        member: &StrategyId,
        window: usize,
    ) -> Result<Fetched, ProviderError> {
        let limit = self.config.io.fetch_timeout;
        let result = within(limit, self.returns.get_returns(member, window), || {
            ProviderError::Timeout {
                collaborator: "returns".to_string(),
                timeout_ms: millis(limit),
            }
        })
        .instrument(io_span("returns", "get_returns"))
        .await;

        match result {
            Ok(series) => {
                self.returns_cache.insert(member.clone(), series.clone());
                Ok(Fetched::Series {
                    series,
                    stale: false,
                })
            }
            Err(e) if e.is_insufficient() => Ok(Fetched::Insufficient),
            Err(e) if e.is_transient() => match self.returns_cache.get(member) {
                Some(cached) => {
                    warn!(strategy = %member, error = %e, "using cached returns");
                    EngineMetrics::stale_input("returns");
                    Ok(Fetched::Series {
                        series: cached.value().clone(),
                        stale: true,
                    })
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// The macro snapshot and whether it is stale. A failed fetch with nothing
    /// cached degrades to the empty snapshot, whose CCI is zero.
    async fn fetch_macro(&self) -> (MacroSnapshot, bool) {
        let limit = self.config.io.fetch_timeout;
        let result = within(limit, self.macro_provider.macro_snapshot(), || {
            ProviderError::Timeout {
                collaborator: "macro".to_string(),
                timeout_ms: millis(limit),
            }
        })
        .instrument(io_span("macro", "macro_snapshot"))
        .await;

        match result {
            Ok(snapshot) => {
                *self.macro_cache.write() = Some(snapshot.clone());
                (snapshot, false)
            }
            Err(e) => {
                warn!(error = %e, "macro fetch failed, using cached snapshot");
                EngineMetrics::stale_input("macro");
                let cached = self.macro_cache.read().clone();
                (cached.unwrap_or_else(MacroSnapshot::empty), true)
            }
        }
    }

    async fn previous_weights(&self, strategy: &StrategyId) -> Option<WeightVector> {
        let limit = self.config.io.persist_timeout;
        let result = within(limit, self.store.latest_weights(strategy), || {
            StorageError::Timeout {
                operation: "latest_weights".to_string(),
                timeout_ms: millis(limit),
            }
        })
        .instrument(io_span("store", "latest_weights"))
        .await;

        match result {
            Ok(weights) => weights,
            Err(e) => {
                warn!(strategy = %strategy, error = %e, "previous weights unavailable, using cache");
                self.weights_cache.get(strategy).map(|w| w.value().clone())
            }
        }
    }

    async fn persist_weights(&self, strategy: &StrategyId, date: NaiveDate, weights: &WeightVector) {
        let limit = self.config.io.persist_timeout;
        let result = within(limit, self.store.upsert_weights(strategy, date, weights), || {
            StorageError::Timeout {
                operation: "upsert_weights".to_string(),
                timeout_ms: millis(limit),
            }
        })
        .instrument(io_span("store", "upsert_weights"))
        .await;
        if let Err(e) = result {
            warn!(strategy = %strategy, %date, error = %e, "weights not persisted");
        }
    }

    /// Computes the realized-risk snapshot of `strategy` as of `date`, stores
    /// it and feeds it to the circuit breaker.
    ///
    /// A breaker transition that cannot be recorded durably is returned as an
    /// error; the snapshot has still been stored.
    pub async fn evaluate_risk(
        &self,
        strategy: &StrategyId,
        date: NaiveDate,
    ) -> Result<RiskSnapshot, EngineError> {
        let span = risk_span(strategy.as_str(), &date.to_string());
        async {
            let window = self.analytics.config().window;
            let (returns, stale) = self.fetch_risk_returns(strategy, date, window).await?;
            let benchmark = match self.analytics.config().benchmark.clone() {
                Some(id) => match self.fetch_risk_returns(&id, date, window).await {
                    Ok((series, _)) => Some(series),
                    Err(e) => {
                        warn!(benchmark = %id, error = %e, "benchmark unavailable, beta set to zero");
                        None
                    }
                },
                None => None,
            };

            let mut snapshot = self.analytics.snapshot(&returns, date, benchmark.as_ref())?;
            if stale {
                snapshot = snapshot.into_stale();
            }
            self.snapshot_cache.insert(strategy.clone(), snapshot.clone());
            self.persist_snapshot(&snapshot).await;
            self.sink.publish(EngineEvent::Risk(snapshot.clone()));

            let was_tripped = self.breaker.is_tripped(strategy);
            let status = self.breaker.observe(&snapshot).await?;
            if status.is_tripped() && !was_tripped {
                self.sink.publish(EngineEvent::Breaker {
                    strategy: strategy.clone(),
                    status,
                });
            }
            Ok(snapshot)
        }
        .instrument(span)
        .await
    }

    async fn fetch_risk_returns(
        &self,
        strategy: &StrategyId,
        date: NaiveDate,
        window: usize,
    ) -> Result<(ReturnSeries, bool), ProviderError> {
        let limit = self.config.io.fetch_timeout;
        let result = within(
            limit,
            self.returns.get_returns_until(strategy, date, window),
            || ProviderError::Timeout {
                collaborator: "returns".to_string(),
                timeout_ms: millis(limit),
            },
        )
        .instrument(io_span("returns", "get_returns_until"))
        .await;

        match result {
            Ok(series) => {
                self.risk_cache.insert(strategy.clone(), series.clone());
                Ok((series, false))
            }
            Err(e) if e.is_transient() => match self.risk_cache.get(strategy) {
                Some(cached) => {
                    warn!(strategy = %strategy, error = %e, "using cached returns for risk");
                    EngineMetrics::stale_input("returns");
                    Ok((cached.up_to(date).tail(window), true))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn persist_snapshot(&self, snapshot: &RiskSnapshot) {
        let limit = self.config.io.persist_timeout;
        let result = within(limit, self.store.upsert_snapshot(snapshot), || {
            StorageError::Timeout {
                operation: "upsert_snapshot".to_string(),
                timeout_ms: millis(limit),
            }
        })
        .instrument(io_span("store", "upsert_snapshot"))
        .await;
        if let Err(e) = result {
            warn!(strategy = %snapshot.strategy, error = %e, "snapshot not persisted");
        }
    }

    /// Evaluates the rules of `strategy` against its latest snapshot and
    /// stores the alerts raised.
    ///
    /// A rule counts as fired only once its alert is stored. When the store
    /// rejects the write the error is returned and the next call raises the
    /// same breaches again.
    pub async fn check_rules(&self, strategy: &StrategyId) -> Result<Vec<RiskAlert>, EngineError> {
        async {
            let limit = self.config.io.persist_timeout;
            let stored = within(limit, self.store.latest_snapshot(strategy), || {
                StorageError::Timeout {
                    operation: "latest_snapshot".to_string(),
                    timeout_ms: millis(limit),
                }
            })
            .await;
            let cached = self.snapshot_cache.get(strategy).map(|s| s.value().clone());
            let snapshot = match (stored, cached) {
                (Ok(Some(s)), _) | (Ok(None) | Err(_), Some(s)) => s,
                (Ok(None), None) => {
                    return Err(EngineError::NoSnapshot {
                        strategy: strategy.to_string(),
                    });
                }
                (Err(e), None) => return Err(e.into()),
            };

            let alerts = self.rules.pending(&snapshot, Utc::now());
            if alerts.is_empty() {
                return Ok(alerts);
            }
            let result = within(limit, self.store.append_alerts(&alerts), || {
                StorageError::Timeout {
                    operation: "append_alerts".to_string(),
                    timeout_ms: millis(limit),
                }
            })
            .await;
            if let Err(e) = result {
                warn!(count = alerts.len(), error = %e, "alerts not persisted, rules stay armed");
                return Err(e.into());
            }
            self.rules.mark_fired(&alerts);
            for alert in &alerts {
                self.sink.publish(EngineEvent::Alert(alert.clone()));
            }
            Ok(alerts)
        }
        .instrument(rules_span(strategy.as_str()))
        .await
    }

    /// Breaker status of `strategy`.
    #[must_use]
    pub fn breaker_status(&self, strategy: &StrategyId) -> BreakerStatus {
        self.breaker.status(strategy)
    }

    /// Operator reset. Fails if the breaker is not tripped, is still cooling
    /// down, or the reset cannot be recorded durably.
    pub async fn reset_breaker(&self, strategy: &StrategyId) -> Result<(), BreakerError> {
        self.breaker.reset(strategy).await?;
        self.sink.publish(EngineEvent::Breaker {
            strategy: strategy.clone(),
            status: BreakerStatus::Ok,
        });
        Ok(())
    }

    /// Operator halt.
    pub async fn trip_breaker(
        &self,
        strategy: &StrategyId,
        reason: impl Into<String>,
        operator: Option<String>,
    ) -> Result<BreakerStatus, BreakerError> {
        let cause = TripCause::Manual {
            reason: reason.into(),
            operator,
        };
        let status = self.breaker.trip(strategy, cause).await?;
        self.sink.publish(EngineEvent::Breaker {
            strategy: strategy.clone(),
            status: status.clone(),
        });
        Ok(status)
    }

    /// Replays spooled breaker transitions into the journal.
    pub async fn flush_breaker_spool(&self) -> Result<usize, BreakerError> {
        let replayed = self.breaker.flush_spool().await?;
        if replayed > 0 {
            info!(replayed, "breaker spool flushed");
        }
        Ok(replayed)
    }

    /// Rebuilds breaker state from the journal and spool. Call once at startup.
    pub async fn restore_breakers(&self) -> Result<RestoreReport, BreakerError> {
        self.breaker.restore().await
    }

    /// Marks an alert acknowledged.
    pub async fn acknowledge_alert(&self, id: AlertId) -> Result<RiskAlert, EngineError> {
        let limit = self.config.io.persist_timeout;
        Ok(within(limit, self.store.acknowledge_alert(id), || {
            StorageError::Timeout {
                operation: "acknowledge_alert".to_string(),
                timeout_ms: millis(limit),
            }
        })
        .await?)
    }

    /// Registers a rule.
    pub fn add_rule(&self, rule: RiskRule) -> Result<RuleId, EngineError> {
        Ok(self.rules.add_rule(rule)?)
    }

    /// Replaces a rule, keeping its id.
    pub fn replace_rule(&self, id: RuleId, rule: RiskRule) -> Result<(), EngineError> {
        Ok(self.rules.replace_rule(id, rule)?)
    }

    /// Removes a rule.
    pub fn remove_rule(&self, id: RuleId) -> Result<RiskRule, EngineError> {
        Ok(self.rules.remove_rule(id)?)
    }

    /// Rules scoped to `strategy`.
    #[must_use]
    pub fn rules_for(&self, strategy: &StrategyId) -> Vec<RiskRule> {
        self.rules.rules_for(strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CohortConfig;
    use crate::providers::{StaticMacroProvider, StaticReturnsProvider};
    use crate::sink::ChannelSink;
    use approx::assert_abs_diff_eq;
    use ballast_risk::{Comparison, RiskMetric};
    use chrono::Days;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()
    }

    fn weekly(id: &str, values: &[f64]) -> ReturnSeries {
        ReturnSeries::from_pairs(
            id,
            values
                .iter()
                .enumerate()
                .map(|(t, v)| (start() + Days::new(7 * t as u64), *v)),
        )
        .unwrap()
    }

    fn noise(seed: usize) -> f64 {
        let x = ((seed as f64 + 1.0) * 12.9898).sin() * 43_758.545_3;
        2.0 * (x - x.floor()) - 1.0
    }

    fn noisy(id: &str, periods: usize, salt: usize) -> ReturnSeries {
        let values: Vec<f64> = (0..periods)
            .map(|t| 0.002 + 0.01 * noise(t * 31 + salt * 7))
            .collect();
        weekly(id, &values)
    }

    fn config(members: &[&str]) -> EngineConfig {
        let mut config = EngineConfig {
            cohorts: vec![CohortConfig {
                strategy: "book".into(),
                members: members.iter().map(|m| StrategyId::from(*m)).collect(),
            }],
            ..EngineConfig::default()
        };
        config.breaker.cooldown = Duration::ZERO;
        config
    }

    fn engine(config: EngineConfig, provider: Arc<StaticReturnsProvider>) -> AllocationEngine {
        AllocationEngine::builder(config, provider).build().unwrap()
    }

    #[tokio::test]
    async fn test_identical_returns_give_equal_weights() {
        let provider = Arc::new(StaticReturnsProvider::with_series(
            4,
            ["a", "b", "c"].map(|id| weekly(id, &[0.01; 12])),
        ));
        let engine = engine(config(&["a", "b", "c"]), provider);

        let outcome = engine
            .compute_weights(&"book".into(), Scheme::MaxSharpe, None)
            .await
            .unwrap();
        let AllocationOutcome::Allocated(allocation) = &outcome else {
            panic!("expected an allocation, got {outcome:?}");
        };
        assert!(!allocation.insufficient_data);
        for (_, w) in allocation.weights.iter() {
            assert_abs_diff_eq!(w, 1.0 / 3.0, epsilon = 1e-9);
        }
    }

    #[tokio::test]
    async fn test_short_history_flags_insufficient_data() {
        let provider = Arc::new(StaticReturnsProvider::with_series(
            4,
            ["a", "b", "c"].map(|id| weekly(id, &[0.01, 0.02, -0.01])),
        ));
        let engine = engine(config(&["a", "b", "c"]), provider);

        let outcome = engine
            .compute_weights(&"book".into(), Scheme::RiskParity, None)
            .await
            .unwrap();
        let AllocationOutcome::Allocated(allocation) = &outcome else {
            panic!("expected an allocation");
        };
        assert!(allocation.insufficient_data);
        for (_, w) in allocation.weights.iter() {
            assert_abs_diff_eq!(w, 1.0 / 3.0, epsilon = 1e-12);
        }
    }

    #[tokio::test]
    async fn test_crisis_indicator_halves_exposure() {
        let provider = Arc::new(StaticReturnsProvider::with_series(
            4,
            [noisy("a", 12, 1), noisy("b", 12, 2), noisy("c", 12, 3)],
        ));
        let macro_provider = Arc::new(StaticMacroProvider::new(
            MacroSnapshot::empty().with_zscore("vix", 12.5),
        ));
        let engine = AllocationEngine::builder(config(&["a", "b", "c"]), provider)
            .macro_provider(macro_provider)
            .build()
            .unwrap();

        let outcome = engine
            .compute_weights(&"book".into(), Scheme::MaxSharpe, None)
            .await
            .unwrap();
        let weights = outcome.weights();
        assert_abs_diff_eq!(weights.sum(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(weights.exposure(), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(weights.gross_exposure(), 0.5, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_drawdown_trips_breaker_until_reset() {
        let provider = Arc::new(StaticReturnsProvider::with_series(
            2,
            [
                noisy("a", 24, 1),
                noisy("b", 24, 2),
                noisy("c", 24, 3),
                weekly("book", &[0.01, -0.2, -0.25, 0.01]),
            ],
        ));
        let sink = Arc::new(ChannelSink::new(64));
        let mut events = sink.subscribe();
        let engine = AllocationEngine::builder(config(&["a", "b", "c"]), provider)
            .sink(sink.clone())
            .build()
            .unwrap();
        let book: StrategyId = "book".into();
        let date = start() + Days::new(21);

        let snapshot = engine.evaluate_risk(&book, date).await.unwrap();
        assert!(snapshot.max_drawdown <= -0.35);
        assert!(engine.breaker_status(&book).is_tripped());

        for _ in 0..2 {
            let outcome = engine
                .compute_weights(&book, Scheme::MaxSharpe, None)
                .await
                .unwrap();
            assert!(matches!(
                outcome.rejection(),
                Some(RejectionReason::BreakerTrip { .. })
            ));
            assert!(outcome.weights().is_halted());
            assert_abs_diff_eq!(outcome.weights().sum(), 0.0);
        }

        engine.reset_breaker(&book).await.unwrap();
        assert!(!engine.breaker_status(&book).is_tripped());
        let outcome = engine
            .compute_weights(&book, Scheme::MaxSharpe, None)
            .await
            .unwrap();
        assert!(!outcome.is_rejected());
        assert_abs_diff_eq!(outcome.weights().sum(), 1.0, epsilon = 1e-9);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(kinds[..2], ["risk", "breaker"]);
        assert!(kinds.contains(&"allocation"));
    }

    #[tokio::test]
    async fn test_reset_without_trip_is_rejected() {
        let provider = Arc::new(StaticReturnsProvider::new(2));
        let engine = engine(config(&["a", "b", "c"]), provider);
        assert!(matches!(
            engine.reset_breaker(&"book".into()).await,
            Err(BreakerError::NotTripped { .. })
        ));
    }

    #[tokio::test]
    async fn test_tripped_member_is_excluded() {
        let provider = Arc::new(StaticReturnsProvider::with_series(
            4,
            (0..4).map(|i| noisy(&format!("m{i}"), 24, i)),
        ));
        let engine = engine(config(&["m0", "m1", "m2", "m3"]), provider);
        engine
            .trip_breaker(&"m3".into(), "desk request", Some("ops".to_string()))
            .await
            .unwrap();

        let outcome = engine
            .compute_weights(&"book".into(), Scheme::EqualWeight, None)
            .await
            .unwrap();
        let weights = outcome.weights();
        assert_eq!(weights.len(), 3);
        assert!(weights.weight(&"m3".into()).is_none());
        assert_abs_diff_eq!(weights.sum(), 1.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_exclusion_below_bounds_degrades_to_equal_weights() {
        let provider = Arc::new(StaticReturnsProvider::with_series(
            4,
            (0..3).map(|i| noisy(&format!("m{i}"), 24, i)),
        ));
        let engine = engine(config(&["m0", "m1", "m2"]), provider);
        engine
            .trip_breaker(&"m2".into(), "desk request", Some("ops".to_string()))
            .await
            .unwrap();

        let outcome = engine
            .compute_weights(&"book".into(), Scheme::RiskParity, None)
            .await
            .unwrap();
        let Some(RejectionReason::BreakerTrip { cause, .. }) = outcome.rejection() else {
            panic!("expected a breaker rejection, got {outcome:?}");
        };
        assert_eq!(cause.as_str(), "manual");
        let weights = outcome.weights();
        assert_eq!(weights.len(), 2);
        assert!(weights.weight(&"m2".into()).is_none());
        assert_abs_diff_eq!(weights.weight(&"m0".into()).unwrap(), 0.5);
        assert_abs_diff_eq!(weights.weight(&"m1".into()).unwrap(), 0.5);
    }

    #[tokio::test]
    async fn test_spooled_trip_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&["a", "b", "c"]);
        config.breaker.spool_path = Some(dir.path().join("breaker.jsonl"));
        let journal = Arc::new(InMemoryBreakerJournal::new());
        journal.set_available(false);
        let provider = Arc::new(StaticReturnsProvider::new(4));

        let first = AllocationEngine::builder(config.clone(), provider.clone())
            .journal(journal.clone())
            .build()
            .unwrap();
        let status = first
            .trip_breaker(&"book".into(), "desk halt", None)
            .await
            .unwrap();
        assert!(status.is_tripped());
        assert_eq!(journal.len(), 0);

        journal.set_available(true);
        let second = AllocationEngine::builder(config, provider)
            .journal(journal.clone())
            .build()
            .unwrap();
        assert_eq!(second.restore_breakers().await.unwrap().applied, 1);
        assert!(second.breaker_status(&"book".into()).is_tripped());

        assert_eq!(second.flush_breaker_spool().await.unwrap(), 1);
        assert_eq!(journal.len(), 1);
        assert_eq!(second.flush_breaker_spool().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_cohort_and_infeasible_bounds() {
        let provider = Arc::new(StaticReturnsProvider::new(2));
        let engine = engine(config(&["a", "b"]), provider);

        assert!(matches!(
            engine.compute_weights(&"nope".into(), Scheme::MaxSharpe, None).await,
            Err(EngineError::UnknownCohort { .. })
        ));
        // Two members cannot reach a unit sum with a 0.40 cap.
        assert!(matches!(
            engine.compute_weights(&"book".into(), Scheme::MaxSharpe, None).await,
            Err(EngineError::InfeasibleBounds { members: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_falls_back_to_cache() {
        let provider = Arc::new(StaticReturnsProvider::with_series(
            4,
            [noisy("a", 24, 1), noisy("b", 24, 2), noisy("c", 24, 3)],
        ));
        let engine = engine(config(&["a", "b", "c"]), Arc::clone(&provider));
        let book: StrategyId = "book".into();

        let fresh = engine
            .compute_weights(&book, Scheme::MinVariance, None)
            .await
            .unwrap();
        let AllocationOutcome::Allocated(fresh) = fresh else {
            panic!("expected an allocation");
        };
        assert!(!fresh.stale);

        provider.set_delay(Some(Duration::from_secs(5)));
        let degraded = engine
            .compute_weights(&book, Scheme::MinVariance, None)
            .await
            .unwrap();
        let AllocationOutcome::Allocated(degraded) = degraded else {
            panic!("expected an allocation");
        };
        assert!(degraded.stale);
        assert_eq!(degraded.weights.values(), fresh.weights.values());
    }

    #[tokio::test]
    async fn test_unavailable_provider_without_cache_errors() {
        let provider = Arc::new(StaticReturnsProvider::with_series(
            4,
            [noisy("a", 24, 1), noisy("b", 24, 2), noisy("c", 24, 3)],
        ));
        provider.set_available(false);
        let engine = engine(config(&["a", "b", "c"]), Arc::clone(&provider));
        let err = engine
            .compute_weights(&"book".into(), Scheme::MaxSharpe, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Provider(ProviderError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_check_rules_raises_and_acknowledges() {
        let provider = Arc::new(StaticReturnsProvider::with_series(
            2,
            [weekly("carry", &[0.01, -0.05, 0.02, -0.03, 0.01])],
        ));
        let store = Arc::new(InMemoryAllocationStore::new());
        let engine = AllocationEngine::builder(config(&["a", "b", "c"]), provider)
            .store(store.clone())
            .build()
            .unwrap();
        let carry: StrategyId = "carry".into();
        engine
            .add_rule(RiskRule::new(
                carry.clone(),
                RiskMetric::Var95,
                Comparison::GreaterThan,
                0.01,
            )
            .unwrap())
            .unwrap();

        assert!(matches!(
            engine.check_rules(&carry).await,
            Err(EngineError::NoSnapshot { .. })
        ));

        let date = start() + Days::new(28);
        engine.evaluate_risk(&carry, date).await.unwrap();
        let alerts = engine.check_rules(&carry).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(engine.check_rules(&carry).await.unwrap().is_empty());

        let acked = engine.acknowledge_alert(alerts[0].id).await.unwrap();
        assert!(acked.acknowledged);
        assert_eq!(store.alerts(&carry).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_alert_kept_armed_until_stored() {
        let provider = Arc::new(StaticReturnsProvider::with_series(
            2,
            [weekly("carry", &[0.01, -0.05, 0.02, -0.03, 0.01])],
        ));
        let store = Arc::new(InMemoryAllocationStore::new());
        let engine = AllocationEngine::builder(config(&["a", "b", "c"]), provider)
            .store(store.clone())
            .build()
            .unwrap();
        let carry: StrategyId = "carry".into();
        engine
            .add_rule(RiskRule::new(
                carry.clone(),
                RiskMetric::Var95,
                Comparison::GreaterThan,
                0.01,
            )
            .unwrap())
            .unwrap();
        engine
            .evaluate_risk(&carry, start() + Days::new(28))
            .await
            .unwrap();

        store.set_available(false);
        assert!(matches!(
            engine.check_rules(&carry).await,
            Err(EngineError::Storage(StorageError::Unavailable { .. }))
        ));

        store.set_available(true);
        let alerts = engine.check_rules(&carry).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(engine.check_rules(&carry).await.unwrap().is_empty());
        assert_eq!(store.alerts(&carry).await.unwrap(), alerts);
        assert!(engine.acknowledge_alert(alerts[0].id).await.unwrap().acknowledged);
    }

    #[tokio::test]
    async fn test_turnover_law_across_cycles() {
        let provider = Arc::new(StaticReturnsProvider::with_series(
            4,
            (0..5).map(|i| noisy(&format!("m{i}"), 36, i)),
        ));
        let store = Arc::new(InMemoryAllocationStore::new());
        let engine = AllocationEngine::builder(
            config(&["m0", "m1", "m2", "m3", "m4"]),
            provider,
        )
        .store(store.clone())
        .build()
        .unwrap();
        let book: StrategyId = "book".into();

        let first = engine
            .compute_weights(&book, Scheme::RiskParity, None)
            .await
            .unwrap();
        let second = engine
            .compute_weights(&book, Scheme::RiskParity, None)
            .await
            .unwrap();
        assert_eq!(first.weights(), second.weights());
        assert_ne!(first.run_id(), second.run_id());
        assert_eq!(store.weight_records(&book), 1);
    }

    #[tokio::test]
    async fn test_cohorts_run_concurrently() {
        let provider = Arc::new(StaticReturnsProvider::with_series(
            4,
            (0..6).map(|i| noisy(&format!("m{i}"), 24, i)),
        ));
        let mut cfg = config(&["m0", "m1", "m2"]);
        cfg.cohorts.push(CohortConfig {
            strategy: "macro".into(),
            members: vec!["m3".into(), "m4".into(), "m5".into()],
        });
        let engine = engine(cfg, provider);
        let (book, other): (StrategyId, StrategyId) = ("book".into(), "macro".into());

        let (a, b, c) = tokio::join!(
            engine.compute_weights(&book, Scheme::MaxSharpe, None),
            engine.compute_weights(&book, Scheme::MaxSharpe, None),
            engine.compute_weights(&other, Scheme::MaxSharpe, None),
        );
        assert_eq!(a.unwrap().weights(), b.unwrap().weights());
        assert_eq!(c.unwrap().weights().len(), 3);
    }
}
