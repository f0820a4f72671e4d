//! Hard loss limits per strategy.
//!
//! A tripped breaker halts automated allocation for its strategy until an
//! operator resets it. Trips and resets are journaled before they take effect:
//! first to the [`BreakerJournal`] under a timeout, else to the local
//! [`TripSpool`]. If neither accepts the record the transition is rejected and
//! the in-memory state is left unchanged.
//!
//! # Example
//!
//! ```
//! use ballast_risk::{BreakerConfig, CircuitBreaker, InMemoryBreakerJournal};
//! use std::sync::Arc;
//!
//! let breaker = CircuitBreaker::new(
//!     BreakerConfig::default(),
//!     Arc::new(InMemoryBreakerJournal::new()),
//! );
//! assert!(!breaker.is_tripped(&"carry".into()));
//! ```

#![allow(clippy::cast_possible_truncation)]

use crate::analytics::RiskSnapshot;
use crate::error::BreakerError;
use crate::journal::{BreakerJournal, BreakerTransition, TransitionKind, TripSpool};
use ballast_core::config::{Configurable, EnvOverride, Validatable, ValidationContext, Validator};
use ballast_core::error::StorageError;
use ballast_core::types::StrategyId;
use ballast_telemetry::metrics::EngineMetrics;
use ballast_telemetry::spans::breaker_span;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, error, info, warn};

/// Loss limits for one strategy. Both are negative returns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerLimits {
    /// Trip when the trailing max drawdown reaches this value.
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,
    /// Trip when a single period return is at or below this value.
    #[serde(default)]
    pub max_period_loss: Option<f64>,
}

impl Default for BreakerLimits {
    fn default() -> Self {
        Self {
            max_drawdown: default_max_drawdown(),
            max_period_loss: None,
        }
    }
}

fn default_max_drawdown() -> f64 {
    -0.35
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_journal_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Default drawdown limit.
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,
    /// Default single-period loss limit.
    #[serde(default)]
    pub max_period_loss: Option<f64>,
    /// Minimum time between a trip and its reset.
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
    /// Bound on each journal append.
    #[serde(default = "default_journal_timeout", with = "humantime_serde")]
    pub journal_timeout: Duration,
    /// Local spool file; without one a journal outage rejects transitions.
    #[serde(default)]
    pub spool_path: Option<PathBuf>,
    /// Per-strategy limits replacing the defaults.
    #[serde(default)]
    pub overrides: BTreeMap<StrategyId, BreakerLimits>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_drawdown: default_max_drawdown(),
            max_period_loss: None,
            cooldown: default_cooldown(),
            journal_timeout: default_journal_timeout(),
            spool_path: None,
            overrides: BTreeMap::new(),
        }
    }
}

impl BreakerConfig {
    /// Limits in force for `strategy`.
    #[must_use]
    pub fn limits_for(&self, strategy: &StrategyId) -> BreakerLimits {
        self.overrides.get(strategy).copied().unwrap_or(BreakerLimits {
            max_drawdown: self.max_drawdown,
            max_period_loss: self.max_period_loss,
        })
    }
}

impl Validatable for BreakerConfig {
    fn validate_with_context(&self, ctx: &mut ValidationContext) {
        ctx.enter("breaker");
        let mut v = Validator::new(ctx);
        v.in_range("max_drawdown", &self.max_drawdown, &-1.0, &0.0)
            .non_zero_duration("journal_timeout", self.journal_timeout);
        if let Some(loss) = self.max_period_loss {
            v.in_range("max_period_loss", &loss, &-1.0, &0.0);
        }
        for (strategy, limits) in &self.overrides {
            v.in_range(
                &format!("overrides.{strategy}.max_drawdown"),
                &limits.max_drawdown,
                &-1.0,
                &0.0,
            );
            if let Some(loss) = limits.max_period_loss {
                v.in_range(
                    &format!("overrides.{strategy}.max_period_loss"),
                    &loss,
                    &-1.0,
                    &0.0,
                );
            }
        }
        ctx.exit();
    }
}

impl Configurable for BreakerConfig {
    fn apply_env_overrides(&mut self, prefix: &str) {
        EnvOverride::apply_number(&format!("{prefix}_BREAKER_MAX_DRAWDOWN"), &mut self.max_drawdown);
        EnvOverride::apply_optional_number(
            &format!("{prefix}_BREAKER_MAX_PERIOD_LOSS"),
            &mut self.max_period_loss,
        );
        EnvOverride::apply_duration_ms(&format!("{prefix}_BREAKER_COOLDOWN_MS"), &mut self.cooldown);
        EnvOverride::apply_duration_ms(
            &format!("{prefix}_BREAKER_JOURNAL_TIMEOUT_MS"),
            &mut self.journal_timeout,
        );
        if let Ok(path) = std::env::var(format!("{prefix}_BREAKER_SPOOL_PATH")) {
            self.spool_path = (!path.trim().is_empty()).then(|| PathBuf::from(path));
        }
    }

    fn env_var_names(prefix: &str) -> Vec<String> {
        vec![
            format!("{prefix}_BREAKER_MAX_DRAWDOWN"),
            format!("{prefix}_BREAKER_MAX_PERIOD_LOSS"),
            format!("{prefix}_BREAKER_COOLDOWN_MS"),
            format!("{prefix}_BREAKER_JOURNAL_TIMEOUT_MS"),
            format!("{prefix}_BREAKER_SPOOL_PATH"),
        ]
    }
}

/// Why a breaker tripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripCause {
    /// Trailing drawdown reached the limit.
    Drawdown {
        /// Drawdown observed.
        observed: f64,
        /// Configured limit.
        limit: f64,
    },
    /// A single period lost at least the limit.
    PeriodLoss {
        /// Period return observed.
        observed: f64,
        /// Configured limit.
        limit: f64,
    },
    /// Operator halt.
    Manual {
        /// Free-text reason.
        reason: String,
        /// Who tripped it.
        #[serde(default)]
        operator: Option<String>,
    },
}

impl TripCause {
    /// Short label used in metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Drawdown { .. } => "drawdown",
            Self::PeriodLoss { .. } => "period_loss",
            Self::Manual { .. } => "manual",
        }
    }
}

impl fmt::Display for TripCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drawdown { observed, limit } => {
                write!(f, "drawdown {observed:.4} breached limit {limit:.4}")
            }
            Self::PeriodLoss { observed, limit } => {
                write!(f, "period loss {observed:.4} breached limit {limit:.4}")
            }
            Self::Manual { reason, operator } => match operator {
                Some(op) => write!(f, "manual halt by {op}: {reason}"),
                None => write!(f, "manual halt: {reason}"),
            },
        }
    }
}

/// Externally visible breaker status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BreakerStatus {
    /// Allocation allowed.
    Ok,
    /// Allocation halted.
    Tripped {
        /// Why.
        cause: TripCause,
        /// Since when.
        since: DateTime<Utc>,
    },
}

impl BreakerStatus {
    /// True when halted.
    #[must_use]
    pub const fn is_tripped(&self) -> bool {
        matches!(self, Self::Tripped { .. })
    }
}

/// Per-strategy breaker record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    /// Strategy key.
    pub strategy: StrategyId,
    /// Whether allocation is halted.
    pub tripped: bool,
    /// Cause of the latest trip.
    pub cause: Option<TripCause>,
    /// Time of the latest trip.
    pub tripped_at: Option<DateTime<Utc>>,
    /// Time of the latest reset.
    pub reset_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    fn new(strategy: StrategyId) -> Self {
        Self {
            strategy,
            tripped: false,
            cause: None,
            tripped_at: None,
            reset_at: None,
        }
    }

    /// Status derived from this record.
    #[must_use]
    pub fn status(&self) -> BreakerStatus {
        match (self.tripped, &self.cause, self.tripped_at) {
            (true, Some(cause), Some(since)) => BreakerStatus::Tripped {
                cause: cause.clone(),
                since,
            },
            _ => BreakerStatus::Ok,
        }
    }
}

/// Where a transition was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Accepted by the primary journal.
    Journaled,
    /// Written to the local spool, awaiting replay.
    Spooled,
}

/// Outcome of [`CircuitBreaker::restore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Distinct transitions applied.
    pub applied: usize,
    /// Set when the journal could not be read.
    pub journal_error: Option<StorageError>,
    /// Set when the spool could not be read.
    pub spool_error: Option<StorageError>,
}

impl RestoreReport {
    /// True when some source was skipped.
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        self.journal_error.is_some() || self.spool_error.is_some()
    }
}

/// Hard-limit circuit breaker keyed by strategy.
pub struct CircuitBreaker {
    config: BreakerConfig,
    journal: Arc<dyn BreakerJournal>,
    spool: Option<TripSpool>,
    states: DashMap<StrategyId, CircuitBreakerState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("spool", &self.spool)
            .field("tracked", &self.states.len())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a breaker writing transitions to `journal`.
    #[must_use]
    pub fn new(config: BreakerConfig, journal: Arc<dyn BreakerJournal>) -> Self {
        let spool = config
            .spool_path
            .clone()
            .map(|path| TripSpool::new(path).with_timeout(config.journal_timeout));
        Self {
            config,
            journal,
            spool,
            states: DashMap::new(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current status of `strategy`.
    #[must_use]
    pub fn status(&self, strategy: &StrategyId) -> BreakerStatus {
        self.states
            .get(strategy)
            .map_or(BreakerStatus::Ok, |s| s.status())
    }

    /// Full record of `strategy`.
    #[must_use]
    pub fn state(&self, strategy: &StrategyId) -> CircuitBreakerState {
        self.states
            .get(strategy)
            .map_or_else(|| CircuitBreakerState::new(strategy.clone()), |s| s.clone())
    }

    /// True if `strategy` is halted.
    #[must_use]
    pub fn is_tripped(&self, strategy: &StrategyId) -> bool {
        self.states.get(strategy).is_some_and(|s| s.tripped)
    }

    /// Strategies currently halted, sorted.
    #[must_use]
    pub fn tripped_strategies(&self) -> Vec<StrategyId> {
        let mut tripped: Vec<StrategyId> = self
            .states
            .iter()
            .filter(|s| s.tripped)
            .map(|s| s.key().clone())
            .collect();
        tripped.sort();
        tripped
    }

    /// Limit breached by `snapshot`, if any. Drawdown is checked first.
    #[must_use]
    pub fn check(&self, snapshot: &RiskSnapshot) -> Option<TripCause> {
        let limits = self.config.limits_for(&snapshot.strategy);
        if snapshot.max_drawdown <= limits.max_drawdown {
            return Some(TripCause::Drawdown {
                observed: snapshot.max_drawdown,
                limit: limits.max_drawdown,
            });
        }
        if let Some(limit) = limits.max_period_loss
            && snapshot.latest_return <= limit
        {
            return Some(TripCause::PeriodLoss {
                observed: snapshot.latest_return,
                limit,
            });
        }
        None
    }

    /// Trips the snapshot's strategy if a limit is breached.
    pub async fn observe(&self, snapshot: &RiskSnapshot) -> Result<BreakerStatus, BreakerError> {
        match self.check(snapshot) {
            Some(cause) => self.trip(&snapshot.strategy, cause).await,
            None => Ok(self.status(&snapshot.strategy)),
        }
    }

    /// Trips `strategy` now.
    pub async fn trip(
        &self,
        strategy: &StrategyId,
        cause: TripCause,
    ) -> Result<BreakerStatus, BreakerError> {
        self.trip_at(strategy, cause, Utc::now()).await
    }

    /// Trips `strategy` at `at`.
    ///
    /// Tripping an already tripped breaker keeps the original cause and time.
    pub async fn trip_at(
        &self,
        strategy: &StrategyId,
        cause: TripCause,
        at: DateTime<Utc>,
    ) -> Result<BreakerStatus, BreakerError> {
        let existing = self.status(strategy);
        if existing.is_tripped() {
            return Ok(existing);
        }

        let transition = BreakerTransition::trip(strategy.clone(), cause.clone(), at);
        let durability = self
            .persist(&transition)
            .instrument(breaker_span(strategy.as_str(), TransitionKind::Trip.as_str()))
            .await?;
        self.apply(&transition);

        error!(
            strategy = %strategy,
            cause = %cause,
            durability = ?durability,
            "CIRCUIT BREAKER TRIPPED"
        );
        EngineMetrics::breaker_trip(strategy.as_str(), cause.as_str());
        Ok(self.status(strategy))
    }

    /// Resets `strategy` now.
    pub async fn reset(&self, strategy: &StrategyId) -> Result<Durability, BreakerError> {
        self.reset_at(strategy, Utc::now()).await
    }

    /// Resets `strategy` at `at`.
    ///
    /// Fails with `NotTripped` if the breaker is not tripped and with
    /// `CooldownActive` before the cool-down since the trip has elapsed.
    pub async fn reset_at(
        &self,
        strategy: &StrategyId,
        at: DateTime<Utc>,
    ) -> Result<Durability, BreakerError> {
        let state = self.state(strategy);
        let since = match (state.tripped, state.tripped_at) {
            (true, Some(since)) => since,
            _ => {
                return Err(BreakerError::NotTripped {
                    strategy: strategy.to_string(),
                });
            }
        };

        let elapsed = (at - since).to_std().unwrap_or(Duration::ZERO);
        if elapsed < self.config.cooldown {
            let remaining = self.config.cooldown - elapsed;
            return Err(BreakerError::CooldownActive {
                strategy: strategy.to_string(),
                remaining_secs: remaining.as_secs_f64().ceil() as u64,
            });
        }

        let transition = BreakerTransition::reset(strategy.clone(), at);
        let durability = self
            .persist(&transition)
            .instrument(breaker_span(strategy.as_str(), TransitionKind::Reset.as_str()))
            .await?;
        self.apply(&transition);

        info!(strategy = %strategy, durability = ?durability, "circuit breaker reset");
        Ok(durability)
    }

    /// Replays spooled transitions into the journal. Returns the number replayed.
    pub async fn flush_spool(&self) -> Result<usize, BreakerError> {
        match &self.spool {
            Some(spool) => Ok(spool
                .drain_into(self.journal.as_ref(), self.config.journal_timeout)
                .await?),
            None => Ok(0),
        }
    }

    /// Rebuilds in-memory state from the journal and the spool.
    ///
    /// Transitions are applied in time order; duplicates (a spooled record
    /// that also reached the journal) are applied once. A source that cannot
    /// be read is logged and skipped, so spooled trips still halt their
    /// strategies while the journal is down. Fails only when no source could
    /// be read at all.
    pub async fn restore(&self) -> Result<RestoreReport, BreakerError> {
        let journal = tokio::time::timeout(self.config.journal_timeout, self.journal.load())
            .await
            .unwrap_or_else(|_| {
                Err(StorageError::Timeout {
                    operation: "breaker_journal.load".to_string(),
                    timeout_ms: self.config.journal_timeout.as_millis() as u64,
                })
            });
        let spool = match &self.spool {
            Some(spool) => Some(spool.pending().await),
            None => None,
        };

        let mut report = RestoreReport::default();
        let mut transitions = Vec::new();
        match journal {
            Ok(loaded) => transitions.extend(loaded),
            Err(e) => {
                warn!(error = %e, "breaker journal unreadable, restoring from spool only");
                report.journal_error = Some(e);
            }
        }
        match spool {
            Some(Ok(pending)) => transitions.extend(pending),
            Some(Err(e)) => {
                warn!(error = %e, "breaker spool unreadable");
                report.spool_error = Some(e);
            }
            None => {}
        }
        if let Some(e) = &report.journal_error
            && (self.spool.is_none() || report.spool_error.is_some())
        {
            return Err(e.clone().into());
        }

        transitions.sort_by_key(|t| t.at);
        let mut seen = HashSet::new();
        for transition in transitions.iter().filter(|t| seen.insert(t.id)) {
            self.apply(transition);
            report.applied += 1;
        }
        info!(
            applied = report.applied,
            partial = report.is_partial(),
            tripped = self.tripped_strategies().len(),
            "breaker state restored"
        );
        Ok(report)
    }

    async fn persist(&self, transition: &BreakerTransition) -> Result<Durability, BreakerError> {
        if let Some(spool) = &self.spool
            && let Err(e) = spool
                .drain_into(self.journal.as_ref(), self.config.journal_timeout)
                .await
        {
            warn!(error = %e, "breaker spool flush failed");
        }

        let journal_error =
            match tokio::time::timeout(self.config.journal_timeout, self.journal.append(transition))
                .await
            {
                Ok(Ok(())) => return Ok(Durability::Journaled),
                Ok(Err(e)) => e,
                Err(_) => StorageError::Timeout {
                    operation: "breaker_journal.append".to_string(),
                    timeout_ms: self.config.journal_timeout.as_millis() as u64,
                },
            };
        warn!(
            strategy = %transition.strategy,
            error = %journal_error,
            "breaker journal unavailable, spooling transition"
        );

        let Some(spool) = &self.spool else {
            return Err(BreakerError::NotDurable {
                strategy: transition.strategy.to_string(),
                reason: journal_error.to_string(),
            });
        };
        match spool.append(transition).await {
            Ok(()) => {
                EngineMetrics::breaker_spooled();
                Ok(Durability::Spooled)
            }
            Err(spool_error) => {
                error!(
                    strategy = %transition.strategy,
                    journal_error = %journal_error,
                    spool_error = %spool_error,
                    "breaker transition not durable"
                );
                Err(BreakerError::NotDurable {
                    strategy: transition.strategy.to_string(),
                    reason: spool_error.to_string(),
                })
            }
        }
    }

    fn apply(&self, transition: &BreakerTransition) {
        let mut state = self
            .states
            .entry(transition.strategy.clone())
            .or_insert_with(|| CircuitBreakerState::new(transition.strategy.clone()));
        match transition.kind {
            TransitionKind::Trip => {
                state.tripped = true;
                state.cause.clone_from(&transition.cause);
                state.tripped_at = Some(transition.at);
            }
            TransitionKind::Reset => {
                state.tripped = false;
                state.reset_at = Some(transition.at);
            }
        }
    }
}
