//! Input collaborators: return histories and macro readings.

use crate::error::ProviderError;
use crate::regime::MacroSnapshot;
use async_trait::async_trait;
use ballast_core::types::{ReturnSeries, StrategyId};
use chrono::NaiveDate;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Source of per-strategy return histories.
#[async_trait]
pub trait ReturnsProvider: Send + Sync {
    /// The latest `window` periods of `strategy`, oldest first.
    ///
    /// Returns [`ProviderError::InsufficientData`] when the provider holds
    /// fewer periods than its configured minimum.
    async fn get_returns(
        &self,
        strategy: &StrategyId,
        window: usize,
    ) -> Result<ReturnSeries, ProviderError>;

    /// The `window` periods of `strategy` ending at or before `date`.
    async fn get_returns_until(
        &self,
        strategy: &StrategyId,
        date: NaiveDate,
        window: usize,
    ) -> Result<ReturnSeries, ProviderError> {
        let full = self.get_returns(strategy, usize::MAX).await?;
        Ok(full.up_to(date).tail(window))
    }
}

/// Source of macro stress readings.
#[async_trait]
pub trait MacroProvider: Send + Sync {
    /// Current indicator readings.
    async fn macro_snapshot(&self) -> Result<MacroSnapshot, ProviderError>;
}

/// Macro provider for deployments without a macro feed. Its CCI is zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMacroProvider;

#[async_trait]
impl MacroProvider for NullMacroProvider {
    async fn macro_snapshot(&self) -> Result<MacroSnapshot, ProviderError> {
        Ok(MacroSnapshot::empty())
    }
}

/// Fault switches shared by the in-memory providers.
#[derive(Debug)]
struct Faults {
    available: AtomicBool,
    delay: RwLock<Option<Duration>>,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            available: AtomicBool::new(true),
            delay: RwLock::new(None),
        }
    }
}

impl Faults {
    async fn apply(&self, collaborator: &str) -> Result<(), ProviderError> {
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProviderError::Unavailable {
                collaborator: collaborator.to_string(),
                reason: "provider offline".to_string(),
            })
        }
    }
}

/// Returns provider over series held in memory.
///
/// Used by the CLI (series loaded from a file) and by tests, which can make
/// it slow or unavailable.
#[derive(Debug, Default)]
pub struct StaticReturnsProvider {
    series: RwLock<HashMap<StrategyId, ReturnSeries>>,
    min_periods: usize,
    faults: Faults,
}

impl StaticReturnsProvider {
    /// Creates an empty provider signalling insufficient data below
    /// `min_periods`.
    #[must_use]
    pub fn new(min_periods: usize) -> Self {
        Self {
            min_periods,
            ..Self::default()
        }
    }

    /// Creates a provider holding `series`.
    #[must_use]
    pub fn with_series(min_periods: usize, series: impl IntoIterator<Item = ReturnSeries>) -> Self {
        let provider = Self::new(min_periods);
        for s in series {
            provider.insert(s);
        }
        provider
    }

    /// Adds or replaces a series.
    pub fn insert(&self, series: ReturnSeries) {
        self.series.write().insert(series.strategy().clone(), series);
    }

    /// Simulates the provider going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.faults.available.store(available, Ordering::SeqCst);
    }

    /// Delays every call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.faults.delay.write() = delay;
    }
}

#[async_trait]
impl ReturnsProvider for StaticReturnsProvider {
    async fn get_returns(
        &self,
        strategy: &StrategyId,
        window: usize,
    ) -> Result<ReturnSeries, ProviderError> {
        self.faults.apply("returns").await?;
        let series = self
            .series
            .read()
            .get(strategy)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound {
                strategy: strategy.to_string(),
            })?;
        if series.len() < self.min_periods {
            return Err(ProviderError::InsufficientData {
                strategy: strategy.to_string(),
                available: series.len(),
                required: self.min_periods,
            });
        }
        Ok(series.tail(window))
    }
}

/// Macro provider returning a fixed snapshot.
#[derive(Debug, Default)]
pub struct StaticMacroProvider {
    snapshot: RwLock<MacroSnapshot>,
    faults: Faults,
}

impl StaticMacroProvider {
    /// Creates a provider returning `snapshot`.
    #[must_use]
    pub fn new(snapshot: MacroSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
            faults: Faults::default(),
        }
    }

    /// Replaces the snapshot.
    pub fn set(&self, snapshot: MacroSnapshot) {
        *self.snapshot.write() = snapshot;
    }

    /// Simulates the provider going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.faults.available.store(available, Ordering::SeqCst);
    }

    /// Delays every call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.faults.delay.write() = delay;
    }
}

#[async_trait]
impl MacroProvider for StaticMacroProvider {
    async fn macro_snapshot(&self) -> Result<MacroSnapshot, ProviderError> {
        self.faults.apply("macro").await?;
        Ok(self.snapshot.read().clone())
    }
}
