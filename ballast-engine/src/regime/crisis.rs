//! Crisis Composite Indicator.

#![allow(clippy::cast_precision_loss)]

use ballast_core::config::{ValidationContext, Validator};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// One macro indicator as delivered by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MacroReading {
    /// A precomputed z-score.
    ZScore(f64),
    /// Trailing levels, oldest first; z-scored here.
    Levels(Vec<f64>),
}

/// Indicator readings at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroSnapshot {
    /// Date of the readings.
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    /// Indicator name to reading.
    #[serde(default)]
    pub readings: BTreeMap<String, MacroReading>,
}

impl MacroSnapshot {
    /// A snapshot with no readings. Its CCI is zero.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adds a z-score reading.
    #[must_use]
    pub fn with_zscore(mut self, indicator: impl Into<String>, z: f64) -> Self {
        self.readings.insert(indicator.into(), MacroReading::ZScore(z));
        self
    }

    /// Adds a level history.
    #[must_use]
    pub fn with_levels(mut self, indicator: impl Into<String>, levels: Vec<f64>) -> Self {
        self.readings.insert(indicator.into(), MacroReading::Levels(levels));
        self
    }

    /// True with no readings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// CCI weights and level normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisConfig {
    /// Indicator importance. Normalized to unit sum when applied.
    #[serde(default = "default_weights")]
    pub weights: BTreeMap<String, f64>,
    /// Rolling window for z-scoring level histories.
    #[serde(default = "default_level_window")]
    pub level_window: usize,
}

fn default_weights() -> BTreeMap<String, f64> {
    [
        ("vix", 0.20),
        ("tnx", 0.10),
        ("tyx", 0.10),
        ("federal_funds_rate", 0.10),
        ("cpi", 0.10),
        ("unemployment_rate", 0.10),
        ("eurusd", 0.05),
        ("irx", 0.05),
        ("fvx", 0.05),
        ("real_gdp", 0.05),
        ("industrial_production", 0.05),
        ("consumer_sentiment", 0.05),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_level_window() -> usize {
    252
}

impl Default for CrisisConfig {
    fn default() -> Self {
        Self {
            weights: default_weights(),
            level_window: default_level_window(),
        }
    }
}

impl CrisisConfig {
    pub(crate) fn validate_into(&self, ctx: &mut ValidationContext) {
        ctx.enter("crisis");
        let mut v = Validator::new(ctx);
        v.positive("level_window", &self.level_window).custom(
            "weights",
            || {
                self.weights.values().all(|w| w.is_finite() && *w >= 0.0)
                    && self.weights.values().sum::<f64>() > 0.0
            },
            "must be non-negative with a positive sum",
        );
        ctx.exit();
    }
}

/// z-score of the last level against the trailing `window` levels.
///
/// Uses the sample standard deviation. Fewer than two levels or a flat
/// window give zero.
#[must_use]
pub fn level_zscore(levels: &[f64], window: usize) -> f64 {
    let start = levels.len().saturating_sub(window);
    let tail: Vec<f64> = levels[start..].iter().copied().filter(|v| v.is_finite()).collect();
    if tail.len() < 2 {
        return 0.0;
    }
    let n = tail.len() as f64;
    let mean = tail.iter().sum::<f64>() / n;
    let var = tail.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let sd = var.sqrt();
    if sd <= f64::EPSILON {
        return 0.0;
    }
    tail.last().map_or(0.0, |last| (last - mean) / sd)
}

/// Exposure multiplier for a CCI value.
///
/// `1.0` below 1, falling linearly to `0.7` at 2, then by `0.4` per unit with
/// a floor of `0.3`.
#[must_use]
pub fn crisis_scale(cci: f64) -> f64 {
    if !cci.is_finite() {
        return 0.3;
    }
    if cci < 1.0 {
        1.0
    } else if cci < 2.0 {
        1.0 - 0.3 * (cci - 1.0)
    } else {
        (0.7 - 0.4 * (cci - 2.0)).max(0.3)
    }
}

/// Computes the CCI from a [`MacroSnapshot`].
#[derive(Debug, Clone, Default)]
pub struct CrisisIndicator {
    config: CrisisConfig,
}

impl CrisisIndicator {
    /// Creates an indicator.
    #[must_use]
    pub fn new(config: CrisisConfig) -> Self {
        Self { config }
    }

    /// z-score per weighted indicator present in `snapshot`.
    #[must_use]
    pub fn z_scores(&self, snapshot: &MacroSnapshot) -> BTreeMap<String, f64> {
        snapshot
            .readings
            .iter()
            .filter(|(name, _)| self.config.weights.contains_key(*name))
            .map(|(name, reading)| {
                let z = match reading {
                    MacroReading::ZScore(z) => *z,
                    MacroReading::Levels(levels) => level_zscore(levels, self.config.level_window),
                };
                (name.clone(), if z.is_finite() { z } else { 0.0 })
            })
            .collect()
    }

    /// Weighted sum of positive z-scores. Missing indicators contribute zero.
    #[must_use]
    pub fn cci(&self, snapshot: &MacroSnapshot) -> f64 {
        let total: f64 = self.config.weights.values().sum();
        if total <= 0.0 {
            return 0.0;
        }
        let cci = self
            .z_scores(snapshot)
            .iter()
            .map(|(name, z)| {
                let weight = self.config.weights.get(name).copied().unwrap_or(0.0);
                weight / total * z.max(0.0)
            })
            .sum();
        debug!(cci, indicators = snapshot.readings.len(), "crisis indicator computed");
        cci
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn all_at(z: f64) -> MacroSnapshot {
        default_weights()
            .keys()
            .fold(MacroSnapshot::empty(), |s, k| s.with_zscore(k.clone(), z))
    }

    #[test]
    fn test_scale_breakpoints() {
        assert_abs_diff_eq!(crisis_scale(0.0), 1.0);
        assert_abs_diff_eq!(crisis_scale(0.99), 1.0);
        assert_abs_diff_eq!(crisis_scale(1.0), 1.0);
        assert_abs_diff_eq!(crisis_scale(1.5), 0.85, epsilon = 1e-12);
        assert_abs_diff_eq!(crisis_scale(2.0), 0.7, epsilon = 1e-12);
        assert_abs_diff_eq!(crisis_scale(2.5), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(crisis_scale(3.0), 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(crisis_scale(10.0), 0.3);
    }

    #[test]
    fn test_uniform_zscore_gives_same_cci() {
        let indicator = CrisisIndicator::default();
        assert_abs_diff_eq!(indicator.cci(&all_at(2.5)), 2.5, epsilon = 1e-12);
    }

    #[test]
    fn test_negative_zscores_contribute_nothing() {
        let indicator = CrisisIndicator::default();
        let snapshot = MacroSnapshot::empty()
            .with_zscore("vix", 3.0)
            .with_zscore("tnx", -4.0);
        assert_abs_diff_eq!(indicator.cci(&snapshot), 0.6, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_snapshot_is_zero() {
        assert_abs_diff_eq!(CrisisIndicator::default().cci(&MacroSnapshot::empty()), 0.0);
    }

    #[test]
    fn test_unweighted_indicators_ignored() {
        let snapshot = MacroSnapshot::empty().with_zscore("copper", 9.0);
        assert!(CrisisIndicator::default().z_scores(&snapshot).is_empty());
    }

    #[test]
    fn test_level_zscore() {
        // mean 2.5, sample sd of [1, 2, 3, 4] = 1.2910
        assert_abs_diff_eq!(level_zscore(&[1.0, 2.0, 3.0, 4.0], 252), 1.5 / 1.290_994_448_735_805_6, epsilon = 1e-12);
        assert_abs_diff_eq!(level_zscore(&[9.0, 1.0, 1.0, 1.0], 3), 0.0);
        assert_abs_diff_eq!(level_zscore(&[5.0], 252), 0.0);
    }

    #[test]
    fn test_reading_deserializes_untagged() {
        let snapshot: MacroSnapshot =
            serde_json::from_str(r#"{"readings":{"vix":1.5,"cpi":[1.0,2.0,3.0]}}"#).unwrap();
        assert_eq!(snapshot.readings["vix"], MacroReading::ZScore(1.5));
        assert!(matches!(snapshot.readings["cpi"], MacroReading::Levels(_)));
    }
}
