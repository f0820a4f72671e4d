//! Capital weight vectors.

use super::StrategyId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tolerance for the unit-sum invariant.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

/// Allocation of capital across strategies.
///
/// `weights` sum to one (or are all zero when allocation is halted) and each
/// lies in the configured allocation bounds. `exposure` is the invested
/// fraction of capital after regime de-leveraging: the shortfall from one is
/// held as cash, so the invested amount for a strategy is `weight * exposure`.
///
/// # Examples
///
/// ```
/// use ballast_core::types::{StrategyId, WeightVector};
///
/// let ids = vec![StrategyId::from("a"), StrategyId::from("b")];
/// let weights = WeightVector::equal(&ids).with_exposure(0.5);
/// assert!((weights.sum() - 1.0).abs() < 1e-12);
/// assert!((weights.gross_exposure() - 0.5).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    weights: BTreeMap<StrategyId, f64>,
    #[serde(default = "default_exposure")]
    exposure: f64,
}

fn default_exposure() -> f64 {
    1.0
}

impl WeightVector {
    /// Creates a weight vector at full exposure.
    #[must_use]
    pub fn new(weights: BTreeMap<StrategyId, f64>) -> Self {
        Self {
            weights,
            exposure: 1.0,
        }
    }

    /// Creates a weight vector from `(strategy, weight)` pairs.
    #[must_use]
    pub fn from_pairs(pairs: impl IntoIterator<Item = (StrategyId, f64)>) -> Self {
        Self::new(pairs.into_iter().collect())
    }

    /// Uniform allocation over `strategies`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn equal(strategies: &[StrategyId]) -> Self {
        let w = if strategies.is_empty() {
            0.0
        } else {
            1.0 / strategies.len() as f64
        };
        Self::from_pairs(strategies.iter().map(|s| (s.clone(), w)))
    }

    /// All-zero allocation: every strategy halted, nothing invested.
    #[must_use]
    pub fn halted(strategies: &[StrategyId]) -> Self {
        Self {
            weights: strategies.iter().map(|s| (s.clone(), 0.0)).collect(),
            exposure: 0.0,
        }
    }

    /// Returns a copy with the given exposure.
    #[must_use]
    pub fn with_exposure(mut self, exposure: f64) -> Self {
        self.exposure = exposure;
        self
    }

    /// Weight of a strategy, if present.
    #[must_use]
    pub fn weight(&self, strategy: &StrategyId) -> Option<f64> {
        self.weights.get(strategy).copied()
    }

    /// Invested fraction of capital for a strategy.
    #[must_use]
    pub fn invested(&self, strategy: &StrategyId) -> Option<f64> {
        self.weight(strategy).map(|w| w * self.exposure)
    }

    /// Iterates `(strategy, weight)` in strategy order.
    pub fn iter(&self) -> impl Iterator<Item = (&StrategyId, f64)> {
        self.weights.iter().map(|(k, v)| (k, *v))
    }

    /// Strategies in order.
    #[must_use]
    pub fn strategies(&self) -> Vec<StrategyId> {
        self.weights.keys().cloned().collect()
    }

    /// Weights in strategy order.
    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.weights.values().copied().collect()
    }

    /// The underlying map.
    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<StrategyId, f64> {
        &self.weights
    }

    /// Number of strategies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// True if no strategies are allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Sum of weights.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.weights.values().sum()
    }

    /// Invested fraction of capital.
    #[must_use]
    pub fn exposure(&self) -> f64 {
        self.exposure
    }

    /// Sum of invested fractions.
    #[must_use]
    pub fn gross_exposure(&self) -> f64 {
        self.weights.values().map(|w| w.abs()).sum::<f64>() * self.exposure
    }

    /// True when allocation is halted.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.weights.values().all(|w| *w == 0.0)
    }

    /// True when weights sum to one within [`WEIGHT_SUM_TOLERANCE`].
    #[must_use]
    pub fn is_unit_sum(&self) -> bool {
        (self.sum() - 1.0).abs() <= WEIGHT_SUM_TOLERANCE
    }

    /// True when every weight lies in `[min, max]` within `tolerance`.
    #[must_use]
    pub fn within_bounds(&self, min: f64, max: f64, tolerance: f64) -> bool {
        self.weights
            .values()
            .all(|w| *w >= min - tolerance && *w <= max + tolerance)
    }

    /// True when both vectors cover exactly the same strategies.
    #[must_use]
    pub fn same_strategies(&self, other: &Self) -> bool {
        self.weights.len() == other.weights.len()
            && self.weights.keys().all(|k| other.weights.contains_key(k))
    }

    /// Total absolute weight change against `previous`. Strategies missing
    /// from one side count with weight zero.
    #[must_use]
    pub fn turnover(&self, previous: &Self) -> f64 {
        let mut total: f64 = self
            .weights
            .iter()
            .map(|(k, w)| (w - previous.weight(k).unwrap_or(0.0)).abs())
            .sum();
        total += previous
            .weights
            .iter()
            .filter(|(k, _)| !self.weights.contains_key(*k))
            .map(|(_, w)| w.abs())
            .sum::<f64>();
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ids(names: &[&str]) -> Vec<StrategyId> {
        names.iter().map(|n| StrategyId::from(*n)).collect()
    }

    #[test]
    fn test_equal_weights_sum_to_one() {
        let w = WeightVector::equal(&ids(&["a", "b", "c"]));
        assert!(w.is_unit_sum());
        assert_abs_diff_eq!(w.weight(&"b".into()).unwrap(), 1.0 / 3.0, epsilon = 1e-15);
    }

    #[test]
    fn test_halted_vector() {
        let w = WeightVector::halted(&ids(&["a", "b"]));
        assert!(w.is_halted());
        assert_abs_diff_eq!(w.sum(), 0.0);
        assert_abs_diff_eq!(w.gross_exposure(), 0.0);
    }

    #[test]
    fn test_exposure_scales_investment_not_weights() {
        let w = WeightVector::from_pairs([("a".into(), 0.25), ("b".into(), 0.75)]).with_exposure(0.5);
        assert!(w.is_unit_sum());
        assert_abs_diff_eq!(w.invested(&"b".into()).unwrap(), 0.375);
        assert_abs_diff_eq!(w.gross_exposure(), 0.5);
    }

    #[test]
    fn test_turnover_counts_dropped_strategies() {
        let prev = WeightVector::from_pairs([("a".into(), 0.5), ("b".into(), 0.5)]);
        let next = WeightVector::from_pairs([("a".into(), 0.6), ("c".into(), 0.4)]);
        assert_abs_diff_eq!(next.turnover(&prev), 0.1 + 0.4 + 0.5, epsilon = 1e-12);
        assert!(!next.same_strategies(&prev));
    }

    #[test]
    fn test_bounds_check() {
        let w = WeightVector::from_pairs([("a".into(), 0.02), ("b".into(), 0.98)]);
        assert!(!w.within_bounds(0.02, 0.40, 1e-12));
        assert!(w.within_bounds(0.02, 1.0, 1e-12));
    }

    #[test]
    fn test_deserialize_defaults_exposure() {
        let w: WeightVector = serde_json::from_str(r#"{"weights":{"a":1.0}}"#).unwrap();
        assert_abs_diff_eq!(w.exposure(), 1.0);
    }
}
