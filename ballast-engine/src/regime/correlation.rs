//! Correlation regime classification.
//!
//! The rolling average pairwise correlation of the cohort's returns is fit
//! with a two-component Gaussian mixture; the current observation is stressed
//! when it belongs to the higher-mean component and that mean is above
//! `stress_correlation`. High average volatility also counts as stressed.
//!
//! The fit is a pure function of the window. With `every_n_cycles` the caller
//! may hand back a previous [`CachedFit`] to be reused until it ages out.

#![allow(clippy::cast_precision_loss)]

use ballast_core::config::{ValidationContext, Validator};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use tracing::debug;

const VARIANCE_FLOOR: f64 = 1e-6;

/// Correlation regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    /// Normal conditions.
    #[default]
    Calm,
    /// Elevated correlation or volatility.
    Stressed,
}

impl Regime {
    /// Stable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Calm => "calm",
            Self::Stressed => "stressed",
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How often the mixture is refit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefitCadence {
    /// Fit from the current window on every allocation.
    #[default]
    EveryCycle,
    /// Reuse a fit for this many cycles.
    EveryNCycles(u32),
}

/// Correlation regime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRegimeConfig {
    /// Periods per rolling correlation.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Rolling observations kept for the fit. A lookback of `L` periods
    /// yields at most `L - window + 1`, so raise both together.
    #[serde(default = "default_max_observations")]
    pub max_observations: usize,
    /// Component mean above which the regime is stressed.
    #[serde(default = "default_stress_correlation")]
    pub stress_correlation: f64,
    /// Average per-period volatility above which the regime is stressed.
    #[serde(default = "default_volatility_ceiling")]
    pub volatility_ceiling: f64,
    /// Exposure multiplier in the stressed regime.
    #[serde(default = "default_stressed_multiplier")]
    pub stressed_multiplier: f64,
    /// Refit cadence.
    #[serde(default)]
    pub refit: RefitCadence,
    /// EM iteration bound.
    #[serde(default = "default_em_iterations")]
    pub em_max_iterations: usize,
    /// EM log-likelihood tolerance.
    #[serde(default = "default_em_tolerance")]
    pub em_tolerance: f64,
}

fn default_window() -> usize {
    20
}

/// Every rolling observation the default 36-period lookback yields.
fn default_max_observations() -> usize {
    17
}

fn default_stress_correlation() -> f64 {
    0.7
}

fn default_volatility_ceiling() -> f64 {
    0.04
}

fn default_stressed_multiplier() -> f64 {
    0.8
}

fn default_em_iterations() -> usize {
    100
}

fn default_em_tolerance() -> f64 {
    1e-6
}

impl Default for CorrelationRegimeConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            max_observations: default_max_observations(),
            stress_correlation: default_stress_correlation(),
            volatility_ceiling: default_volatility_ceiling(),
            stressed_multiplier: default_stressed_multiplier(),
            refit: RefitCadence::default(),
            em_max_iterations: default_em_iterations(),
            em_tolerance: default_em_tolerance(),
        }
    }
}

impl CorrelationRegimeConfig {
    pub(crate) fn validate_into(&self, ctx: &mut ValidationContext) {
        ctx.enter("correlation");
        let mut v = Validator::new(ctx);
        v.custom("window", || self.window >= 2, "must be at least 2")
            .positive("max_observations", &self.max_observations)
            .in_range("stress_correlation", &self.stress_correlation, &-1.0, &1.0)
            .positive("volatility_ceiling", &self.volatility_ceiling)
            .in_range("stressed_multiplier", &self.stressed_multiplier, &0.0, &1.0)
            .positive("em_max_iterations", &self.em_max_iterations)
            .positive("em_tolerance", &self.em_tolerance);
        if let RefitCadence::EveryNCycles(n) = self.refit {
            v.positive("refit.every_n_cycles", &n);
        }
        ctx.exit();
    }
}

/// Two-component univariate Gaussian mixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureFit {
    /// Component means.
    pub means: [f64; 2],
    /// Component variances.
    pub variances: [f64; 2],
    /// Mixing weights.
    pub weights: [f64; 2],
    /// EM iterations run.
    pub iterations: usize,
    /// Log-likelihood change fell below tolerance.
    pub converged: bool,
}

impl MixtureFit {
    /// Fits by expectation-maximization, initializing the means at the sample
    /// minimum and maximum. `None` for fewer than two finite observations.
    #[must_use]
    pub fn fit(observations: &[f64], max_iterations: usize, tolerance: f64) -> Option<Self> {
        let xs: Vec<f64> = observations.iter().copied().filter(|x| x.is_finite()).collect();
        if xs.len() < 2 {
            return None;
        }
        let n = xs.len() as f64;
        let mean = xs.iter().sum::<f64>() / n;
        let var = (xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).max(VARIANCE_FLOOR);
        let lo = xs.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mut fit = Self {
            means: [lo, hi],
            variances: [var, var],
            weights: [0.5, 0.5],
            iterations: 0,
            converged: false,
        };
        let mut previous_ll = f64::NEG_INFINITY;
        let mut resp = vec![[0.0_f64; 2]; xs.len()];

        for iteration in 1..=max_iterations {
            let mut ll = 0.0;
            for (x, r) in xs.iter().zip(resp.iter_mut()) {
                let l0 = fit.log_joint(0, *x);
                let l1 = fit.log_joint(1, *x);
                let m = l0.max(l1);
                let norm = m + ((l0 - m).exp() + (l1 - m).exp()).ln();
                r[0] = (l0 - norm).exp();
                r[1] = (l1 - norm).exp();
                ll += norm;
            }

            for k in 0..2 {
                let nk: f64 = resp.iter().map(|r| r[k]).sum();
                if nk <= f64::EPSILON {
                    continue;
                }
                let mu = resp.iter().zip(&xs).map(|(r, x)| r[k] * x).sum::<f64>() / nk;
                let var = resp
                    .iter()
                    .zip(&xs)
                    .map(|(r, x)| r[k] * (x - mu).powi(2))
                    .sum::<f64>()
                    / nk;
                fit.means[k] = mu;
                fit.variances[k] = var.max(VARIANCE_FLOOR);
                fit.weights[k] = nk / n;
            }

            fit.iterations = iteration;
            if (ll - previous_ll).abs() < tolerance {
                fit.converged = true;
                break;
            }
            previous_ll = ll;
        }
        Some(fit)
    }

    fn log_joint(&self, k: usize, x: f64) -> f64 {
        let var = self.variances[k];
        self.weights[k].max(f64::MIN_POSITIVE).ln()
            - 0.5 * (2.0 * PI * var).ln()
            - (x - self.means[k]).powi(2) / (2.0 * var)
    }

    /// Most likely component for `x`.
    #[must_use]
    pub fn predict(&self, x: f64) -> usize {
        usize::from(self.log_joint(1, x) > self.log_joint(0, x))
    }

    /// Index of the component with the higher mean.
    #[must_use]
    pub fn high_component(&self) -> usize {
        usize::from(self.means[1] > self.means[0])
    }
}

/// A fit carried between cycles under [`RefitCadence::EveryNCycles`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedFit {
    /// The fit.
    pub fit: MixtureFit,
    /// Cycles the fit has been used for.
    pub uses: u32,
}

/// Result of one classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationReading {
    /// Regime.
    pub regime: Regime,
    /// Latest rolling average pairwise correlation.
    pub average_correlation: f64,
    /// Average per-period standard deviation over the latest window.
    pub average_volatility: f64,
    /// Exposure multiplier.
    pub multiplier: f64,
    /// Rolling observations used.
    pub observations: usize,
    /// The mixture was fit this cycle.
    pub refit: bool,
}

impl CorrelationReading {
    /// Calm reading with no statistics.
    #[must_use]
    pub fn calm() -> Self {
        Self {
            regime: Regime::Calm,
            average_correlation: 0.0,
            average_volatility: 0.0,
            multiplier: 1.0,
            observations: 0,
            refit: false,
        }
    }
}

/// Average Pearson correlation over all column pairs of rows
/// `start..start + len`. Pairs involving a zero-variance column are skipped.
#[must_use]
pub fn average_pairwise_correlation(values: &DMatrix<f64>, start: usize, len: usize) -> f64 {
    let n = values.ncols();
    let view = values.rows(start, len);
    let means: Vec<f64> = (0..n).map(|j| view.column(j).mean()).collect();
    let centered: Vec<Vec<f64>> = (0..n)
        .map(|j| view.column(j).iter().map(|v| v - means[j]).collect())
        .collect();
    let norms: Vec<f64> = centered
        .iter()
        .map(|c| c.iter().map(|v| v * v).sum::<f64>().sqrt())
        .collect();

    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            if norms[i] <= f64::EPSILON || norms[j] <= f64::EPSILON {
                continue;
            }
            let dot: f64 = centered[i].iter().zip(&centered[j]).map(|(a, b)| a * b).sum();
            total += dot / (norms[i] * norms[j]);
            pairs += 1;
        }
    }
    if pairs == 0 { 0.0 } else { total / pairs as f64 }
}

/// Average sample standard deviation of the columns over rows `start..start+len`.
#[must_use]
pub fn average_volatility(values: &DMatrix<f64>, start: usize, len: usize) -> f64 {
    let n = values.ncols();
    if n == 0 || len < 2 {
        return 0.0;
    }
    let view = values.rows(start, len);
    // nalgebra's variance divides by the length
    let correction = len as f64 / (len as f64 - 1.0);
    let total: f64 = (0..n)
        .map(|j| (view.column(j).variance() * correction).sqrt())
        .sum();
    total / n as f64
}

/// Classifies the correlation regime of a `T x N` return matrix.
#[derive(Debug, Clone, Default)]
pub struct CorrelationRegimeDetector {
    config: CorrelationRegimeConfig,
}

impl CorrelationRegimeDetector {
    /// Creates a detector.
    #[must_use]
    pub fn new(config: CorrelationRegimeConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CorrelationRegimeConfig {
        &self.config
    }

    /// Rolling average pairwise correlations, oldest first, at most
    /// `max_observations` of them.
    #[must_use]
    pub fn rolling_correlations(&self, values: &DMatrix<f64>) -> Vec<f64> {
        let (t, w) = (values.nrows(), self.config.window);
        if t < w || values.ncols() < 2 {
            return Vec::new();
        }
        let count = (t - w + 1).min(self.config.max_observations);
        let first = t - w + 1 - count;
        (first..=t - w)
            .map(|start| average_pairwise_correlation(values, start, w))
            .collect()
    }

    /// Classifies the latest window. Returns the reading and the fit to carry
    /// into the next cycle.
    #[must_use]
    pub fn classify(
        &self,
        values: &DMatrix<f64>,
        cached: Option<&CachedFit>,
    ) -> (CorrelationReading, Option<CachedFit>) {
        let cfg = &self.config;
        let observations = self.rolling_correlations(values);
        let Some(&current) = observations.last() else {
            return (CorrelationReading::calm(), cached.cloned());
        };
        let t = values.nrows();
        let volatility = average_volatility(values, t - cfg.window, cfg.window);

        let reusable = match (cfg.refit, cached) {
            (RefitCadence::EveryNCycles(n), Some(c)) if c.uses < n => Some(c.clone()),
            _ => None,
        };
        let refit = reusable.is_none();
        let carried = match reusable {
            Some(c) => Some(CachedFit {
                uses: c.uses + 1,
                fit: c.fit,
            }),
            None => MixtureFit::fit(&observations, cfg.em_max_iterations, cfg.em_tolerance)
                .map(|fit| CachedFit { fit, uses: 1 }),
        };

        let correlation_stressed = match &carried {
            Some(c) if observations.len() >= 2 => {
                let label = c.fit.predict(current);
                label == c.fit.high_component() && c.fit.means[label] > cfg.stress_correlation
            }
            _ => current >= cfg.stress_correlation,
        };
        let volatility_stressed = volatility > cfg.volatility_ceiling;
        let regime = if correlation_stressed || volatility_stressed {
            Regime::Stressed
        } else {
            Regime::Calm
        };

        debug!(
            %regime,
            average_correlation = current,
            average_volatility = volatility,
            observations = observations.len(),
            refit,
            "correlation regime classified"
        );
        (
            CorrelationReading {
                regime,
                average_correlation: current,
                average_volatility: volatility,
                multiplier: if regime == Regime::Stressed {
                    cfg.stressed_multiplier
                } else {
                    1.0
                },
                observations: observations.len(),
                refit,
            },
            carried,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Deterministic pseudo-noise in [-1, 1].
    fn noise(seed: usize) -> f64 {
        let x = ((seed as f64 + 1.0) * 12.9898).sin() * 43_758.545_3;
        2.0 * (x - x.floor()) - 1.0
    }

    fn independent(t: usize, n: usize, scale: f64) -> DMatrix<f64> {
        DMatrix::from_fn(t, n, |r, c| scale * noise(r * 31 + c * 7919))
    }

    fn common_factor(t: usize, n: usize, scale: f64) -> DMatrix<f64> {
        DMatrix::from_fn(t, n, |r, c| scale * (noise(r) + 0.05 * noise(r * 31 + c * 7919 + 1)))
    }

    #[test]
    fn test_pairwise_correlation_extremes() {
        let same = DMatrix::from_fn(10, 3, |r, _| r as f64);
        assert_abs_diff_eq!(average_pairwise_correlation(&same, 0, 10), 1.0, epsilon = 1e-12);

        let opposite = DMatrix::from_fn(10, 2, |r, c| if c == 0 { r as f64 } else { -(r as f64) });
        assert_abs_diff_eq!(average_pairwise_correlation(&opposite, 0, 10), -1.0, epsilon = 1e-12);

        let flat = DMatrix::from_element(10, 2, 0.01);
        assert_abs_diff_eq!(average_pairwise_correlation(&flat, 0, 10), 0.0);
    }

    #[test]
    fn test_mixture_separates_clusters() {
        let mut xs: Vec<f64> = (0..30).map(|i| 0.1 + 0.01 * noise(i)).collect();
        xs.extend((0..30).map(|i| 0.8 + 0.01 * noise(100 + i)));
        let fit = MixtureFit::fit(&xs, 200, 1e-9).unwrap();
        let high = fit.high_component();
        assert_abs_diff_eq!(fit.means[high], 0.8, epsilon = 0.01);
        assert_abs_diff_eq!(fit.means[1 - high], 0.1, epsilon = 0.01);
        assert_eq!(fit.predict(0.79), high);
        assert_eq!(fit.predict(0.12), 1 - high);
    }

    #[test]
    fn test_mixture_needs_two_points() {
        assert!(MixtureFit::fit(&[0.5], 100, 1e-6).is_none());
        assert!(MixtureFit::fit(&[0.5, 0.5], 100, 1e-6).is_some());
    }

    #[test]
    fn test_short_history_is_calm() {
        let detector = CorrelationRegimeDetector::default();
        let (reading, carried) = detector.classify(&common_factor(10, 3, 0.01), None);
        assert_eq!(reading.regime, Regime::Calm);
        assert_abs_diff_eq!(reading.multiplier, 1.0);
        assert!(carried.is_none());
    }

    #[test]
    fn test_independent_returns_are_calm() {
        let detector = CorrelationRegimeDetector::default();
        let (reading, _) = detector.classify(&independent(80, 4, 0.01), None);
        assert_eq!(reading.regime, Regime::Calm);
        assert!(reading.average_correlation < 0.7);
        assert_eq!(reading.observations, 17);

        let long = CorrelationRegimeDetector::new(CorrelationRegimeConfig {
            max_observations: 60,
            ..CorrelationRegimeConfig::default()
        });
        assert_eq!(long.rolling_correlations(&independent(80, 4, 0.01)).len(), 60);
        assert_eq!(long.rolling_correlations(&independent(36, 4, 0.01)).len(), 17);
    }

    #[test]
    fn test_correlated_tail_is_stressed() {
        let mut values = independent(80, 4, 0.01);
        let stressed = common_factor(50, 4, 0.01);
        for r in 0..50 {
            for c in 0..4 {
                values[(30 + r, c)] = stressed[(r, c)];
            }
        }
        let detector = CorrelationRegimeDetector::new(CorrelationRegimeConfig {
            max_observations: 60,
            ..CorrelationRegimeConfig::default()
        });
        let (reading, _) = detector.classify(&values, None);
        assert!(reading.average_correlation > 0.9);
        assert_eq!(reading.regime, Regime::Stressed);
        assert_abs_diff_eq!(reading.multiplier, 0.8);
    }

    #[test]
    fn test_high_volatility_is_stressed() {
        let detector = CorrelationRegimeDetector::default();
        let (reading, _) = detector.classify(&independent(40, 3, 0.2), None);
        assert!(reading.average_volatility > 0.04);
        assert_eq!(reading.regime, Regime::Stressed);
    }

    #[test]
    fn test_cached_fit_reused_until_aged_out() {
        let detector = CorrelationRegimeDetector::new(CorrelationRegimeConfig {
            refit: RefitCadence::EveryNCycles(2),
            ..CorrelationRegimeConfig::default()
        });
        let values = independent(60, 3, 0.01);
        let (first, carried) = detector.classify(&values, None);
        assert!(first.refit);
        let (second, carried) = detector.classify(&values, carried.as_ref());
        assert!(!second.refit);
        assert_eq!(carried.as_ref().unwrap().uses, 2);
        let (third, _) = detector.classify(&values, carried.as_ref());
        assert!(third.refit);
    }

    #[test]
    fn test_every_cycle_ignores_cache() {
        let detector = CorrelationRegimeDetector::default();
        let values = independent(60, 3, 0.01);
        let (_, carried) = detector.classify(&values, None);
        let (reading, _) = detector.classify(&values, carried.as_ref());
        assert!(reading.refit);
    }

    #[test]
    fn test_cadence_serde() {
        let c: RefitCadence = serde_json::from_str(r#"{"every_n_cycles":5}"#).unwrap();
        assert_eq!(c, RefitCadence::EveryNCycles(5));
        let c: RefitCadence = serde_json::from_str(r#""every_cycle""#).unwrap();
        assert_eq!(c, RefitCadence::EveryCycle);
    }
}
