//! Realized risk metrics over a trailing window.
//!
//! All loss measures are reported as positive numbers (a VaR of `0.04` means a
//! 4% loss), except [`max_drawdown`] which follows the usual sign convention
//! and is `<= 0`.
//!
//! # Example
//!
//! ```
//! use ballast_risk::analytics::max_drawdown;
//!
//! let dd = max_drawdown(&[0.10, -0.20, -0.25, 0.05]);
//! assert!((dd + 0.40).abs() < 1e-9);
//! ```

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use crate::error::RiskError;
use ballast_core::config::{Configurable, EnvOverride, Validatable, ValidationContext, Validator};
use ballast_core::types::{ReturnSeries, StrategyId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Configuration for [`RiskAnalytics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAnalyticsConfig {
    /// Trailing window in periods.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Minimum periods required to produce a snapshot.
    #[serde(default = "default_min_periods")]
    pub min_periods: usize,
    /// Periods per year used to annualize (252 for daily returns).
    #[serde(default = "default_periods_per_year")]
    pub periods_per_year: f64,
    /// Annual risk-free rate subtracted in Sharpe and Sortino.
    #[serde(default)]
    pub risk_free_rate: f64,
    /// Series used for beta/alpha regression.
    #[serde(default)]
    pub benchmark: Option<StrategyId>,
}

fn default_window() -> usize {
    60
}

fn default_min_periods() -> usize {
    2
}

fn default_periods_per_year() -> f64 {
    252.0
}

impl Default for RiskAnalyticsConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            min_periods: default_min_periods(),
            periods_per_year: default_periods_per_year(),
            risk_free_rate: 0.0,
            benchmark: None,
        }
    }
}

impl Validatable for RiskAnalyticsConfig {
    fn validate_with_context(&self, ctx: &mut ValidationContext) {
        ctx.enter("risk");
        Validator::new(ctx)
            .positive("window", &self.window)
            .positive("min_periods", &self.min_periods)
            .custom(
                "min_periods",
                || self.min_periods <= self.window,
                "must not exceed window",
            )
            .positive("periods_per_year", &self.periods_per_year)
            .finite("risk_free_rate", self.risk_free_rate);
        ctx.exit();
    }
}

impl Configurable for RiskAnalyticsConfig {
    fn apply_env_overrides(&mut self, prefix: &str) {
        EnvOverride::apply_number(&format!("{prefix}_RISK_WINDOW"), &mut self.window);
        EnvOverride::apply_number(
            &format!("{prefix}_RISK_PERIODS_PER_YEAR"),
            &mut self.periods_per_year,
        );
        EnvOverride::apply_number(
            &format!("{prefix}_RISK_RISK_FREE_RATE"),
            &mut self.risk_free_rate,
        );
    }

    fn env_var_names(prefix: &str) -> Vec<String> {
        vec![
            format!("{prefix}_RISK_WINDOW"),
            format!("{prefix}_RISK_PERIODS_PER_YEAR"),
            format!("{prefix}_RISK_RISK_FREE_RATE"),
        ]
    }
}

/// Metrics a rule can be written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMetric {
    /// Historical VaR at 95%.
    Var95,
    /// Historical VaR at 99%.
    Var99,
    /// Conditional VaR (expected shortfall) at 95%.
    #[serde(alias = "es95")]
    Cvar95,
    /// Conditional VaR (expected shortfall) at 99%.
    #[serde(alias = "es99")]
    Cvar99,
    /// Annualized volatility.
    #[serde(alias = "vol")]
    Volatility,
    /// Maximum drawdown (`<= 0`).
    MaxDrawdown,
    /// Annualized Sharpe ratio.
    Sharpe,
    /// Annualized Sortino ratio.
    Sortino,
    /// Regression beta to the benchmark.
    Beta,
    /// Annualized regression alpha.
    Alpha,
}

impl RiskMetric {
    /// Every metric, in catalog order.
    pub const ALL: [Self; 10] = [
        Self::Var95,
        Self::Var99,
        Self::Cvar95,
        Self::Cvar99,
        Self::Volatility,
        Self::MaxDrawdown,
        Self::Sharpe,
        Self::Sortino,
        Self::Beta,
        Self::Alpha,
    ];

    /// Canonical snake_case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Var95 => "var95",
            Self::Var99 => "var99",
            Self::Cvar95 => "cvar95",
            Self::Cvar99 => "cvar99",
            Self::Volatility => "volatility",
            Self::MaxDrawdown => "max_drawdown",
            Self::Sharpe => "sharpe",
            Self::Sortino => "sortino",
            Self::Beta => "beta",
            Self::Alpha => "alpha",
        }
    }
}

impl fmt::Display for RiskMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskMetric {
    type Err = RiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            "es95" => return Ok(Self::Cvar95),
            "es99" => return Ok(Self::Cvar99),
            "vol" => return Ok(Self::Volatility),
            _ => {}
        }
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == name)
            .ok_or(RiskError::UnknownMetric { name })
    }
}

/// Realized risk of one strategy as of one date.
///
/// Immutable once computed; recomputing the same `(strategy, date)` from the
/// same history yields an identical value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    /// Strategy evaluated.
    pub strategy: StrategyId,
    /// Evaluation date (last period included).
    pub date: NaiveDate,
    /// Periods used.
    pub observations: usize,
    /// Historical VaR at 95%.
    pub var95: f64,
    /// Historical VaR at 99%.
    pub var99: f64,
    /// Expected shortfall at 95%.
    pub cvar95: f64,
    /// Expected shortfall at 99%.
    pub cvar99: f64,
    /// Maximum drawdown over the window (`<= 0`).
    pub max_drawdown: f64,
    /// Annualized volatility.
    pub volatility: f64,
    /// Annualized Sharpe ratio.
    pub sharpe: f64,
    /// Annualized Sortino ratio.
    pub sortino: f64,
    /// Beta to the benchmark (0 without one).
    pub beta: f64,
    /// Annualized alpha to the benchmark (0 without one).
    pub alpha: f64,
    /// Most recent period return.
    pub latest_return: f64,
    /// Derived from cached input after a collaborator timeout.
    #[serde(default)]
    pub stale: bool,
}

impl RiskSnapshot {
    /// Value of a catalog metric.
    #[must_use]
    pub fn metric(&self, metric: RiskMetric) -> f64 {
        match metric {
            RiskMetric::Var95 => self.var95,
            RiskMetric::Var99 => self.var99,
            RiskMetric::Cvar95 => self.cvar95,
            RiskMetric::Cvar99 => self.cvar99,
            RiskMetric::Volatility => self.volatility,
            RiskMetric::MaxDrawdown => self.max_drawdown,
            RiskMetric::Sharpe => self.sharpe,
            RiskMetric::Sortino => self.sortino,
            RiskMetric::Beta => self.beta,
            RiskMetric::Alpha => self.alpha,
        }
    }

    /// Returns a copy flagged as derived from stale input.
    #[must_use]
    pub fn into_stale(mut self) -> Self {
        self.stale = true;
        self
    }
}

/// Computes [`RiskSnapshot`]s.
#[derive(Debug, Clone, Default)]
pub struct RiskAnalytics {
    config: RiskAnalyticsConfig,
}

impl RiskAnalytics {
    /// Creates the calculator.
    #[must_use]
    pub fn new(config: RiskAnalyticsConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RiskAnalyticsConfig {
        &self.config
    }

    /// Computes the snapshot for `returns` as of `date`.
    ///
    /// Only periods ending on or before `date` are used, trimmed to the
    /// configured window. The benchmark is aligned by date.
    pub fn snapshot(
        &self,
        returns: &ReturnSeries,
        date: NaiveDate,
        benchmark: Option<&ReturnSeries>,
    ) -> Result<RiskSnapshot, RiskError> {
        let window = returns.up_to(date).tail(self.config.window);
        if window.len() < self.config.min_periods {
            return Err(RiskError::InsufficientHistory {
                strategy: returns.strategy().to_string(),
                available: window.len(),
                required: self.config.min_periods,
            });
        }

        let values = window.values();
        let ppy = self.config.periods_per_year;
        let rf = self.config.risk_free_rate / ppy;

        let (beta, alpha) = benchmark
            .map(|bench| {
                let by_date: BTreeMap<NaiveDate, f64> =
                    bench.points().iter().map(|p| (p.date, p.value)).collect();
                let (ys, xs): (Vec<f64>, Vec<f64>) = window
                    .points()
                    .iter()
                    .filter_map(|p| by_date.get(&p.date).map(|b| (p.value, *b)))
                    .unzip();
                beta_alpha(&ys, &xs, ppy)
            })
            .unwrap_or((0.0, 0.0));

        let snapshot = RiskSnapshot {
            strategy: returns.strategy().clone(),
            date,
            observations: values.len(),
            var95: historical_var(&values, 0.95),
            var99: historical_var(&values, 0.99),
            cvar95: conditional_var(&values, 0.95),
            cvar99: conditional_var(&values, 0.99),
            max_drawdown: max_drawdown(&values),
            volatility: annualized_volatility(&values, ppy),
            sharpe: sharpe_ratio(&values, rf, ppy),
            sortino: sortino_ratio(&values, rf, ppy),
            beta,
            alpha,
            latest_return: values.last().copied().unwrap_or(0.0),
            stale: false,
        };

        debug!(
            strategy = %snapshot.strategy,
            date = %date,
            var95 = snapshot.var95,
            max_drawdown = snapshot.max_drawdown,
            "risk snapshot computed"
        );
        Ok(snapshot)
    }
}

/// Quantile with linear interpolation between order statistics.
///
/// `q` is clamped to `[0, 1]`; NaN for an empty slice.
#[must_use]
pub fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Historical Value-at-Risk: `-quantile(returns, 1 - confidence)`.
#[must_use]
pub fn historical_var(returns: &[f64], confidence: f64) -> f64 {
    -quantile(returns, 1.0 - confidence)
}

/// Conditional VaR: negated mean of the returns at or below `-VaR`.
#[must_use]
pub fn conditional_var(returns: &[f64], confidence: f64) -> f64 {
    let cutoff = -historical_var(returns, confidence);
    let tail: Vec<f64> = returns.iter().copied().filter(|r| *r <= cutoff).collect();
    if tail.is_empty() {
        return -cutoff;
    }
    -mean(&tail)
}

/// Largest peak-to-trough decline of compounded wealth, starting from 1.0.
///
/// Returned as a non-positive fraction (`-0.4` is a 40% drawdown).
#[must_use]
pub fn max_drawdown(returns: &[f64]) -> f64 {
    let mut wealth = 1.0_f64;
    let mut peak = 1.0_f64;
    let mut worst = 0.0_f64;
    for r in returns {
        wealth *= 1.0 + r;
        peak = peak.max(wealth);
        if peak > 0.0 {
            worst = worst.min(wealth / peak - 1.0);
        }
    }
    worst
}

/// Sample standard deviation scaled by `sqrt(periods_per_year)`.
#[must_use]
pub fn annualized_volatility(returns: &[f64], periods_per_year: f64) -> f64 {
    sample_std(returns) * periods_per_year.sqrt()
}

/// `mean(r - rf) / std(r) * sqrt(periods_per_year)`; 0 when undefined.
#[must_use]
pub fn sharpe_ratio(returns: &[f64], rf_per_period: f64, periods_per_year: f64) -> f64 {
    let sd = sample_std(returns);
    if sd <= f64::EPSILON || returns.is_empty() {
        return 0.0;
    }
    (mean(returns) - rf_per_period) / sd * periods_per_year.sqrt()
}

/// Like [`sharpe_ratio`] with the deviation taken over negative returns only.
#[must_use]
pub fn sortino_ratio(returns: &[f64], rf_per_period: f64, periods_per_year: f64) -> f64 {
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    let sd = sample_std(&downside);
    if sd <= f64::EPSILON || returns.is_empty() {
        return 0.0;
    }
    (mean(returns) - rf_per_period) / sd * periods_per_year.sqrt()
}

/// OLS regression of `y` on `x`: returns `(beta, annualized alpha)`.
///
/// `(0, 0)` with fewer than two aligned points or a flat benchmark.
#[must_use]
pub fn beta_alpha(y: &[f64], x: &[f64], periods_per_year: f64) -> (f64, f64) {
    let n = y.len().min(x.len());
    if n < 2 {
        return (0.0, 0.0);
    }
    let (y, x) = (&y[..n], &x[..n]);
    let (my, mx) = (mean(y), mean(x));
    let cov: f64 = y.iter().zip(x).map(|(a, b)| (a - my) * (b - mx)).sum();
    let var: f64 = x.iter().map(|b| (b - mx).powi(2)).sum();
    if var <= f64::EPSILON {
        return (0.0, 0.0);
    }
    let beta = cov / var;
    (beta, (my - beta * mx) * periods_per_year)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap() + chrono::Days::new(u64::from(n))
    }

    fn series(name: &str, values: &[f64]) -> ReturnSeries {
        ReturnSeries::from_pairs(
            name,
            values.iter().enumerate().map(|(i, v)| (day(i as u32), *v)),
        )
        .unwrap()
    }

    #[test]
    fn test_var_and_cvar_on_five_day_sample() {
        let returns = [-0.05, -0.02, 0.01, 0.03, -0.01];
        let var = historical_var(&returns, 0.95);
        assert_abs_diff_eq!(var, -quantile(&returns, 0.05), epsilon = 1e-15);
        assert_abs_diff_eq!(var, 0.044, epsilon = 1e-12);

        // Only -0.05 sits at or below -VaR.
        assert_abs_diff_eq!(conditional_var(&returns, 0.95), 0.05, epsilon = 1e-12);
    }

    #[test]
    fn test_quantile_interpolates() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_abs_diff_eq!(quantile(&values, 0.0), 1.0);
        assert_abs_diff_eq!(quantile(&values, 1.0), 4.0);
        assert_abs_diff_eq!(quantile(&values, 0.5), 2.5);
        assert!(quantile(&[], 0.5).is_nan());
    }

    #[test]
    fn test_max_drawdown_counts_initial_capital() {
        assert_abs_diff_eq!(max_drawdown(&[-0.1, 0.05]), -0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(max_drawdown(&[0.01, 0.02]), 0.0);
        assert_abs_diff_eq!(
            max_drawdown(&[0.10, -0.20, -0.25, 0.05]),
            -0.40,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_sharpe_and_sortino() {
        let returns = [0.01, -0.02, 0.03, -0.01, 0.02];
        let sd = sample_std(&returns);
        assert_abs_diff_eq!(
            sharpe_ratio(&returns, 0.0, 252.0),
            0.006 / sd * 252.0_f64.sqrt(),
            epsilon = 1e-12
        );

        let downside_sd = sample_std(&[-0.02, -0.01]);
        assert_abs_diff_eq!(
            sortino_ratio(&returns, 0.0, 252.0),
            0.006 / downside_sd * 252.0_f64.sqrt(),
            epsilon = 1e-12
        );

        assert_abs_diff_eq!(sharpe_ratio(&[0.01, 0.01, 0.01], 0.0, 252.0), 0.0);
        assert_abs_diff_eq!(sortino_ratio(&[0.01, 0.02], 0.0, 252.0), 0.0);
    }

    #[test]
    fn test_beta_alpha_recovers_linear_relation() {
        let x = [0.01, -0.02, 0.015, 0.0, -0.005];
        let y: Vec<f64> = x.iter().map(|v| 0.001 + 1.5 * v).collect();
        let (beta, alpha) = beta_alpha(&y, &x, 252.0);
        assert_abs_diff_eq!(beta, 1.5, epsilon = 1e-10);
        assert_abs_diff_eq!(alpha, 0.252, epsilon = 1e-10);

        assert_eq!(beta_alpha(&y, &[0.0; 5], 252.0), (0.0, 0.0));
    }

    #[test]
    fn test_snapshot_uses_window_up_to_date() {
        let analytics = RiskAnalytics::new(RiskAnalyticsConfig {
            window: 3,
            ..RiskAnalyticsConfig::default()
        });
        let returns = series("carry", &[0.5, -0.05, -0.02, 0.01, 0.9]);
        let snap = analytics.snapshot(&returns, day(3), None).unwrap();

        assert_eq!(snap.observations, 3);
        assert_abs_diff_eq!(snap.latest_return, 0.01);
        assert_eq!(snap.beta, 0.0);
        assert!(!snap.stale);
    }

    #[test]
    fn test_snapshot_is_deterministic() {
        let analytics = RiskAnalytics::default();
        let returns = series("carry", &[0.01, -0.02, 0.03, -0.01, 0.02]);
        let bench = series("spx", &[0.005, -0.01, 0.02, 0.0, 0.01]);
        let a = analytics.snapshot(&returns, day(4), Some(&bench)).unwrap();
        let b = analytics.snapshot(&returns, day(4), Some(&bench)).unwrap();
        assert_eq!(a, b);
        assert!(a.beta > 0.0);
    }

    #[test]
    fn test_snapshot_insufficient_history() {
        let analytics = RiskAnalytics::default();
        let returns = series("carry", &[0.01, 0.02]);
        let err = analytics.snapshot(&returns, day(0), None).unwrap_err();
        assert!(err.is_insufficient_history());
    }

    #[test]
    fn test_metric_names_parse() {
        assert_eq!("var95".parse::<RiskMetric>().unwrap(), RiskMetric::Var95);
        assert_eq!("ES99".parse::<RiskMetric>().unwrap(), RiskMetric::Cvar99);
        assert_eq!(
            "max_drawdown".parse::<RiskMetric>().unwrap(),
            RiskMetric::MaxDrawdown
        );
        assert!("kurtosis".parse::<RiskMetric>().is_err());
        for metric in RiskMetric::ALL {
            assert_eq!(metric.as_str().parse::<RiskMetric>().unwrap(), metric);
        }
    }

    #[test]
    fn test_config_validation() {
        let config = RiskAnalyticsConfig {
            window: 3,
            min_periods: 5,
            ..RiskAnalyticsConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("risk.min_periods"));
    }
}
