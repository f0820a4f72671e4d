//! Cleaning and alignment of per-strategy return series.
//!
//! Series are aligned on the union of their period dates, trimmed to the
//! lookback window, and outliers are replaced with the cross-sectional mean of
//! their period so every column keeps the same length.
//!
//! An entry's z-score is taken against the other entries of its reference set
//! (the period's cross-section, or the strategy's own window), so one extreme
//! return cannot mask itself by inflating the deviation it is measured with.

#![allow(clippy::cast_precision_loss)]

use ballast_core::config::{Configurable, EnvOverride, Validatable, ValidationContext, Validator};
use ballast_core::error::DataError;
use ballast_core::types::{ReturnSeries, StrategyId};
use chrono::NaiveDate;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Reference distribution for the outlier z-score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZScoreMode {
    /// Against the other strategies in the same period.
    #[default]
    CrossSectional,
    /// Against the same strategy's own window.
    TimeSeries,
}

/// Sanitizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizerConfig {
    /// Periods kept, most recent last.
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    /// Fewer aligned periods than this is insufficient data.
    #[serde(default = "default_min_periods")]
    pub min_periods: usize,
    /// Entries with leave-one-out `|z|` above this are replaced.
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,
    /// Reference distribution for z.
    #[serde(default)]
    pub mode: ZScoreMode,
}

fn default_lookback() -> usize {
    36
}

fn default_min_periods() -> usize {
    4
}

fn default_z_threshold() -> f64 {
    3.0
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            lookback: default_lookback(),
            min_periods: default_min_periods(),
            z_threshold: default_z_threshold(),
            mode: ZScoreMode::default(),
        }
    }
}

impl Validatable for SanitizerConfig {
    fn validate_with_context(&self, ctx: &mut ValidationContext) {
        ctx.enter("sanitizer");
        Validator::new(ctx)
            .positive("lookback", &self.lookback)
            .positive("min_periods", &self.min_periods)
            .custom(
                "min_periods",
                || self.min_periods <= self.lookback,
                "must not exceed lookback",
            )
            .positive("z_threshold", &self.z_threshold);
        ctx.exit();
    }
}

impl Configurable for SanitizerConfig {
    fn apply_env_overrides(&mut self, prefix: &str) {
        EnvOverride::apply_number(&format!("{prefix}_SANITIZER_LOOKBACK"), &mut self.lookback);
        EnvOverride::apply_number(&format!("{prefix}_SANITIZER_MIN_PERIODS"), &mut self.min_periods);
        EnvOverride::apply_number(&format!("{prefix}_SANITIZER_Z_THRESHOLD"), &mut self.z_threshold);
    }

    fn env_var_names(prefix: &str) -> Vec<String> {
        vec![
            format!("{prefix}_SANITIZER_LOOKBACK"),
            format!("{prefix}_SANITIZER_MIN_PERIODS"),
            format!("{prefix}_SANITIZER_Z_THRESHOLD"),
        ]
    }
}

/// Aligned `T x N` return matrix, one column per strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnPanel {
    strategies: Vec<StrategyId>,
    dates: Vec<NaiveDate>,
    values: DMatrix<f64>,
    replaced: usize,
}

impl ReturnPanel {
    /// Column order.
    #[must_use]
    pub fn strategies(&self) -> &[StrategyId] {
        &self.strategies
    }

    /// Row dates, oldest first.
    #[must_use]
    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    /// The matrix.
    #[must_use]
    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    /// Number of periods (rows).
    #[must_use]
    pub fn periods(&self) -> usize {
        self.values.nrows()
    }

    /// Number of strategies (columns).
    #[must_use]
    pub fn width(&self) -> usize {
        self.values.ncols()
    }

    /// Last period date.
    #[must_use]
    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    /// Entries replaced as outliers or filled as missing.
    #[must_use]
    pub fn replaced(&self) -> usize {
        self.replaced
    }

    /// Column `j` as a vector.
    #[must_use]
    pub fn column(&self, j: usize) -> Vec<f64> {
        self.values.column(j).iter().copied().collect()
    }
}

/// Turns raw series into a clean [`ReturnPanel`].
#[derive(Debug, Clone, Default)]
pub struct ReturnsSanitizer {
    config: SanitizerConfig,
}

impl ReturnsSanitizer {
    /// Creates a sanitizer.
    #[must_use]
    pub fn new(config: SanitizerConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &SanitizerConfig {
        &self.config
    }

    /// Aligns, trims and cleans `series`.
    ///
    /// A date missing for some strategies is filled with the mean of the
    /// strategies that reported it. Fails with `InsufficientData` when fewer
    /// than `min_periods` aligned periods remain.
    pub fn sanitize(&self, series: &[ReturnSeries]) -> Result<ReturnPanel, DataError> {
        if series.is_empty() {
            return Err(DataError::EmptyData {
                description: "no return series to sanitize".to_string(),
            });
        }

        let all_dates: BTreeSet<NaiveDate> = series
            .iter()
            .flat_map(|s| s.points().iter().map(|p| p.date))
            .collect();
        let skip = all_dates.len().saturating_sub(self.config.lookback);
        let dates: Vec<NaiveDate> = all_dates.into_iter().skip(skip).collect();

        if dates.len() < self.config.min_periods {
            return Err(DataError::InsufficientData {
                available: dates.len(),
                required: self.config.min_periods,
            });
        }

        let lookup: Vec<BTreeMap<NaiveDate, f64>> = series
            .iter()
            .map(|s| s.points().iter().map(|p| (p.date, p.value)).collect())
            .collect();

        let (t, n) = (dates.len(), series.len());
        let mut values = DMatrix::zeros(t, n);
        let mut missing = 0;
        for (row, date) in dates.iter().enumerate() {
            let reported: Vec<Option<f64>> = lookup.iter().map(|m| m.get(date).copied()).collect();
            let present: Vec<f64> = reported.iter().flatten().copied().collect();
            let fill = mean(&present);
            for (col, value) in reported.into_iter().enumerate() {
                values[(row, col)] = value.unwrap_or_else(|| {
                    missing += 1;
                    fill
                });
            }
        }

        let outliers = match self.config.mode {
            ZScoreMode::CrossSectional => self.replace_cross_sectional(&mut values),
            ZScoreMode::TimeSeries => self.replace_time_series(&mut values),
        };

        debug!(
            periods = t,
            strategies = n,
            missing,
            outliers,
            "returns sanitized"
        );
        Ok(ReturnPanel {
            strategies: series.iter().map(|s| s.strategy().clone()).collect(),
            dates,
            values,
            replaced: missing + outliers,
        })
    }

    fn replace_cross_sectional(&self, values: &mut DMatrix<f64>) -> usize {
        let mut replaced = 0;
        for mut row in values.row_iter_mut() {
            let entries: Vec<f64> = row.iter().copied().collect();
            let flags = flag_outliers(&entries, self.config.z_threshold);
            let clean: Vec<f64> = entries
                .iter()
                .zip(&flags)
                .filter(|(_, flagged)| !**flagged)
                .map(|(v, _)| *v)
                .collect();
            let fill = if clean.is_empty() { mean(&entries) } else { mean(&clean) };
            for (v, flagged) in row.iter_mut().zip(&flags) {
                if *flagged {
                    *v = fill;
                    replaced += 1;
                }
            }
        }
        replaced
    }

    fn replace_time_series(&self, values: &mut DMatrix<f64>) -> usize {
        let row_means: Vec<f64> = values
            .row_iter()
            .map(|r| mean(&r.iter().copied().collect::<Vec<_>>()))
            .collect();
        let mut replaced = 0;
        for mut col in values.column_iter_mut() {
            let entries: Vec<f64> = col.iter().copied().collect();
            let flags = flag_outliers(&entries, self.config.z_threshold);
            for (t, (v, flagged)) in col.iter_mut().zip(&flags).enumerate() {
                if *flagged {
                    *v = row_means[t];
                    replaced += 1;
                }
            }
        }
        replaced
    }
}

/// Scale floor for a reference set with no dispersion.
const MIN_SCALE: f64 = 1e-10;

/// Two references give no usable deviation estimate.
const MIN_OUTLIER_ENTRIES: usize = 4;

/// Flags entries whose leave-one-out z-score exceeds `threshold`.
///
/// Each entry is scored against the mean and sample deviation of the other
/// entries, scaled by `sqrt(1 + 1/k)` for `k` references. An entry never
/// inflates its own reference, so a single extreme value stands out even in
/// a short cross-section. Fewer than [`MIN_OUTLIER_ENTRIES`] entries are
/// never flagged.
fn flag_outliers(entries: &[f64], threshold: f64) -> Vec<bool> {
    let n = entries.len();
    if n < MIN_OUTLIER_ENTRIES {
        return vec![false; n];
    }
    let k = (n - 1) as f64;
    let total: f64 = entries.iter().sum();
    let total_sq: f64 = entries.iter().map(|v| v * v).sum();
    entries
        .iter()
        .map(|v| {
            let m = (total - v) / k;
            let ss = (total_sq - v * v - k * m * m).max(0.0);
            let scale = (ss / (k - 1.0)).sqrt().max(MIN_SCALE) * (1.0 + 1.0 / k).sqrt();
            ((v - m) / scale).abs() > threshold
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
