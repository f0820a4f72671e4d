//! Shrinkage covariance and expected-return estimation.
//!
//! The sample covariance is blended with a structured target using the
//! Ledoit-Wolf optimal intensity. Two targets are available: the scaled
//! identity (`mu * I`, Ledoit & Wolf 2004, "A well-conditioned estimator for
//! large-dimensional covariance matrices") and the constant-correlation matrix
//! (Ledoit & Wolf 2004, "Honey, I shrunk the sample covariance matrix").
//!
//! With a half-life configured, period `t` of `T` gets weight proportional to
//! `exp(-lambda * (T - 1 - t))` with `lambda = ln 2 / half_life`, applied to both
//! the mean and the covariance.

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::many_single_char_names)]

use crate::error::EstimationError;
use crate::sanitizer::ReturnPanel;
use ballast_core::config::{Configurable, EnvOverride, Validatable, ValidationContext, Validator};
use chrono::NaiveDate;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Shrinkage target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShrinkageTarget {
    /// `mu * I` with `mu` the average variance.
    #[default]
    Identity,
    /// Sample variances with the average pairwise correlation off the diagonal.
    ConstantCorrelation,
}

/// Estimator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceConfig {
    /// Shrinkage target.
    #[serde(default)]
    pub target: ShrinkageTarget,
    /// Exponential decay half-life in periods. `None` weights periods equally.
    #[serde(default)]
    pub half_life: Option<f64>,
    /// Annualization factor (52 for weekly returns).
    #[serde(default = "default_periods_per_year")]
    pub periods_per_year: f64,
    /// Smallest eigenvalue accepted as PSD.
    #[serde(default = "default_psd_tolerance")]
    pub psd_tolerance: f64,
    /// Times the intensity is moved halfway to the target before giving up.
    #[serde(default = "default_max_psd_steps")]
    pub max_psd_steps: u32,
}

fn default_periods_per_year() -> f64 {
    52.0
}

fn default_psd_tolerance() -> f64 {
    1e-8
}

fn default_max_psd_steps() -> u32 {
    8
}

impl Default for CovarianceConfig {
    fn default() -> Self {
        Self {
            target: ShrinkageTarget::default(),
            half_life: None,
            periods_per_year: default_periods_per_year(),
            psd_tolerance: default_psd_tolerance(),
            max_psd_steps: default_max_psd_steps(),
        }
    }
}

impl Validatable for CovarianceConfig {
    fn validate_with_context(&self, ctx: &mut ValidationContext) {
        ctx.enter("covariance");
        let mut v = Validator::new(ctx);
        v.positive("periods_per_year", &self.periods_per_year)
            .non_negative("psd_tolerance", &self.psd_tolerance);
        if let Some(h) = self.half_life {
            v.positive("half_life", &h);
        }
        ctx.exit();
    }
}

impl Configurable for CovarianceConfig {
    fn apply_env_overrides(&mut self, prefix: &str) {
        EnvOverride::apply_optional_number(
            &format!("{prefix}_COVARIANCE_HALF_LIFE"),
            &mut self.half_life,
        );
        EnvOverride::apply_number(
            &format!("{prefix}_COVARIANCE_PERIODS_PER_YEAR"),
            &mut self.periods_per_year,
        );
    }

    fn env_var_names(prefix: &str) -> Vec<String> {
        vec![
            format!("{prefix}_COVARIANCE_HALF_LIFE"),
            format!("{prefix}_COVARIANCE_PERIODS_PER_YEAR"),
        ]
    }
}

/// Annualized covariance and expected returns over one active strategy set.
#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceEstimate {
    /// `N x N`, symmetric, PSD within tolerance.
    pub matrix: DMatrix<f64>,
    /// Annualized (optionally decayed) mean returns.
    pub expected_returns: DVector<f64>,
    /// Intensity applied, in `[0, 1]`.
    pub shrinkage: f64,
    /// Target actually used.
    pub target: ShrinkageTarget,
    /// Periods used.
    pub periods: usize,
    /// Last period date.
    pub as_of: Option<NaiveDate>,
}

impl CovarianceEstimate {
    /// Smallest eigenvalue.
    #[must_use]
    pub fn min_eigenvalue(&self) -> f64 {
        min_eigenvalue(&self.matrix)
    }

    /// `sqrt(w' S w)`.
    #[must_use]
    pub fn portfolio_volatility(&self, weights: &[f64]) -> f64 {
        let w = DVector::from_column_slice(weights);
        (w.transpose() * &self.matrix * &w)[(0, 0)].max(0.0).sqrt()
    }

    /// SHA-256 over the little-endian matrix entries, hex encoded.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.matrix.nrows() as u64).to_le_bytes());
        for v in &self.matrix {
            hasher.update(v.to_le_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Rows of the matrix, for serialization.
    #[must_use]
    pub fn rows(&self) -> Vec<Vec<f64>> {
        self.matrix
            .row_iter()
            .map(|r| r.iter().copied().collect())
            .collect()
    }
}

/// Computes [`CovarianceEstimate`]s from a [`ReturnPanel`].
#[derive(Debug, Clone, Default)]
pub struct CovarianceEstimator {
    config: CovarianceConfig,
}

impl CovarianceEstimator {
    /// Creates an estimator.
    #[must_use]
    pub fn new(config: CovarianceConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CovarianceConfig {
        &self.config
    }

    /// Estimates the shrunk, annualized covariance of `panel`.
    pub fn estimate(&self, panel: &ReturnPanel) -> Result<CovarianceEstimate, EstimationError> {
        let x = panel.values();
        let (t, n) = (x.nrows(), x.ncols());
        if t < 2 {
            return Err(EstimationError::TooFewPeriods {
                available: t,
                required: 2,
            });
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(EstimationError::NonFinite {
                stage: "returns".to_string(),
            });
        }

        let weights = self.period_weights(t);
        let mean = weighted_mean(x, &weights);
        // Centered rows scaled by sqrt(w_t * T) so that X'X / T is the
        // weighted covariance.
        let mut centered = x.clone();
        for (row, w) in weights.iter().enumerate() {
            let scale = (w * t as f64).sqrt();
            for col in 0..n {
                centered[(row, col)] = (centered[(row, col)] - mean[col]) * scale;
            }
        }

        let sample = centered.transpose() * &centered / t as f64;
        let (target_matrix, mut shrinkage, target) = match self.config.target {
            ShrinkageTarget::ConstantCorrelation => match constant_correlation(&centered, &sample) {
                Some((f, s)) => (f, s, ShrinkageTarget::ConstantCorrelation),
                None => {
                    debug!("zero variance in panel, shrinking toward identity");
                    let (f, s) = identity_target(&centered, &sample);
                    (f, s, ShrinkageTarget::Identity)
                }
            },
            ShrinkageTarget::Identity => {
                let (f, s) = identity_target(&centered, &sample);
                (f, s, ShrinkageTarget::Identity)
            }
        };

        let mut matrix = blend(&sample, &target_matrix, shrinkage);
        let mut min_eig = min_eigenvalue(&matrix);
        let mut steps = 0;
        while min_eig < -self.config.psd_tolerance && steps < self.config.max_psd_steps {
            shrinkage += (1.0 - shrinkage) / 2.0;
            matrix = blend(&sample, &target_matrix, shrinkage);
            min_eig = min_eigenvalue(&matrix);
            steps += 1;
        }
        if !min_eig.is_finite() || matrix.iter().any(|v| !v.is_finite()) {
            return Err(EstimationError::NonFinite {
                stage: "covariance".to_string(),
            });
        }
        if min_eig < -self.config.psd_tolerance {
            warn!(min_eigenvalue = min_eig, steps, "covariance not PSD after shrinkage");
            return Err(EstimationError::NotPositiveSemidefinite {
                min_eigenvalue: min_eig,
            });
        }

        let ppy = self.config.periods_per_year;
        debug!(shrinkage, ?target, periods = t, strategies = n, "covariance estimated");
        Ok(CovarianceEstimate {
            matrix: matrix * ppy,
            expected_returns: mean * ppy,
            shrinkage,
            target,
            periods: t,
            as_of: panel.last_date(),
        })
    }

    /// Normalized period weights, oldest first.
    fn period_weights(&self, t: usize) -> Vec<f64> {
        match self.config.half_life {
            Some(h) if h > 0.0 => {
                let lambda = std::f64::consts::LN_2 / h;
                let raw: Vec<f64> = (0..t)
                    .map(|i| (-lambda * (t - 1 - i) as f64).exp())
                    .collect();
                let total: f64 = raw.iter().sum();
                raw.into_iter().map(|w| w / total).collect()
            }
            _ => vec![1.0 / t as f64; t],
        }
    }
}

fn weighted_mean(x: &DMatrix<f64>, weights: &[f64]) -> DVector<f64> {
    let mut mean = DVector::zeros(x.ncols());
    for (row, w) in weights.iter().enumerate() {
        for col in 0..x.ncols() {
            mean[col] += w * x[(row, col)];
        }
    }
    mean
}

fn blend(sample: &DMatrix<f64>, target: &DMatrix<f64>, shrinkage: f64) -> DMatrix<f64> {
    let m = sample * (1.0 - shrinkage) + target * shrinkage;
    (&m + m.transpose()) * 0.5
}

fn min_eigenvalue(m: &DMatrix<f64>) -> f64 {
    if m.is_empty() {
        return 0.0;
    }
    SymmetricEigen::new(m.clone()).eigenvalues.min()
}

/// Ledoit-Wolf intensity toward `mu * I`. `x` is the centered `T x N` matrix.
fn identity_target(x: &DMatrix<f64>, sample: &DMatrix<f64>) -> (DMatrix<f64>, f64) {
    let (t, n) = (x.nrows() as f64, x.ncols());
    let p = n as f64;
    let trace = sample.trace();
    let mu = trace / p;
    let target = DMatrix::identity(n, n) * mu;

    let x2 = x.component_mul(x);
    let beta_: f64 = (x2.transpose() * &x2).sum();
    let delta_: f64 = (x.transpose() * x).map(|v| v * v).sum() / (t * t);
    let mut beta = (beta_ / t - delta_) / (p * t);
    let delta = (delta_ - 2.0 * mu * trace + p * mu * mu) / p;
    beta = beta.min(delta);

    let shrinkage = if beta == 0.0 || delta <= 0.0 {
        0.0
    } else {
        (beta / delta).clamp(0.0, 1.0)
    };
    (target, shrinkage)
}

/// Ledoit-Wolf intensity toward the constant-correlation matrix.
///
/// `None` when any variance is zero (correlation undefined).
fn constant_correlation(x: &DMatrix<f64>, sample: &DMatrix<f64>) -> Option<(DMatrix<f64>, f64)> {
    let (t, n) = (x.nrows(), x.ncols());
    let var: Vec<f64> = (0..n).map(|i| sample[(i, i)]).collect();
    if var.iter().any(|v| *v <= f64::EPSILON) {
        return None;
    }
    let sd: Vec<f64> = var.iter().map(|v| v.sqrt()).collect();
    if n < 2 {
        return Some((sample.clone(), 0.0));
    }

    let mut corr_sum = 0.0;
    for i in 0..n {
        for j in 0..n {
            if i != j {
                corr_sum += sample[(i, j)] / (sd[i] * sd[j]);
            }
        }
    }
    let rbar = corr_sum / (n * (n - 1)) as f64;

    let mut target = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            target[(i, j)] = if i == j {
                var[i]
            } else {
                rbar * sd[i] * sd[j]
            };
        }
    }

    let tf = t as f64;
    // pi_ij = mean_t (x_ti x_tj - s_ij)^2
    let mut pi = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            let s = (0..t)
                .map(|r| (x[(r, i)] * x[(r, j)] - sample[(i, j)]).powi(2))
                .sum::<f64>();
            pi[(i, j)] = s / tf;
        }
    }
    let pi_hat = pi.sum();

    let mut rho = pi.diagonal().sum();
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let theta_ii = (0..t)
                .map(|r| (x[(r, i)].powi(2) - var[i]) * (x[(r, i)] * x[(r, j)] - sample[(i, j)]))
                .sum::<f64>()
                / tf;
            let theta_jj = (0..t)
                .map(|r| (x[(r, j)].powi(2) - var[j]) * (x[(r, i)] * x[(r, j)] - sample[(i, j)]))
                .sum::<f64>()
                / tf;
            rho += rbar / 2.0 * ((var[j] / var[i]).sqrt() * theta_ii + (var[i] / var[j]).sqrt() * theta_jj);
        }
    }

    let gamma = (&target - sample).map(|v| v * v).sum();
    let shrinkage = if gamma <= f64::EPSILON {
        0.0
    } else {
        ((pi_hat - rho) / gamma / tf).clamp(0.0, 1.0)
    };
    Some((target, shrinkage))
}
