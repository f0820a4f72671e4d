//! Portfolio optimizer.
//!
//! Produces raw unit-sum weights for a [`Scheme`] and post-processes them in a
//! fixed order:
//!
//! 1. volatility targeting: scale so `sqrt(w' S w)` equals the clamped target
//! 2. projection onto the allocation bounds (renormalizes to unit sum)
//! 3. turnover filter against the previous weights
//! 4. anomaly guard on the resulting volatility
//!
//! The volatility scale is undone by the unit-sum projection; it is kept in the
//! result for diagnostics.

mod constraints;
mod schemes;

pub use constraints::{
    BOUND_TOLERANCE, TurnoverResult, apply_turnover_filter, bounds_feasible, project_to_bounds,
};
pub use schemes::{
    black_litterman, black_litterman_posterior, equal_weight, implied_returns, max_sharpe,
    min_variance, risk_parity, robust_min_max,
};

use crate::covariance::CovarianceEstimate;
use crate::types::{RejectionReason, Scheme};
use ballast_core::config::{Configurable, EnvOverride, Validatable, ValidationContext, Validator};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Iterative solver limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Risk-parity convergence tolerance.
    #[serde(default = "default_risk_parity_tolerance")]
    pub risk_parity_tolerance: f64,
    /// Risk-parity iteration bound.
    #[serde(default = "default_risk_parity_max_iterations")]
    pub risk_parity_max_iterations: usize,
    /// Minimum-variance convergence tolerance.
    #[serde(default = "default_min_variance_tolerance")]
    pub min_variance_tolerance: f64,
    /// Minimum-variance iteration bound.
    #[serde(default = "default_min_variance_max_iterations")]
    pub min_variance_max_iterations: usize,
}

fn default_risk_parity_tolerance() -> f64 {
    1e-8
}

fn default_risk_parity_max_iterations() -> usize {
    100
}

fn default_min_variance_tolerance() -> f64 {
    1e-10
}

fn default_min_variance_max_iterations() -> usize {
    1000
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            risk_parity_tolerance: default_risk_parity_tolerance(),
            risk_parity_max_iterations: default_risk_parity_max_iterations(),
            min_variance_tolerance: default_min_variance_tolerance(),
            min_variance_max_iterations: default_min_variance_max_iterations(),
        }
    }
}

/// Black-Litterman blend of the equal-weight equilibrium and the estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackLittermanConfig {
    /// `delta` in the implied returns `delta * S * w`.
    #[serde(default = "default_risk_aversion")]
    pub risk_aversion: f64,
    /// Scale of the prior covariance.
    #[serde(default = "default_tau")]
    pub tau: f64,
}

fn default_risk_aversion() -> f64 {
    2.5
}

fn default_tau() -> f64 {
    0.05
}

impl Default for BlackLittermanConfig {
    fn default() -> Self {
        Self {
            risk_aversion: default_risk_aversion(),
            tau: default_tau(),
        }
    }
}

/// Worst-case margins for the robust scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustConfig {
    /// Relative covariance inflation.
    #[serde(default = "default_covariance_margin")]
    pub covariance_margin: f64,
    /// Expected-return cut, in units of worst-case volatility.
    #[serde(default = "default_return_margin")]
    pub return_margin: f64,
}

fn default_covariance_margin() -> f64 {
    0.05
}

fn default_return_margin() -> f64 {
    0.1
}

impl Default for RobustConfig {
    fn default() -> Self {
        Self {
            covariance_margin: default_covariance_margin(),
            return_margin: default_return_margin(),
        }
    }
}

/// Bounds, turnover and volatility settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Lower weight bound.
    #[serde(default = "default_min_allocation")]
    pub min_allocation: f64,
    /// Upper weight bound.
    #[serde(default = "default_max_allocation")]
    pub max_allocation: f64,
    /// Changes smaller than this keep the previous weight.
    #[serde(default = "default_turnover_threshold")]
    pub turnover_threshold: f64,
    /// Annualized volatility target when the caller gives none.
    #[serde(default = "default_target_volatility")]
    pub target_volatility: f64,
    /// Lower clamp on the target.
    #[serde(default = "default_min_target_volatility")]
    pub min_target_volatility: f64,
    /// Upper clamp on the target.
    #[serde(default = "default_max_target_volatility")]
    pub max_target_volatility: f64,
    /// Volatility above this rejects the result.
    #[serde(default = "default_volatility_ceiling")]
    pub volatility_ceiling: f64,
    /// Annual risk-free rate for the tangency scheme.
    #[serde(default)]
    pub risk_free_rate: f64,
    /// Solver limits.
    #[serde(default)]
    pub solver: SolverConfig,
    /// Black-Litterman scheme.
    #[serde(default)]
    pub black_litterman: BlackLittermanConfig,
    /// Robust scheme.
    #[serde(default)]
    pub robust: RobustConfig,
}

fn default_min_allocation() -> f64 {
    0.02
}

fn default_max_allocation() -> f64 {
    0.40
}

fn default_turnover_threshold() -> f64 {
    0.005
}

fn default_target_volatility() -> f64 {
    0.11
}

fn default_min_target_volatility() -> f64 {
    0.10
}

fn default_max_target_volatility() -> f64 {
    0.12
}

fn default_volatility_ceiling() -> f64 {
    5.0
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            min_allocation: default_min_allocation(),
            max_allocation: default_max_allocation(),
            turnover_threshold: default_turnover_threshold(),
            target_volatility: default_target_volatility(),
            min_target_volatility: default_min_target_volatility(),
            max_target_volatility: default_max_target_volatility(),
            volatility_ceiling: default_volatility_ceiling(),
            risk_free_rate: 0.0,
            solver: SolverConfig::default(),
            black_litterman: BlackLittermanConfig::default(),
            robust: RobustConfig::default(),
        }
    }
}

impl AllocationConfig {
    /// Volatility target for a request, clamped to the configured band.
    #[must_use]
    pub fn clamped_target(&self, risk_target: Option<f64>) -> f64 {
        risk_target
            .filter(|t| t.is_finite())
            .unwrap_or(self.target_volatility)
            .max(self.min_target_volatility)
            .min(self.max_target_volatility)
    }
}

impl Validatable for AllocationConfig {
    fn validate_with_context(&self, ctx: &mut ValidationContext) {
        ctx.enter("allocation");
        let mut v = Validator::new(ctx);
        v.in_range("min_allocation", &self.min_allocation, &0.0, &1.0)
            .in_range("max_allocation", &self.max_allocation, &0.0, &1.0)
            .custom(
                "max_allocation",
                || self.min_allocation <= self.max_allocation,
                "must not be below min_allocation",
            )
            .non_negative("turnover_threshold", &self.turnover_threshold)
            .positive("target_volatility", &self.target_volatility)
            .positive("min_target_volatility", &self.min_target_volatility)
            .custom(
                "max_target_volatility",
                || self.min_target_volatility <= self.max_target_volatility,
                "must not be below min_target_volatility",
            )
            .positive("volatility_ceiling", &self.volatility_ceiling)
            .finite("risk_free_rate", self.risk_free_rate)
            .positive("solver.risk_parity_tolerance", &self.solver.risk_parity_tolerance)
            .positive("solver.risk_parity_max_iterations", &self.solver.risk_parity_max_iterations)
            .positive("solver.min_variance_tolerance", &self.solver.min_variance_tolerance)
            .positive(
                "solver.min_variance_max_iterations",
                &self.solver.min_variance_max_iterations,
            )
            .positive("black_litterman.risk_aversion", &self.black_litterman.risk_aversion)
            .positive("black_litterman.tau", &self.black_litterman.tau)
            .non_negative("robust.covariance_margin", &self.robust.covariance_margin)
            .non_negative("robust.return_margin", &self.robust.return_margin);
        ctx.exit();
    }
}

impl Configurable for AllocationConfig {
    fn apply_env_overrides(&mut self, prefix: &str) {
        EnvOverride::apply_number(
            &format!("{prefix}_ALLOCATION_MIN_ALLOCATION"),
            &mut self.min_allocation,
        );
        EnvOverride::apply_number(
            &format!("{prefix}_ALLOCATION_MAX_ALLOCATION"),
            &mut self.max_allocation,
        );
        EnvOverride::apply_number(
            &format!("{prefix}_ALLOCATION_TURNOVER_THRESHOLD"),
            &mut self.turnover_threshold,
        );
        EnvOverride::apply_number(
            &format!("{prefix}_ALLOCATION_TARGET_VOLATILITY"),
            &mut self.target_volatility,
        );
        EnvOverride::apply_number(
            &format!("{prefix}_ALLOCATION_RISK_FREE_RATE"),
            &mut self.risk_free_rate,
        );
    }

    fn env_var_names(prefix: &str) -> Vec<String> {
        [
            "MIN_ALLOCATION",
            "MAX_ALLOCATION",
            "TURNOVER_THRESHOLD",
            "TARGET_VOLATILITY",
            "RISK_FREE_RATE",
        ]
        .iter()
        .map(|name| format!("{prefix}_ALLOCATION_{name}"))
        .collect()
    }
}

/// Intermediate and final optimizer output for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimization {
    /// Scheme output before post-processing. Empty if the inputs were rejected.
    pub raw: Vec<f64>,
    /// Volatility target after clamping.
    pub target_volatility: f64,
    /// Factor applied to reach the target (1.0 when volatility is zero).
    pub volatility_scale: f64,
    /// Assets held at their previous weight.
    pub frozen: usize,
    /// The turnover filter returned the previous vector.
    pub unchanged: bool,
    /// The turnover filter could not be applied.
    pub turnover_skipped: bool,
    /// Solver convergence.
    pub converged: bool,
    /// Annualized volatility of the final weights.
    pub volatility: f64,
    /// Final bounded weights, or why there are none.
    pub result: Result<Vec<f64>, RejectionReason>,
}

impl Optimization {
    fn rejected(target_volatility: f64, reason: RejectionReason) -> Self {
        Self {
            raw: Vec::new(),
            target_volatility,
            volatility_scale: 1.0,
            frozen: 0,
            unchanged: false,
            turnover_skipped: false,
            converged: false,
            volatility: f64::NAN,
            result: Err(reason),
        }
    }
}

/// Turns an estimate into bounded weights.
#[derive(Debug, Clone, Default)]
pub struct PortfolioOptimizer {
    config: AllocationConfig,
}

impl PortfolioOptimizer {
    /// Creates an optimizer.
    #[must_use]
    pub fn new(config: AllocationConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &AllocationConfig {
        &self.config
    }

    /// Raw unit-sum weights and solver convergence.
    #[must_use]
    pub fn raw_weights(&self, scheme: Scheme, estimate: &CovarianceEstimate) -> (Vec<f64>, bool) {
        let cov = &estimate.matrix;
        let solver = &self.config.solver;
        match scheme {
            Scheme::MaxSharpe => (max_sharpe(cov, &estimate.expected_returns), true),
            Scheme::Tangency => {
                let excess: DVector<f64> = estimate
                    .expected_returns
                    .map(|mu| mu - self.config.risk_free_rate);
                (max_sharpe(cov, &excess), true)
            }
            Scheme::RiskParity => risk_parity(
                cov,
                solver.risk_parity_tolerance,
                solver.risk_parity_max_iterations,
            ),
            Scheme::MinVariance => min_variance(
                cov,
                solver.min_variance_tolerance,
                solver.min_variance_max_iterations,
            ),
            Scheme::BlackLitterman => {
                let bl = &self.config.black_litterman;
                (
                    black_litterman(cov, &estimate.expected_returns, bl.risk_aversion, bl.tau),
                    true,
                )
            }
            Scheme::Robust => {
                let robust = &self.config.robust;
                (
                    robust_min_max(
                        cov,
                        &estimate.expected_returns,
                        robust.covariance_margin,
                        robust.return_margin,
                    ),
                    true,
                )
            }
            Scheme::EqualWeight => (equal_weight(cov.nrows()), true),
        }
    }

    /// Runs the scheme and the post-processing chain.
    ///
    /// `previous` must be aligned with the estimate's strategy order and hold a
    /// valid bounded vector; pass `None` to skip the turnover filter.
    #[must_use]
    pub fn optimize(
        &self,
        scheme: Scheme,
        estimate: &CovarianceEstimate,
        previous: Option<&[f64]>,
        risk_target: Option<f64>,
    ) -> Optimization {
        let target_volatility = self.config.clamped_target(risk_target);
        let n = estimate.matrix.nrows();
        if estimate.matrix.ncols() != n || estimate.expected_returns.len() != n {
            return Optimization::rejected(
                target_volatility,
                RejectionReason::EstimationFailure {
                    reason: format!(
                        "covariance {}x{} does not match {} expected returns",
                        n,
                        estimate.matrix.ncols(),
                        estimate.expected_returns.len()
                    ),
                },
            );
        }
        if previous.is_some_and(|p| p.len() != n) {
            return Optimization::rejected(
                target_volatility,
                RejectionReason::EstimationFailure {
                    reason: "previous weights do not match the active set".to_string(),
                },
            );
        }

        let (raw, converged) = self.raw_weights(scheme, estimate);
        if raw.iter().any(|w| !w.is_finite()) {
            return Optimization {
                converged,
                ..Optimization::rejected(
                    target_volatility,
                    RejectionReason::EstimationFailure {
                        reason: format!("{scheme} produced non-finite weights"),
                    },
                )
            };
        }
        if !converged {
            warn!(%scheme, "solver did not converge within its iteration bound");
        }

        let raw_volatility = estimate.portfolio_volatility(&raw);
        let volatility_scale = if raw_volatility > 0.0 && raw_volatility.is_finite() {
            target_volatility / raw_volatility
        } else {
            1.0
        };
        let scaled: Vec<f64> = raw.iter().map(|w| w * volatility_scale).collect();

        let cfg = &self.config;
        let Some(bounded) = project_to_bounds(&scaled, 1.0, cfg.min_allocation, cfg.max_allocation)
        else {
            return Optimization {
                raw,
                converged,
                volatility_scale,
                ..Optimization::rejected(
                    target_volatility,
                    RejectionReason::EstimationFailure {
                        reason: format!(
                            "bounds [{}, {}] infeasible for {n} strategies",
                            cfg.min_allocation, cfg.max_allocation
                        ),
                    },
                )
            };
        };

        let turnover = match previous {
            Some(prev) => apply_turnover_filter(
                &bounded,
                prev,
                cfg.turnover_threshold,
                cfg.min_allocation,
                cfg.max_allocation,
            ),
            None => TurnoverResult {
                weights: bounded,
                frozen: 0,
                unchanged: false,
                skipped: false,
            },
        };

        let volatility = estimate.portfolio_volatility(&turnover.weights);
        let result = if !volatility.is_finite() || volatility > cfg.volatility_ceiling {
            warn!(volatility, ceiling = cfg.volatility_ceiling, "anomalous portfolio volatility");
            Err(RejectionReason::AnomalousVolatility { volatility })
        } else {
            Ok(turnover.weights)
        };

        debug!(
            %scheme,
            volatility_scale,
            volatility,
            frozen = turnover.frozen,
            "optimization complete"
        );
        Optimization {
            raw,
            target_volatility,
            volatility_scale,
            frozen: turnover.frozen,
            unchanged: turnover.unchanged,
            turnover_skipped: turnover.skipped,
            converged,
            volatility,
            result,
        }
    }
}
