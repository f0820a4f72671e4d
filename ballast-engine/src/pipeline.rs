//! The pure part of `compute_weights`.
//!
//! Given the fetched inputs, [`AllocationPipeline::run`] sanitizes the returns,
//! estimates the covariance, runs the optimizer and applies the regime
//! exposure. It performs no I/O and reads no clock, so identical inputs give
//! bit-identical outputs.

use crate::config::EngineConfig;
use crate::covariance::{CovarianceEstimate, CovarianceEstimator};
use crate::diagnostics::{AllocationDiagnostics, CovarianceSnapshot};
use crate::optimizer::{Optimization, PortfolioOptimizer};
use crate::regime::{CachedFit, MacroSnapshot, RegimeDetector, RegimeState};
use crate::sanitizer::{ReturnPanel, ReturnsSanitizer};
use crate::types::{Allocation, AllocationOutcome, Rejection, RejectionReason, Scheme};
use ballast_core::error::DataError;
use ballast_core::types::{ReturnSeries, StrategyId, WeightVector};
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

/// Tolerance used when checking a stored vector against the bounds.
const PREVIOUS_BOUND_TOLERANCE: f64 = 1e-9;

/// Everything one allocation run reads.
#[derive(Debug, Clone)]
pub struct AllocationInputs<'a> {
    /// Run identifier.
    pub run_id: Uuid,
    /// Run timestamp.
    pub now: DateTime<Utc>,
    /// Cohort key.
    pub strategy: &'a StrategyId,
    /// Active members, in vector order.
    pub members: &'a [StrategyId],
    /// Requested scheme.
    pub scheme: Scheme,
    /// Requested volatility target, clamped by the optimizer.
    pub risk_target: Option<f64>,
    /// Member return series, or `None` when a provider reported too little
    /// history.
    pub returns: Option<&'a [ReturnSeries]>,
    /// Macro readings.
    pub macro_snapshot: &'a MacroSnapshot,
    /// Weights currently in force.
    pub previous: Option<&'a WeightVector>,
    /// Mixture fit carried from the previous cycle.
    pub cached_fit: Option<&'a CachedFit>,
    /// Some input came from the stale cache.
    pub stale: bool,
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Allocation or rejection.
    pub outcome: AllocationOutcome,
    /// Audit record of the run.
    pub diagnostics: AllocationDiagnostics,
    /// Mixture fit to carry into the next cycle.
    pub fit: Option<CachedFit>,
}

/// Sanitizer, estimator, optimizer and regime detector wired together.
#[derive(Debug, Clone, Default)]
pub struct AllocationPipeline {
    sanitizer: ReturnsSanitizer,
    estimator: CovarianceEstimator,
    optimizer: PortfolioOptimizer,
    regime: RegimeDetector,
}

impl AllocationPipeline {
    /// Builds the pipeline from the engine configuration.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            sanitizer: ReturnsSanitizer::new(config.sanitizer.clone()),
            estimator: CovarianceEstimator::new(config.covariance.clone()),
            optimizer: PortfolioOptimizer::new(config.allocation.clone()),
            regime: RegimeDetector::new(config.regime.clone()),
        }
    }

    /// The sanitizer; its lookback is the fetch window.
    #[must_use]
    pub fn sanitizer(&self) -> &ReturnsSanitizer {
        &self.sanitizer
    }

    /// The optimizer.
    #[must_use]
    pub fn optimizer(&self) -> &PortfolioOptimizer {
        &self.optimizer
    }

    /// Runs one allocation.
    #[must_use]
    pub fn run(&self, inputs: &AllocationInputs<'_>) -> PipelineOutput {
        let panel = match inputs.returns.map(|series| self.sanitizer.sanitize(series)) {
            None | Some(Err(DataError::InsufficientData { .. })) => {
                return self.insufficient(inputs);
            }
            Some(Err(e)) => {
                let (regime, fit) = self.assess(inputs, None);
                return self.reject(
                    inputs,
                    regime,
                    fit,
                    None,
                    RejectionReason::EstimationFailure {
                        reason: e.to_string(),
                    },
                );
            }
            Some(Ok(panel)) => panel,
        };

        let (regime, fit) = self.assess(inputs, Some(&panel));
        let estimate = match self.estimator.estimate(&panel) {
            Ok(estimate) => estimate,
            Err(e) => {
                return self.reject(
                    inputs,
                    regime,
                    fit,
                    Some(&panel),
                    RejectionReason::EstimationFailure {
                        reason: e.to_string(),
                    },
                );
            }
        };

        let previous = self.aligned_previous(inputs.previous, panel.strategies());
        let optimization = self.optimizer.optimize(
            inputs.scheme,
            &estimate,
            previous.as_deref(),
            inputs.risk_target,
        );
        let weights = match &optimization.result {
            Ok(weights) => WeightVector::from_pairs(
                panel.strategies().iter().cloned().zip(weights.iter().copied()),
            )
            .with_exposure(regime.exposure),
            Err(reason) => {
                let reason = reason.clone();
                let mut output = self.reject(inputs, regime, fit, Some(&panel), reason);
                fill_estimate(&mut output.diagnostics, &estimate, &optimization);
                return output;
            }
        };

        debug!(
            strategy = %inputs.strategy,
            scheme = %inputs.scheme,
            exposure = regime.exposure,
            unchanged = optimization.unchanged,
            "allocation computed"
        );
        let mut diagnostics = record(inputs, &regime, panel.strategies(), &weights);
        diagnostics.replaced_returns = panel.replaced();
        fill_estimate(&mut diagnostics, &estimate, &optimization);

        PipelineOutput {
            outcome: AllocationOutcome::Allocated(Allocation {
                run_id: inputs.run_id,
                strategy: inputs.strategy.clone(),
                weights,
                computed_at: inputs.now,
                as_of: panel.last_date(),
                scheme: inputs.scheme,
                regime,
                insufficient_data: false,
                stale: inputs.stale,
                converged: optimization.converged,
            }),
            diagnostics,
            fit,
        }
    }

    fn assess(
        &self,
        inputs: &AllocationInputs<'_>,
        panel: Option<&ReturnPanel>,
    ) -> (RegimeState, Option<CachedFit>) {
        self.regime.assess(
            panel.map(ReturnPanel::values),
            panel.and_then(ReturnPanel::last_date),
            inputs.macro_snapshot,
            inputs.cached_fit,
        )
    }

    /// Equal weights when history is too short. Only the crisis scale applies.
    fn insufficient(&self, inputs: &AllocationInputs<'_>) -> PipelineOutput {
        let (regime, fit) = self.assess(inputs, None);
        let weights = WeightVector::equal(inputs.members).with_exposure(regime.exposure);
        debug!(strategy = %inputs.strategy, "insufficient history, equal weights");
        let mut diagnostics = record(inputs, &regime, inputs.members, &weights);
        diagnostics.raw_weights = diagnostics.final_weights.clone();
        diagnostics.insufficient_data = true;
        PipelineOutput {
            outcome: AllocationOutcome::Allocated(Allocation {
                run_id: inputs.run_id,
                strategy: inputs.strategy.clone(),
                weights,
                computed_at: inputs.now,
                as_of: None,
                scheme: inputs.scheme,
                regime,
                insufficient_data: true,
                stale: inputs.stale,
                converged: true,
            }),
            diagnostics,
            fit,
        }
    }

    /// Keeps the previous vector when it is usable, otherwise falls back to
    /// equal weights at the current exposure.
    fn reject(
        &self,
        inputs: &AllocationInputs<'_>,
        regime: RegimeState,
        fit: Option<CachedFit>,
        panel: Option<&ReturnPanel>,
        reason: RejectionReason,
    ) -> PipelineOutput {
        let fallback = match inputs.previous {
            Some(prev) if self.is_usable(prev, inputs.members) => prev.clone(),
            _ => WeightVector::equal(inputs.members).with_exposure(regime.exposure),
        };
        debug!(strategy = %inputs.strategy, %reason, "allocation rejected");

        let order = panel.map_or(inputs.members, ReturnPanel::strategies);
        let mut diagnostics = record(inputs, &regime, order, &fallback);
        diagnostics.rejection = Some(reason.clone());
        diagnostics.converged = false;
        if let Some(panel) = panel {
            diagnostics.replaced_returns = panel.replaced();
        }
        PipelineOutput {
            outcome: AllocationOutcome::Rejected(Rejection {
                run_id: inputs.run_id,
                strategy: inputs.strategy.clone(),
                reason,
                fallback,
                computed_at: inputs.now,
                stale: inputs.stale,
            }),
            diagnostics,
            fit,
        }
    }

    /// True when `previous` covers exactly `members` and satisfies the
    /// current bounds.
    fn is_usable(&self, previous: &WeightVector, members: &[StrategyId]) -> bool {
        let cfg = self.optimizer.config();
        previous.len() == members.len()
            && members.iter().all(|m| previous.weight(m).is_some())
            && previous.is_unit_sum()
            && previous.within_bounds(
                cfg.min_allocation,
                cfg.max_allocation,
                PREVIOUS_BOUND_TOLERANCE,
            )
    }

    /// The previous weights in panel order, if usable for the turnover filter.
    fn aligned_previous(
        &self,
        previous: Option<&WeightVector>,
        order: &[StrategyId],
    ) -> Option<Vec<f64>> {
        let previous = previous?;
        if !self.is_usable(previous, order) {
            return None;
        }
        order.iter().map(|s| previous.weight(s)).collect()
    }
}

fn record(
    inputs: &AllocationInputs<'_>,
    regime: &RegimeState,
    order: &[StrategyId],
    weights: &WeightVector,
) -> AllocationDiagnostics {
    AllocationDiagnostics {
        run_id: inputs.run_id,
        strategy: inputs.strategy.clone(),
        recorded_at: inputs.now,
        scheme: inputs.scheme,
        strategies: order.to_vec(),
        expected_returns: Vec::new(),
        covariance: None,
        regime: regime.clone(),
        volatility_scale: 1.0,
        raw_weights: Vec::new(),
        final_weights: order
            .iter()
            .map(|s| weights.weight(s).unwrap_or(0.0))
            .collect(),
        exposure: weights.exposure(),
        rejection: None,
        replaced_returns: 0,
        insufficient_data: false,
        stale: inputs.stale,
        converged: true,
        frozen: 0,
    }
}

fn fill_estimate(
    diagnostics: &mut AllocationDiagnostics,
    estimate: &CovarianceEstimate,
    optimization: &Optimization,
) {
    diagnostics.expected_returns = estimate.expected_returns.iter().copied().collect();
    diagnostics.covariance = Some(CovarianceSnapshot::from(estimate));
    diagnostics.volatility_scale = optimization.volatility_scale;
    diagnostics.raw_weights.clone_from(&optimization.raw);
    diagnostics.converged = optimization.converged && optimization.result.is_ok();
    diagnostics.frozen = optimization.frozen;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CohortConfig;
    use approx::assert_abs_diff_eq;
    use chrono::{Days, NaiveDate};

    fn noise(seed: usize) -> f64 {
        let x = ((seed as f64 + 1.0) * 12.9898).sin() * 43_758.545_3;
        2.0 * (x - x.floor()) - 1.0
    }

    fn ids(n: usize) -> Vec<StrategyId> {
        (0..n).map(|i| StrategyId::new(format!("s{i}"))).collect()
    }

    fn series(members: &[StrategyId], periods: usize, scale: f64) -> Vec<ReturnSeries> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        members
            .iter()
            .enumerate()
            .map(|(j, id)| {
                ReturnSeries::from_pairs(
                    id.as_str(),
                    (0..periods).map(|t| {
                        (
                            start + Days::new(7 * t as u64),
                            0.002 + scale * noise(t * 31 + j * 7),
                        )
                    }),
                )
                .unwrap()
            })
            .collect()
    }

    fn config(n: usize) -> EngineConfig {
        EngineConfig {
            cohorts: vec![CohortConfig {
                strategy: "book".into(),
                members: ids(n),
            }],
            ..EngineConfig::default()
        }
    }

    fn inputs<'a>(
        key: &'a StrategyId,
        members: &'a [StrategyId],
        returns: Option<&'a [ReturnSeries]>,
        snapshot: &'a MacroSnapshot,
        previous: Option<&'a WeightVector>,
    ) -> AllocationInputs<'a> {
        AllocationInputs {
            run_id: Uuid::nil(),
            now: DateTime::<Utc>::UNIX_EPOCH,
            strategy: key,
            members,
            scheme: Scheme::MaxSharpe,
            risk_target: None,
            returns,
            macro_snapshot: snapshot,
            previous,
            cached_fit: None,
            stale: false,
        }
    }

    #[test]
    fn test_allocation_is_bounded_and_unit_sum() {
        let members = ids(5);
        let returns = series(&members, 36, 0.01);
        let key = StrategyId::from("book");
        let snapshot = MacroSnapshot::empty();
        let pipeline = AllocationPipeline::new(&config(5));

        let out = pipeline.run(&inputs(&key, &members, Some(&returns), &snapshot, None));
        let AllocationOutcome::Allocated(allocation) = &out.outcome else {
            panic!("expected an allocation, got {:?}", out.outcome);
        };
        assert_abs_diff_eq!(allocation.weights.sum(), 1.0, epsilon = 1e-9);
        assert!(allocation.weights.within_bounds(0.02, 0.40, 1e-12));
        assert_eq!(allocation.as_of, returns[0].last_date());
        assert_eq!(out.diagnostics.strategies, members);
        assert!(out.diagnostics.covariance.is_some());
        assert_eq!(out.diagnostics.raw_weights.len(), 5);
    }

    #[test]
    fn test_short_history_gives_equal_weights() {
        let members = ids(4);
        let returns = series(&members, 3, 0.01);
        let key = StrategyId::from("book");
        let snapshot = MacroSnapshot::empty();
        let pipeline = AllocationPipeline::new(&config(4));

        let out = pipeline.run(&inputs(&key, &members, Some(&returns), &snapshot, None));
        let AllocationOutcome::Allocated(allocation) = &out.outcome else {
            panic!("expected an allocation");
        };
        assert!(allocation.insufficient_data);
        for (_, w) in allocation.weights.iter() {
            assert_abs_diff_eq!(w, 0.25);
        }
        assert_eq!(out.outcome.label(), "insufficient_data");
        assert!(out.diagnostics.insufficient_data);
    }

    #[test]
    fn test_crisis_halves_exposure() {
        let members = ids(3);
        let returns = series(&members, 12, 0.005);
        let key = StrategyId::from("book");
        let pipeline = AllocationPipeline::new(&config(3));

        let calm = MacroSnapshot::empty();
        let stressed = MacroSnapshot::empty().with_zscore("vix", 12.5);
        let before = pipeline.run(&inputs(&key, &members, Some(&returns), &calm, None));
        let after = pipeline.run(&inputs(&key, &members, Some(&returns), &stressed, None));

        assert_abs_diff_eq!(before.outcome.weights().gross_exposure(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(after.outcome.weights().gross_exposure(), 0.5, epsilon = 1e-9);
        assert_eq!(
            before.outcome.weights().values(),
            after.outcome.weights().values()
        );
    }

    #[test]
    fn test_small_move_returns_previous_bit_for_bit() {
        let members = ids(4);
        let returns = series(&members, 36, 0.01);
        let key = StrategyId::from("book");
        let snapshot = MacroSnapshot::empty();
        let pipeline = AllocationPipeline::new(&config(4));

        let first = pipeline.run(&inputs(&key, &members, Some(&returns), &snapshot, None));
        let previous = first.outcome.weights().clone();
        let second = pipeline.run(&inputs(
            &key,
            &members,
            Some(&returns),
            &snapshot,
            Some(&previous),
        ));
        assert_eq!(second.outcome.weights(), &previous);
        assert_eq!(second.diagnostics.frozen, 4);
    }

    #[test]
    fn test_mismatched_previous_is_ignored() {
        let members = ids(3);
        let returns = series(&members, 36, 0.01);
        let key = StrategyId::from("book");
        let snapshot = MacroSnapshot::empty();
        let pipeline = AllocationPipeline::new(&config(3));
        let stale = WeightVector::equal(&ids(4));

        let out = pipeline.run(&inputs(&key, &members, Some(&returns), &snapshot, Some(&stale)));
        assert!(!out.outcome.is_rejected());
        assert_eq!(out.diagnostics.frozen, 0);
        assert_eq!(out.outcome.weights().len(), 3);
    }

    #[test]
    fn test_anomalous_volatility_keeps_previous() {
        let members = ids(3);
        let returns = series(&members, 36, 2.0);
        let key = StrategyId::from("book");
        let snapshot = MacroSnapshot::empty();
        let mut cfg = config(3);
        cfg.allocation.volatility_ceiling = 0.5;
        let pipeline = AllocationPipeline::new(&cfg);
        let previous = WeightVector::from_pairs([
            (members[0].clone(), 0.3),
            (members[1].clone(), 0.3),
            (members[2].clone(), 0.4),
        ]);

        let out = pipeline.run(&inputs(
            &key,
            &members,
            Some(&returns),
            &snapshot,
            Some(&previous),
        ));
        assert!(matches!(
            out.outcome.rejection(),
            Some(RejectionReason::AnomalousVolatility { .. })
        ));
        assert_eq!(out.outcome.weights(), &previous);
        assert!(out.diagnostics.rejection.is_some());
        assert!(out.diagnostics.covariance.is_some());
    }

    #[test]
    fn test_identical_inputs_identical_outputs() {
        let members = ids(6);
        let returns = series(&members, 30, 0.02);
        let key = StrategyId::from("book");
        let snapshot = MacroSnapshot::empty().with_zscore("vix", 1.0);
        let pipeline = AllocationPipeline::new(&config(6));

        let a = pipeline.run(&inputs(&key, &members, Some(&returns), &snapshot, None));
        let b = pipeline.run(&inputs(&key, &members, Some(&returns), &snapshot, None));
        assert_eq!(a.outcome, b.outcome);
        assert_eq!(a.diagnostics, b.diagnostics);
    }
}
