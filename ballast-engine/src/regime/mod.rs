//! Regime-based exposure scaling.
//!
//! Two independent multipliers are applied to the optimizer output: the
//! crisis scale derived from macro stress ([`crisis`]) and the correlation
//! regime multiplier ([`correlation`]). Their product is the allocation's
//! exposure; weights are not renormalized, the shortfall is held as cash.

pub mod correlation;
pub mod crisis;

pub use correlation::{
    CachedFit, CorrelationReading, CorrelationRegimeConfig, CorrelationRegimeDetector,
    MixtureFit, RefitCadence, Regime,
};
pub use crisis::{CrisisConfig, CrisisIndicator, MacroReading, MacroSnapshot, crisis_scale};

use ballast_core::config::{Validatable, ValidationContext};
use chrono::NaiveDate;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Regime detector configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeConfig {
    /// Crisis indicator.
    #[serde(default)]
    pub crisis: CrisisConfig,
    /// Correlation regime.
    #[serde(default)]
    pub correlation: CorrelationRegimeConfig,
}

impl Validatable for RegimeConfig {
    fn validate_with_context(&self, ctx: &mut ValidationContext) {
        ctx.enter("regime");
        self.crisis.validate_into(ctx);
        self.correlation.validate_into(ctx);
        ctx.exit();
    }
}

/// Regime adjustments applied to one allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    /// Date of the inputs.
    pub effective_date: Option<NaiveDate>,
    /// Crisis Composite Indicator.
    pub cci: f64,
    /// Multiplier from the CCI.
    pub crisis_scale: f64,
    /// Correlation regime.
    pub correlation: Regime,
    /// Latest rolling average pairwise correlation.
    pub average_correlation: f64,
    /// Average per-period volatility over the latest window.
    pub average_volatility: f64,
    /// Multiplier from the correlation regime.
    pub correlation_multiplier: f64,
    /// `crisis_scale * correlation_multiplier`.
    pub exposure: f64,
    /// Stressed if either adjustment de-levers.
    pub classification: Regime,
}

impl RegimeState {
    fn combine(
        effective_date: Option<NaiveDate>,
        cci: f64,
        reading: &CorrelationReading,
    ) -> Self {
        let scale = crisis_scale(cci);
        let classification = if scale < 1.0 || reading.regime == Regime::Stressed {
            Regime::Stressed
        } else {
            Regime::Calm
        };
        Self {
            effective_date,
            cci,
            crisis_scale: scale,
            correlation: reading.regime,
            average_correlation: reading.average_correlation,
            average_volatility: reading.average_volatility,
            correlation_multiplier: reading.multiplier,
            exposure: scale * reading.multiplier,
            classification,
        }
    }
}

/// Combines the crisis indicator and the correlation regime.
#[derive(Debug, Clone, Default)]
pub struct RegimeDetector {
    crisis: CrisisIndicator,
    correlation: CorrelationRegimeDetector,
}

impl RegimeDetector {
    /// Creates a detector.
    #[must_use]
    pub fn new(config: RegimeConfig) -> Self {
        Self {
            crisis: CrisisIndicator::new(config.crisis),
            correlation: CorrelationRegimeDetector::new(config.correlation),
        }
    }

    /// Assesses the regime. With no return matrix (insufficient history) the
    /// correlation regime is calm and only the crisis scale applies.
    #[must_use]
    pub fn assess(
        &self,
        returns: Option<&DMatrix<f64>>,
        effective_date: Option<NaiveDate>,
        snapshot: &MacroSnapshot,
        cached: Option<&CachedFit>,
    ) -> (RegimeState, Option<CachedFit>) {
        let cci = self.crisis.cci(snapshot);
        let (reading, carried) = match returns {
            Some(values) => self.correlation.classify(values, cached),
            None => (CorrelationReading::calm(), cached.cloned()),
        };
        (RegimeState::combine(effective_date, cci, &reading), carried)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_neutral_inputs_full_exposure() {
        let (state, _) = RegimeDetector::default().assess(None, None, &MacroSnapshot::empty(), None);
        assert_abs_diff_eq!(state.exposure, 1.0);
        assert_eq!(state.classification, Regime::Calm);
    }

    #[test]
    fn test_crisis_scale_flows_into_exposure() {
        let snapshot = MacroSnapshot::empty().with_zscore("vix", 12.5);
        let (state, _) = RegimeDetector::default().assess(None, None, &snapshot, None);
        // 0.20 * 12.5 = 2.5
        assert_abs_diff_eq!(state.cci, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(state.exposure, 0.5, epsilon = 1e-12);
        assert_eq!(state.classification, Regime::Stressed);
        assert_eq!(state.correlation, Regime::Calm);
    }

    #[test]
    fn test_multipliers_compose() {
        let values = DMatrix::from_fn(40, 3, |r, c| 0.3 * if (r + c) % 2 == 0 { 1.0 } else { -1.0 });
        let snapshot = MacroSnapshot::empty().with_zscore("vix", 7.5);
        let (state, _) = RegimeDetector::default().assess(Some(&values), None, &snapshot, None);
        assert_eq!(state.correlation, Regime::Stressed);
        assert_abs_diff_eq!(state.exposure, 0.85 * 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_config_validation_paths() {
        let mut config = RegimeConfig::default();
        config.correlation.window = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("regime.correlation.window"));
    }
}
