//! Engine configuration.
//!
//! # Example
//!
//! ```yaml
//! allocation:
//!   min_allocation: 0.02
//!   max_allocation: 0.40
//! io:
//!   fetch_timeout: 750ms
//! cohorts:
//!   - strategy: book
//!     members: [carry, momentum, value]
//! ```

use crate::covariance::CovarianceConfig;
use crate::optimizer::AllocationConfig;
use crate::regime::RegimeConfig;
use crate::sanitizer::SanitizerConfig;
use ballast_core::config::{Configurable, EnvOverride, Validatable, ValidationContext, Validator};
use ballast_core::types::StrategyId;
use ballast_risk::{BreakerConfig, RetryConfig, RiskAnalyticsConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Timeouts on collaborator calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoConfig {
    /// Bound on a returns or macro fetch.
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Bound on a persistence read or write.
    #[serde(default = "default_persist_timeout", with = "humantime_serde")]
    pub persist_timeout: Duration,
}

fn default_fetch_timeout() -> Duration {
    Duration::from_millis(750)
}

fn default_persist_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: default_fetch_timeout(),
            persist_timeout: default_persist_timeout(),
        }
    }
}

/// A key whose capital is split across member strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortConfig {
    /// Cohort key passed to `compute_weights`.
    pub strategy: StrategyId,
    /// Strategies receiving weight.
    pub members: Vec<StrategyId>,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bounds, turnover and volatility targeting.
    #[serde(default)]
    pub allocation: AllocationConfig,
    /// Return cleaning.
    #[serde(default)]
    pub sanitizer: SanitizerConfig,
    /// Covariance estimation.
    #[serde(default)]
    pub covariance: CovarianceConfig,
    /// Regime scaling.
    #[serde(default)]
    pub regime: RegimeConfig,
    /// Realized risk.
    #[serde(default)]
    pub risk: RiskAnalyticsConfig,
    /// Circuit breaker.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Collaborator timeouts.
    #[serde(default)]
    pub io: IoConfig,
    /// Retry schedule for diagnostics writes.
    #[serde(default)]
    pub diagnostics_retry: RetryConfig,
    /// Allocation cohorts.
    #[serde(default)]
    pub cohorts: Vec<CohortConfig>,
}

impl EngineConfig {
    /// Members of a cohort.
    #[must_use]
    pub fn members(&self, strategy: &StrategyId) -> Option<&[StrategyId]> {
        self.cohorts
            .iter()
            .find(|c| &c.strategy == strategy)
            .map(|c| c.members.as_slice())
    }

    /// Rolling correlations available to the regime fit: the lookback yields
    /// `lookback - window + 1`, capped by `max_observations`.
    #[must_use]
    pub fn correlation_observations(&self) -> usize {
        let correlation = &self.regime.correlation;
        (self.sanitizer.lookback + 1)
            .saturating_sub(correlation.window)
            .min(correlation.max_observations)
    }
}

impl Validatable for EngineConfig {
    fn validate_with_context(&self, ctx: &mut ValidationContext) {
        self.allocation.validate_with_context(ctx);
        self.sanitizer.validate_with_context(ctx);
        self.covariance.validate_with_context(ctx);
        self.regime.validate_with_context(ctx);
        self.risk.validate_with_context(ctx);
        self.breaker.validate_with_context(ctx);

        ctx.enter("regime.correlation");
        Validator::new(ctx).custom(
            "window",
            || self.regime.correlation.window <= self.sanitizer.lookback,
            "must not exceed sanitizer.lookback",
        );
        ctx.exit();

        ctx.enter("io");
        Validator::new(ctx)
            .non_zero_duration("fetch_timeout", self.io.fetch_timeout)
            .non_zero_duration("persist_timeout", self.io.persist_timeout);
        ctx.exit();

        ctx.enter("cohorts");
        let mut keys = HashSet::new();
        for cohort in &self.cohorts {
            let mut v = Validator::new(ctx);
            v.require_non_empty("strategy", cohort.strategy.as_str())
                .require_any(&format!("{}.members", cohort.strategy), &cohort.members)
                .custom(
                    cohort.strategy.as_str(),
                    || keys.insert(cohort.strategy.clone()),
                    "duplicate cohort",
                );
            let unique: HashSet<_> = cohort.members.iter().collect();
            v.custom(
                &format!("{}.members", cohort.strategy),
                || unique.len() == cohort.members.len(),
                "duplicate member",
            );
        }
        ctx.exit();
    }
}

impl Configurable for EngineConfig {
    fn apply_env_overrides(&mut self, prefix: &str) {
        self.allocation.apply_env_overrides(prefix);
        self.sanitizer.apply_env_overrides(prefix);
        self.covariance.apply_env_overrides(prefix);
        self.risk.apply_env_overrides(prefix);
        self.breaker.apply_env_overrides(prefix);
        EnvOverride::apply_duration_ms(
            &format!("{prefix}_IO_FETCH_TIMEOUT_MS"),
            &mut self.io.fetch_timeout,
        );
        EnvOverride::apply_duration_ms(
            &format!("{prefix}_IO_PERSIST_TIMEOUT_MS"),
            &mut self.io.persist_timeout,
        );
    }

    fn env_var_names(prefix: &str) -> Vec<String> {
        let mut names = AllocationConfig::env_var_names(prefix);
        names.extend(SanitizerConfig::env_var_names(prefix));
        names.extend(CovarianceConfig::env_var_names(prefix));
        names.extend(RiskAnalyticsConfig::env_var_names(prefix));
        names.extend(BreakerConfig::env_var_names(prefix));
        names.push(format!("{prefix}_IO_FETCH_TIMEOUT_MS"));
        names.push(format!("{prefix}_IO_PERSIST_TIMEOUT_MS"));
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_core::config::{ConfigFormat, ConfigLoader};

    const YAML: &str = r"
allocation:
  max_allocation: 0.5
io:
  fetch_timeout: 250ms
regime:
  correlation:
    refit:
      every_n_cycles: 4
cohorts:
  - strategy: book
    members: [carry, momentum, value]
";

    #[test]
    fn test_load_yaml_with_defaults() {
        let config: EngineConfig = ConfigLoader::new()
            .load_str(YAML, ConfigFormat::Yaml)
            .unwrap();
        assert!((config.allocation.max_allocation - 0.5).abs() < f64::EPSILON);
        assert!((config.allocation.min_allocation - 0.02).abs() < f64::EPSILON);
        assert_eq!(config.io.fetch_timeout, Duration::from_millis(250));
        assert_eq!(config.members(&"book".into()).unwrap().len(), 3);
        assert!(config.members(&"carry".into()).is_none());
        assert_eq!(
            config.regime.correlation.refit,
            crate::regime::RefitCadence::EveryNCycles(4)
        );
    }

    #[test]
    fn test_duplicate_cohort_rejected() {
        let cohort = CohortConfig {
            strategy: "book".into(),
            members: vec!["a".into(), "b".into()],
        };
        let config = EngineConfig {
            cohorts: vec![cohort.clone(), cohort],
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cohorts.book"));
    }

    #[test]
    fn test_empty_members_rejected() {
        let config = EngineConfig {
            cohorts: vec![CohortConfig {
                strategy: "book".into(),
                members: Vec::new(),
            }],
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_correlation_cap_binds_at_default_lookback() {
        let mut config = EngineConfig::default();
        assert_eq!(
            config.correlation_observations(),
            config.regime.correlation.max_observations
        );
        assert_eq!(
            config.correlation_observations(),
            config.sanitizer.lookback - config.regime.correlation.window + 1
        );

        config.sanitizer.lookback = 104;
        assert_eq!(config.correlation_observations(), 17);
        config.regime.correlation.max_observations = 60;
        assert_eq!(config.correlation_observations(), 60);
        config.sanitizer.lookback = 40;
        assert_eq!(config.correlation_observations(), 21);
    }

    #[test]
    fn test_correlation_window_longer_than_lookback_rejected() {
        let mut config = EngineConfig::default();
        config.sanitizer.lookback = 12;
        config.sanitizer.min_periods = 4;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("regime.correlation.window"));
    }

    #[test]
    fn test_env_names_use_prefix() {
        let names = EngineConfig::env_var_names("BALLAST");
        assert!(names.contains(&"BALLAST_ALLOCATION_MIN_ALLOCATION".to_string()));
        assert!(names.contains(&"BALLAST_IO_FETCH_TIMEOUT_MS".to_string()));
    }
}
