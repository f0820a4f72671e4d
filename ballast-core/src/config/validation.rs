//! Path-aware configuration checks.
//!
//! Every failure is recorded and validation carries on, so one run reports
//! all the problems in a file. Sections push their name with
//! [`ValidationContext::enter`] and failures are reported against the dotted
//! path (`regime.correlation.z_threshold`).

use crate::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;

/// Outcome of validating a whole configuration.
pub type ValidationResult = Result<(), ConfigError>;

/// Section stack plus the failures recorded under it.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    sections: Vec<String>,
    problems: Vec<ConfigError>,
}

impl ValidationContext {
    /// Starts at the root with nothing recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Descends into `section`.
    pub fn enter(&mut self, section: impl Into<String>) {
        self.sections.push(section.into());
    }

    /// Climbs back out of the innermost section.
    pub fn exit(&mut self) {
        self.sections.pop();
    }

    /// Dotted path of the section being validated; empty at the root.
    #[must_use]
    pub fn current_path(&self) -> String {
        self.sections.join(".")
    }

    /// Failures so far, in the order found.
    #[must_use]
    pub fn errors(&self) -> &[ConfigError] {
        &self.problems
    }

    /// Ends validation. Several failures fold into [`ConfigError::Invalid`].
    pub fn into_result(self) -> ValidationResult {
        ConfigError::from_problems(self.problems).map_or(Ok(()), Err)
    }

    fn qualify(&self, field: &str) -> String {
        if self.sections.is_empty() {
            field.to_string()
        } else {
            format!("{}.{field}", self.current_path())
        }
    }

    fn missing(&mut self, field: &str) {
        let section = (!self.sections.is_empty()).then(|| self.current_path());
        self.problems.push(ConfigError::MissingField {
            field: field.to_string(),
            section,
        });
    }

    fn reject(&mut self, field: &str, reason: impl Into<String>) {
        let field = self.qualify(field);
        self.problems.push(ConfigError::invalid_value(field, reason));
    }
}

/// Chainable checks that record into a [`ValidationContext`].
///
/// ```
/// use ballast_core::config::{ValidationContext, Validator};
///
/// let mut ctx = ValidationContext::new();
/// ctx.enter("allocation");
/// Validator::new(&mut ctx)
///     .in_range("max_allocation", &1.5, &0.0, &1.0)
///     .positive("lookback", &0_usize);
/// assert_eq!(ctx.errors().len(), 2);
/// ```
#[derive(Debug)]
pub struct Validator<'a> {
    ctx: &'a mut ValidationContext,
}

impl<'a> Validator<'a> {
    /// Records into `ctx` under its current section.
    pub fn new(ctx: &'a mut ValidationContext) -> Self {
        Self { ctx }
    }

    /// Blank text counts as missing.
    pub fn require_non_empty(&mut self, field: &str, value: &str) -> &mut Self {
        if value.trim().is_empty() {
            self.ctx.missing(field);
        }
        self
    }

    /// An empty list counts as missing.
    pub fn require_any<T>(&mut self, field: &str, values: &[T]) -> &mut Self {
        if values.is_empty() {
            self.ctx.missing(field);
        }
        self
    }

    /// `min <= value <= max`. Incomparable values (NaN) fail.
    pub fn in_range<T: PartialOrd + std::fmt::Display>(
        &mut self,
        field: &str,
        value: &T,
        min: &T,
        max: &T,
    ) -> &mut Self {
        let inside = matches!(value.partial_cmp(min), Some(o) if o.is_ge())
            && matches!(value.partial_cmp(max), Some(o) if o.is_le());
        if !inside {
            self.ctx
                .reject(field, format!("{value} is outside [{min}, {max}]"));
        }
        self
    }

    /// Strictly above zero.
    pub fn positive<T: PartialOrd + Default + std::fmt::Display>(
        &mut self,
        field: &str,
        value: &T,
    ) -> &mut Self {
        if !matches!(value.partial_cmp(&T::default()), Some(o) if o.is_gt()) {
            self.ctx.reject(field, format!("{value} must be above zero"));
        }
        self
    }

    /// Zero or above.
    pub fn non_negative<T: PartialOrd + Default + std::fmt::Display>(
        &mut self,
        field: &str,
        value: &T,
    ) -> &mut Self {
        if !matches!(value.partial_cmp(&T::default()), Some(o) if o.is_ge()) {
            self.ctx.reject(field, format!("{value} must not be negative"));
        }
        self
    }

    /// Neither NaN nor infinite.
    pub fn finite(&mut self, field: &str, value: f64) -> &mut Self {
        if !value.is_finite() {
            self.ctx.reject(field, format!("{value} is not finite"));
        }
        self
    }

    /// Durations used as timeouts or cool-downs cannot be zero.
    pub fn non_zero_duration(&mut self, field: &str, value: Duration) -> &mut Self {
        if value.is_zero() {
            self.ctx.reject(field, "Duration must be non-zero");
        }
        self
    }

    /// Fails with `message` when `holds` returns false.
    pub fn custom<F>(&mut self, field: &str, holds: F, message: &str) -> &mut Self
    where
        F: FnOnce() -> bool,
    {
        if !holds() {
            self.ctx.reject(field, message);
        }
        self
    }

    /// Everything recorded in the context so far, folded.
    pub fn result(&self) -> ValidationResult {
        ConfigError::from_problems(self.ctx.errors().to_vec()).map_or(Ok(()), Err)
    }
}

/// Reads `BALLAST_*` style overrides from the process environment.
///
/// A variable that is unset or does not parse leaves the target untouched.
///
/// ```
/// use ballast_core::config::validation::EnvOverride;
///
/// let mut max_allocation = 0.40_f64;
/// EnvOverride::apply_number("BALLAST_DOCTEST_UNSET_MAX", &mut max_allocation);
/// assert!((max_allocation - 0.40).abs() < f64::EPSILON);
/// ```
pub struct EnvOverride;

impl EnvOverride {
    fn read(var_name: &str) -> Option<String> {
        std::env::var(var_name).ok().map(|v| v.trim().to_string())
    }

    /// Overrides any `FromStr` value.
    pub fn apply_number<T: FromStr>(var_name: &str, target: &mut T) {
        if let Some(parsed) = Self::read(var_name).and_then(|v| v.parse().ok()) {
            *target = parsed;
        }
    }

    /// Like [`EnvOverride::apply_number`]; an empty value or `none` clears it.
    pub fn apply_optional_number<T: FromStr>(var_name: &str, target: &mut Option<T>) {
        match Self::read(var_name) {
            Some(v) if v.is_empty() || v.eq_ignore_ascii_case("none") => *target = None,
            Some(v) => {
                if let Ok(parsed) = v.parse() {
                    *target = Some(parsed);
                }
            }
            None => {}
        }
    }

    /// Overrides a duration given in whole milliseconds.
    pub fn apply_duration_ms(var_name: &str, target: &mut Duration) {
        if let Some(ms) = Self::read(var_name).and_then(|v| v.parse::<u64>().ok()) {
            *target = Duration::from_millis(ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_sections() {
        let mut ctx = ValidationContext::new();
        assert_eq!(ctx.current_path(), "");

        ctx.enter("regime");
        ctx.enter("correlation");
        assert_eq!(ctx.current_path(), "regime.correlation");

        ctx.exit();
        assert_eq!(ctx.current_path(), "regime");
    }

    #[test]
    fn test_validator_collects_all_errors() {
        let mut ctx = ValidationContext::new();
        ctx.enter("allocation");
        Validator::new(&mut ctx)
            .in_range("min_allocation", &-0.1, &0.0, &1.0)
            .positive("lookback", &0_usize)
            .finite("risk_free_rate", f64::NAN);
        assert_eq!(ctx.errors().len(), 3);
        assert!(
            ctx.errors()[0]
                .to_string()
                .contains("allocation.min_allocation")
        );
    }

    #[test]
    fn test_nan_is_never_in_range_or_positive() {
        let mut ctx = ValidationContext::new();
        let mut validator = Validator::new(&mut ctx);
        validator
            .in_range("z_threshold", &f64::NAN, &0.0, &10.0)
            .positive("half_life", &f64::NAN)
            .non_negative("risk_free_rate", &f64::NAN);
        assert!(validator.result().is_err());
        assert_eq!(ctx.errors().len(), 3);
    }

    #[test]
    fn test_missing_list_reports_section() {
        let mut ctx = ValidationContext::new();
        ctx.enter("cohorts[0]");
        let empty: Vec<String> = Vec::new();
        Validator::new(&mut ctx).require_any("members", &empty);
        assert_eq!(
            ctx.into_result(),
            Err(ConfigError::MissingField {
                field: "members".to_string(),
                section: Some("cohorts[0]".to_string()),
            })
        );
    }

    #[test]
    fn test_env_override_unset_keeps_value() {
        let mut value = 36_usize;
        EnvOverride::apply_number("BALLAST_TEST_UNSET_LOOKBACK_91873", &mut value);
        assert_eq!(value, 36);

        let mut limit = Some(-0.05_f64);
        EnvOverride::apply_optional_number("BALLAST_TEST_UNSET_LIMIT_91873", &mut limit);
        assert_eq!(limit, Some(-0.05));
    }
}
