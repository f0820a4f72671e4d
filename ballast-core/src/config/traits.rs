//! Configuration traits for validation and environment overrides.

use super::validation::ValidationContext;
use crate::error::ConfigError;

/// Trait for types that can be validated.
///
/// Implementors usually only provide [`Validatable::validate_with_context`]
/// so that nested sections report dotted paths (`allocation.max_allocation`).
pub trait Validatable {
    /// Validates the configuration, folding every failure into one error.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut ctx = ValidationContext::new();
        self.validate_with_context(&mut ctx);
        ctx.into_result()
    }

    /// Records every validation error into `ctx`.
    fn validate_with_context(&self, ctx: &mut ValidationContext);
}

/// Trait for types that support environment variable overrides.
///
/// # Example
///
/// ```rust,ignore
/// impl Configurable for IoConfig {
///     fn apply_env_overrides(&mut self, prefix: &str) {
///         EnvOverride::apply_duration_ms(&format!("{prefix}_IO_FETCH_TIMEOUT_MS"), &mut self.fetch_timeout);
///     }
///
///     fn env_var_names(prefix: &str) -> Vec<String> {
///         vec![format!("{prefix}_IO_FETCH_TIMEOUT_MS")]
///     }
/// }
/// ```
pub trait Configurable: Sized {
    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self, prefix: &str);

    /// Returns the environment variable names that can override this configuration.
    fn env_var_names(prefix: &str) -> Vec<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::validation::Validator;

    struct WindowConfig {
        lookback: usize,
        min_periods: usize,
    }

    impl Validatable for WindowConfig {
        fn validate_with_context(&self, ctx: &mut ValidationContext) {
            ctx.enter("window");
            Validator::new(ctx)
                .positive("lookback", &self.lookback)
                .custom(
                    "min_periods",
                    || self.min_periods <= self.lookback,
                    "must not exceed lookback",
                );
            ctx.exit();
        }
    }

    #[test]
    fn test_validatable_success() {
        let config = WindowConfig {
            lookback: 36,
            min_periods: 4,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validatable_failure_carries_path() {
        let config = WindowConfig {
            lookback: 3,
            min_periods: 4,
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("window.min_periods"));
    }
}
