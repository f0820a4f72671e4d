//! Configuration management module.
//!
//! Provides the loading and validation framework shared by every Ballast crate:
//! - YAML, TOML and JSON configuration files
//! - Path-aware validation with descriptive error messages
//! - Environment variable overrides (`BALLAST_*`)
//!
//! Domain sections (allocation, regime, breaker, ...) live next to the code that
//! consumes them and implement [`Validatable`] and [`Configurable`].

mod loader;
mod traits;
pub mod validation;

pub use loader::{ConfigFormat, ConfigLoader};
pub use traits::{Configurable, Validatable};
pub use validation::{EnvOverride, ValidationContext, ValidationResult, Validator};
