//! Strategy identifier.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a strategy or of an allocation cohort.
///
/// Ordered so that weight vectors keyed by it iterate deterministically.
///
/// # Examples
///
/// ```
/// use ballast_core::types::StrategyId;
///
/// let id = StrategyId::new("trend-following");
/// assert_eq!(id.as_str(), "trend-following");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyId(String);

impl StrategyId {
    /// Creates a new `StrategyId`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StrategyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StrategyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StrategyId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
