//! Retry policy with backoff for best-effort writes.
//!
//! Used where a failed write must never block the caller: diagnostics
//! records and breaker spool flushes.
//!
//! ```
//! use ballast_risk::{BackoffStrategy, RetryConfig, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(RetryConfig {
//!     max_retries: 3,
//!     initial_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_secs(10),
//!     backoff: BackoffStrategy::Exponential { multiplier: 2.0 },
//!     jitter: false,
//! });
//!
//! assert_eq!(policy.delay_for(1), Duration::from_millis(100));
//! assert_eq!(policy.delay_for(3), Duration::from_millis(400));
//! ```

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// delay = initial + attempt * increment.
    Linear {
        /// Amount added per attempt.
        #[serde(with = "humantime_serde")]
        increment: Duration,
    },
    /// delay = initial * multiplier^(attempt - 1).
    Exponential {
        /// Growth factor per attempt.
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential { multiplier: 2.0 }
    }
}

/// Retry limits and backoff shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth between attempts.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Spread delays by up to -25% so concurrent writers do not retry in lockstep.
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    4
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff: BackoffStrategy::default(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Overrides `max_retries`.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Overrides `initial_delay`.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Overrides `jitter`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Computes retry delays and drives retried async operations.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy from its configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Limits in use.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether `attempt` retries leave room for one more.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.config.max_retries
    }

    /// Delay before retry number `attempt` (1-indexed). Zero for attempt 0.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let initial_ms = self.config.initial_delay.as_millis() as f64;
        let base_ms = match self.config.backoff {
            BackoffStrategy::Fixed => initial_ms,
            BackoffStrategy::Linear { increment } => {
                initial_ms + f64::from(attempt - 1) * increment.as_millis() as f64
            }
            BackoffStrategy::Exponential { multiplier } => {
                initial_ms * multiplier.powi(attempt as i32 - 1)
            }
        };
        let capped_ms = base_ms.min(self.config.max_delay.as_millis() as f64);
        let final_ms = if self.config.jitter {
            capped_ms * (1.0 - 0.25 * spread(attempt))
        } else {
            capped_ms
        };
        Duration::from_millis(final_ms.max(0.0) as u64)
    }

    /// Runs `op` until it succeeds, `retryable` rejects the error, or the
    /// retries are exhausted. Returns the last error in the latter cases.
    pub async fn run<T, E, F, Fut, R>(&self, operation: &str, mut op: F, retryable: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if retryable(&err) && self.should_retry(attempt) => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(operation, attempts = attempt + 1, error = %err, "giving up");
                    return Err(err);
                }
            }
        }
    }
}

/// Deterministic spread in [0, 1) derived from the attempt number.
fn spread(attempt: u32) -> f64 {
    let mixed = u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 40;
    (mixed % 1000) as f64 / 1000.0
}
