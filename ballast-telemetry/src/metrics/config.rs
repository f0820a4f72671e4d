//! Metrics settings.

use serde::{Deserialize, Serialize};

/// Whether and where engine metrics are exported.
///
/// ```yaml
/// metrics:
///   listen: 127.0.0.1:9464
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Install a recorder at all. When off, every `EngineMetrics` call is free.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,

    /// Serve `/metrics` on this address. Without it the recorder still runs
    /// but nothing scrapes it.
    #[serde(default)]
    pub listen: Option<String>,

    /// Bucket bounds, in seconds, for every `*_seconds` histogram.
    #[serde(default = "latency_buckets")]
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: None,
            latency_buckets: latency_buckets(),
        }
    }
}

fn enabled_by_default() -> bool {
    true
}

// An allocation is a handful of small factorizations plus collaborator round trips.
fn latency_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
}
