//! Metrics collection and Prometheus export.

mod config;
mod recorder;

pub use config::MetricsConfig;
pub use recorder::EngineMetrics;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder and describes every engine metric.
/// A disabled config leaves the no-op recorder in place. With `listen` set
/// the scrape endpoint is spawned onto the current Tokio runtime.
///
/// # Example
///
/// ```no_run
/// use ballast_telemetry::metrics::{init_metrics, MetricsConfig};
///
/// init_metrics(&MetricsConfig::default()).expect("metrics");
/// ```
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_seconds".to_string()),
            &config.latency_buckets,
        )
        .map_err(|e| MetricsError::InitializationFailed(e.to_string()))?;

    let handle = match &config.listen {
        Some(listen) => {
            let addr: SocketAddr = listen
                .parse()
                .map_err(|e| MetricsError::InvalidAddress(format!("{listen}: {e}")))?;
            let (recorder, exporter) = builder
                .with_http_listener(addr)
                .build()
                .map_err(|e| MetricsError::InitializationFailed(e.to_string()))?;
            let handle = recorder.handle();
            ::metrics::set_global_recorder(recorder)
                .map_err(|_| MetricsError::AlreadyInitialized)?;
            tokio::spawn(exporter);
            handle
        }
        None => builder
            .install_recorder()
            .map_err(|e| MetricsError::InitializationFailed(e.to_string()))?,
    };

    METRICS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    EngineMetrics::register();
    Ok(())
}

/// The current metrics in Prometheus text format, or `None` before
/// [`init_metrics`] has installed a recorder.
#[must_use]
pub fn snapshot() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

/// Why the recorder could not be installed.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// `init_metrics` ran twice
    #[error("metrics recorder already installed")]
    AlreadyInitialized,

    /// `listen` is not a socket address
    #[error("bad metrics listen address {0}")]
    InvalidAddress(String),

    /// The exporter refused the settings
    #[error("cannot install metrics recorder: {0}")]
    InitializationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_is_noop() {
        let config = MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        };
        assert!(init_metrics(&config).is_ok());
        assert!(snapshot().is_none());
    }

    #[test]
    fn test_invalid_address() {
        let config = MetricsConfig {
            listen: Some("not-an-address".to_string()),
            ..MetricsConfig::default()
        };
        assert!(matches!(
            init_metrics(&config),
            Err(MetricsError::InvalidAddress(_))
        ));
    }
}
