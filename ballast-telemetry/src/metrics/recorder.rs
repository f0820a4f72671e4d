//! Pre-defined engine metrics.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Engine metrics facade.
///
/// Names follow `ballast_<area>_<metric>_<unit>`. Without an installed
/// recorder every call is a no-op, so library code records unconditionally.
pub struct EngineMetrics;

impl EngineMetrics {
    /// Register metric descriptions with the installed recorder.
    pub fn register() {
        describe_counter!(
            "ballast_allocation_total",
            "Allocation runs by outcome (allocated, rejected)"
        );
        describe_histogram!(
            "ballast_allocation_latency_seconds",
            "Wall time of compute_weights including collaborator I/O"
        );
        describe_gauge!(
            "ballast_allocation_exposure",
            "Invested fraction after regime scaling"
        );
        describe_counter!(
            "ballast_stale_input_total",
            "Collaborator fetches that fell back to cached input"
        );
        describe_counter!(
            "ballast_breaker_trip_total",
            "Circuit breaker trips by cause"
        );
        describe_counter!(
            "ballast_breaker_spooled_total",
            "Breaker transitions written to the local spool"
        );
        describe_counter!("ballast_alert_total", "Risk alerts raised by metric");
        describe_counter!(
            "ballast_diagnostics_dropped_total",
            "Diagnostics records abandoned after retries"
        );
    }

    /// Record the outcome of a `compute_weights` call.
    pub fn allocation(strategy: &str, outcome: &str, elapsed: Duration) {
        counter!(
            "ballast_allocation_total",
            "strategy" => strategy.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
        histogram!(
            "ballast_allocation_latency_seconds",
            "strategy" => strategy.to_string()
        )
        .record(elapsed.as_secs_f64());
    }

    /// Record the exposure in force for a cohort.
    pub fn exposure(strategy: &str, exposure: f64) {
        gauge!("ballast_allocation_exposure", "strategy" => strategy.to_string()).set(exposure);
    }

    /// Record a fallback to cached collaborator input.
    pub fn stale_input(collaborator: &str) {
        counter!(
            "ballast_stale_input_total",
            "collaborator" => collaborator.to_string()
        )
        .increment(1);
    }

    /// Record a circuit breaker trip.
    pub fn breaker_trip(strategy: &str, cause: &str) {
        counter!(
            "ballast_breaker_trip_total",
            "strategy" => strategy.to_string(),
            "cause" => cause.to_string()
        )
        .increment(1);
    }

    /// Record a transition that went to the local spool.
    pub fn breaker_spooled() {
        counter!("ballast_breaker_spooled_total").increment(1);
    }

    /// Record a raised alert.
    pub fn alert(strategy: &str, metric: &str) {
        counter!(
            "ballast_alert_total",
            "strategy" => strategy.to_string(),
            "metric" => metric.to_string()
        )
        .increment(1);
    }

    /// Record a diagnostics record that could not be persisted.
    pub fn diagnostics_dropped() {
        counter!("ballast_diagnostics_dropped_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        EngineMetrics::allocation("book", "allocated", Duration::from_millis(3));
        EngineMetrics::exposure("book", 0.5);
        EngineMetrics::stale_input("returns");
        EngineMetrics::breaker_trip("carry", "drawdown");
        EngineMetrics::breaker_spooled();
        EngineMetrics::alert("carry", "var95");
        EngineMetrics::diagnostics_dropped();
    }
}
