//! Named spans for engine operations.
//!
//! Every public engine operation runs inside one of these so that log lines
//! emitted deep in the estimators carry the strategy key.

use tracing::{Span, info_span};

/// Span for one `compute_weights` invocation.
///
/// # Example
///
/// ```
/// use ballast_telemetry::spans::allocation_span;
///
/// let span = allocation_span("multi-strat", "risk_parity", "6f1c");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn allocation_span(strategy: &str, scheme: &str, run_id: &str) -> Span {
    info_span!(
        "allocation",
        strategy = %strategy,
        scheme = %scheme,
        run_id = %run_id
    )
}

/// Span for one `evaluate_risk` invocation.
#[must_use]
pub fn risk_span(strategy: &str, date: &str) -> Span {
    info_span!("risk_evaluation", strategy = %strategy, date = %date)
}

/// Span for rule evaluation against a snapshot.
#[must_use]
pub fn rules_span(strategy: &str) -> Span {
    info_span!("rule_check", strategy = %strategy)
}

/// Span for a circuit breaker transition.
#[must_use]
pub fn breaker_span(strategy: &str, transition: &str) -> Span {
    info_span!("breaker", strategy = %strategy, transition = %transition)
}

/// Span for a collaborator call (returns/macro fetch, persistence write).
#[must_use]
pub fn io_span(collaborator: &str, operation: &str) -> Span {
    info_span!("io", collaborator = %collaborator, operation = %operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spans_construct_without_subscriber() {
        let span = allocation_span("book", "max_sharpe", "run");
        let _guard = span.enter();
        let _risk = risk_span("carry", "2024-03-29");
        let _rules = rules_span("carry");
        let _breaker = breaker_span("carry", "trip");
        let _io = io_span("returns", "get_returns");
    }
}
