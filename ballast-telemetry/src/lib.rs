//! Observability for Ballast.
//!
//! [`logging::init_logging`] installs the `tracing` subscriber,
//! [`metrics::init_metrics`] the Prometheus recorder. [`spans`] names the
//! span each engine operation runs in, and [`metrics::EngineMetrics`] is the
//! only place metric names are spelled out.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod logging;
pub mod metrics;
pub mod spans;
