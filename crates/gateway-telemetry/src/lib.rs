//! # Gateway Telemetry
//!
//! Observability for the API gateway.
//!
//! This crate provides:
//! - Prometheus metrics behind the [`MetricsSink`] seam
//! - Structured logging (pretty or JSON)
//! - Optional OpenTelemetry span export

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod logging;
pub mod metrics;
pub mod tracing_setup;

// Re-export main types
pub use error::TelemetryError;
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
pub use tracing_setup::{init_tracing, shutdown_tracing, TracingConfig};
