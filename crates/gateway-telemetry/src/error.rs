//! Telemetry errors.

use thiserror::Error;

/// Telemetry setup and export errors
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A Prometheus collector could not be created or registered
    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Exposition output was not UTF-8
    #[error("Metrics encoding failed: {0}")]
    Encoding(String),

    /// The global subscriber could not be installed
    #[error("Failed to initialize tracing: {0}")]
    Init(String),

    /// Invalid log filter directive
    #[error("Invalid log filter '{directive}': {reason}")]
    Filter {
        /// Offending directive
        directive: String,
        /// Parser message
        reason: String,
    },
}
