//! # Outcome Telemetry
//!
//! Logging and metrics for services taking part in the transaction outcome
//! protocol.
//!
//! ## Components
//!
//! - **Logs**: `tracing` + `tracing-subscriber`, pretty or JSON
//! - **Metrics**: Prometheus collectors for publish, binding and delivery traffic
//!
//! ## Usage
//!
//! ```rust,ignore
//! use outcome_telemetry::{init_telemetry, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TelemetryConfig::from_env();
//!     let _guard = init_telemetry(config).expect("Failed to init telemetry");
//!
//!     // Logs and metrics are now being collected
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_SERVICE_NAME` | `txn-outcome` | Service name in logs |
//! | `TXN_LOG_LEVEL` | `info` | Log level filter |
//! | `TXN_JSON_LOGS` | `false` | JSON log lines |
//! | `TXN_CONSOLE_OUTPUT` | `true` | Write logs to stdout |

#![warn(missing_docs)]

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{build_filter, init_logging, StructuredLogger};
pub use metrics::{
    encode_metrics, register_metrics, MetricsHandle, BINDING_CHANGES, DELIVERIES,
    HANDLER_DURATION, HANDLER_FAILURES, LISTENERS_ACTIVE, OUTCOMES_PUBLISHED, PUBLISH_FAILURES,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// A global subscriber was already installed.
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    /// A collector could not be registered.
    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    /// The registry could not be rendered as text.
    #[error("Failed to encode Prometheus metrics: {0}")]
    MetricsEncode(String),

    /// The log filter directive did not parse.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and metrics.
///
/// Returns a guard that should be held for the lifetime of the application.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    // Metrics first so early log lines can already be counted against them
    let metrics_handle = register_metrics()?;
    let logger = init_logging(&config)?;

    Ok(TelemetryGuard {
        _logger: logger,
        _metrics: metrics_handle,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    _logger: StructuredLogger,
    _metrics: MetricsHandle,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}
