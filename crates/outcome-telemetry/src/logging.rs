//! Structured logging setup.
//!
//! Development builds get a compact, colored `fmt` layer. Containers get one
//! JSON object per line so a log shipper can index the structured fields the
//! protocol attaches (`transaction_id`, `endpoint`, `action`, `attempt`).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{TelemetryConfig, TelemetryError};

/// Marker returned once the global subscriber is installed.
#[derive(Debug)]
pub struct StructuredLogger {
    json: bool,
}

impl StructuredLogger {
    /// Whether log lines are JSON encoded.
    pub fn is_json(&self) -> bool {
        self.json
    }
}

/// Build the `EnvFilter` for a configuration.
///
/// `RUST_LOG` wins when set so operators can override a deployed level.
pub fn build_filter(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Config(e.to_string()))
}

/// Install the global tracing subscriber.
///
/// Fails with [`TelemetryError::LoggingInit`] if a subscriber is already set.
pub fn init_logging(config: &TelemetryConfig) -> Result<StructuredLogger, TelemetryError> {
    let env_filter = build_filter(config)?;

    if config.json_logs {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        if config.console_output {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init()
                .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .try_init()
                .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
        }
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(true);

        if config.console_output {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .try_init()
                .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
        }
    }

    tracing::info!(
        service = %config.service_name,
        json_logs = config.json_logs,
        "Structured logging initialized"
    );

    Ok(StructuredLogger {
        json: config.json_logs,
    })
}

/// Log an outcome-related event with the standard fields.
#[macro_export]
macro_rules! log_outcome_event {
    ($level:ident, $msg:expr, $transaction_id:expr, $action:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            transaction_id = %$transaction_id,
            action = %$action,
            $($($field)*,)?
            $msg
        )
    };
}
