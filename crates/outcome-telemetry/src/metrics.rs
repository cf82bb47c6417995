//! Prometheus metrics for transaction outcome traffic.
//!
//! All metrics follow the naming convention: `txn_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., outcomes_published_total)
//! - **Gauge**: Value that can go up or down (e.g., listeners_active)
//! - **Histogram**: Distribution of values (e.g., handler_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Gauge, Histogram, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Registry holding every collector below
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // PUBLISHER
    // =========================================================================

    /// Outcomes handed to the broker
    pub static ref OUTCOMES_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("txn_outcomes_published_total", "Outcome messages accepted by the broker"),
        &["action"]  // action: commit/rollback
    ).expect("metric creation failed");

    /// Publishes that never reached the broker
    pub static ref PUBLISH_FAILURES: Counter = Counter::new(
        "txn_publish_failures_total",
        "Outcome publishes that failed before the broker accepted them"
    ).expect("metric creation failed");

    // =========================================================================
    // SUBSCRIPTIONS
    // =========================================================================

    /// Binding changes
    pub static ref BINDING_CHANGES: CounterVec = CounterVec::new(
        Opts::new("txn_binding_changes_total", "Bind and unbind operations applied"),
        &["operation"]  // operation: bind/unbind
    ).expect("metric creation failed");

    /// Listeners currently consuming in this process
    pub static ref LISTENERS_ACTIVE: Gauge = Gauge::new(
        "txn_listeners_active",
        "Listener endpoints currently being consumed"
    ).expect("metric creation failed");

    // =========================================================================
    // DELIVERY
    // =========================================================================

    /// Deliveries by final disposition
    pub static ref DELIVERIES: CounterVec = CounterVec::new(
        Opts::new("txn_deliveries_total", "Outcome deliveries by disposition"),
        &["endpoint", "disposition"]  // disposition: acked/requeued/discarded/consumed/lost
    ).expect("metric creation failed");

    /// Handler failures (each one triggers a redelivery under explicit ack)
    pub static ref HANDLER_FAILURES: CounterVec = CounterVec::new(
        Opts::new("txn_handler_failures_total", "Listener handler failures"),
        &["endpoint"]
    ).expect("metric creation failed");

    /// Handler duration
    pub static ref HANDLER_DURATION: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "txn_handler_duration_seconds",
            "Time spent inside listener handlers"
        ).buckets(exponential_buckets(0.0001, 2.0, 16).unwrap())
    ).expect("metric creation failed");
}

/// Handle for the registered metrics
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the crate registry.
///
/// Calling this more than once is fine; collectors that are already
/// registered are skipped.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Publisher
        Box::new(OUTCOMES_PUBLISHED.clone()),
        Box::new(PUBLISH_FAILURES.clone()),
        // Subscriptions
        Box::new(BINDING_CHANGES.clone()),
        Box::new(LISTENERS_ACTIVE.clone()),
        // Delivery
        Box::new(DELIVERIES.clone()),
        Box::new(HANDLER_FAILURES.clone()),
        Box::new(HANDLER_DURATION.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Render every collector in the crate registry as Prometheus text.
///
/// # Errors
///
/// Returns [`TelemetryError::MetricsEncode`] if a family fails to encode.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    TextEncoder::new()
        .encode_to_string(&REGISTRY.gather())
        .map_err(|e| TelemetryError::MetricsEncode(e.to_string()))
}
