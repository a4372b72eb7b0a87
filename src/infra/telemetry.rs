use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_histogram!(
            "courier_bucket_wait_ms",
            Unit::Milliseconds,
            "Time spent waiting for a rate-limit bucket slot."
        );
        describe_gauge!(
            "courier_bucket_len",
            Unit::Count,
            "Per-route buckets currently tracked."
        );
        describe_counter!(
            "courier_retry_attempt_total",
            Unit::Count,
            "Outbound attempts by outcome."
        );
        describe_counter!(
            "courier_delivery_total",
            Unit::Count,
            "Queued deliveries by final result."
        );
        describe_gauge!(
            "courier_delivery_queue_len",
            Unit::Count,
            "Deliveries waiting in the queue."
        );
        describe_gauge!(
            "courier_token_store_len",
            Unit::Count,
            "Live capability tokens."
        );
        describe_gauge!(
            "courier_idempotency_len",
            Unit::Count,
            "Idempotency records retained."
        );
        describe_counter!(
            "courier_cache_request_hit_total",
            Unit::Count,
            "Request-scoped cache hits."
        );
        describe_counter!(
            "courier_cache_request_miss_total",
            Unit::Count,
            "Request-scoped cache misses."
        );
        describe_counter!(
            "courier_view_resync_total",
            Unit::Count,
            "Materialized view resyncs by result."
        );
    });
}
