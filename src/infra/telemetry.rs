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

/// Registers descriptions for every metric the engine emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "coherence_cache_hit_total",
            Unit::Count,
            "Reads answered from the in-memory cache."
        );
        describe_counter!(
            "coherence_cache_miss_total",
            Unit::Count,
            "Reads that found no in-memory entry."
        );
        describe_counter!(
            "coherence_cache_evict_total",
            Unit::Count,
            "Entries evicted by the sweep after their eviction window."
        );
        describe_gauge!(
            "coherence_cache_entries",
            Unit::Count,
            "Current number of in-memory cache entries."
        );
        describe_counter!(
            "coherence_refetch_total",
            Unit::Count,
            "Remote fetches started, including background refetches."
        );
        describe_counter!(
            "coherence_refetch_discarded_total",
            Unit::Count,
            "Fetch results dropped because a newer fetch superseded them."
        );
        describe_counter!(
            "coherence_mutation_rollback_total",
            Unit::Count,
            "Optimistic mutations rolled back after a remote failure."
        );
        describe_counter!(
            "coherence_notification_dropped_total",
            Unit::Count,
            "Change notifications dropped because the queue was full or closed."
        );
        describe_counter!(
            "coherence_store_error_total",
            Unit::Count,
            "Durable store operations that failed."
        );
        describe_histogram!(
            "coherence_invalidation_consume_ms",
            Unit::Milliseconds,
            "Invalidation batch consumption latency in milliseconds."
        );
    });
}
