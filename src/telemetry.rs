use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
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
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Subscriber(err.to_string()))
}

/// Register descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tidecache_read_hit_total",
            Unit::Count,
            "Total number of reads served from fresh cache entries."
        );
        describe_counter!(
            "tidecache_read_miss_total",
            Unit::Count,
            "Total number of reads that found no fresh entry."
        );
        describe_counter!(
            "tidecache_read_dedup_total",
            Unit::Count,
            "Total number of reads that joined an in-flight request."
        );
        describe_counter!(
            "tidecache_fetch_retry_total",
            Unit::Count,
            "Total number of retried fetch attempts."
        );
        describe_histogram!(
            "tidecache_fetch_ms",
            Unit::Milliseconds,
            "Fetch latency including retries in milliseconds."
        );
        describe_gauge!(
            "tidecache_inflight",
            Unit::Count,
            "Current number of in-flight fetch requests."
        );
        describe_counter!(
            "tidecache_evict_total",
            Unit::Count,
            "Total number of entries removed by garbage collection."
        );
        describe_counter!(
            "tidecache_mutation_rollback_total",
            Unit::Count,
            "Total number of optimistic patches rolled back."
        );
        describe_counter!(
            "tidecache_rollback_skipped_total",
            Unit::Count,
            "Total number of rollbacks skipped because a newer write landed."
        );
        describe_gauge!(
            "tidecache_event_queue_len",
            Unit::Count,
            "Current number of undrained mutation events."
        );
        describe_counter!(
            "tidecache_event_dropped_total",
            Unit::Count,
            "Total number of mutation events dropped due to queue overflow."
        );
    });
}
