use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Installs the global tracing subscriber. Logs go to stderr so command
/// output on stdout stays machine-readable.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_target(true)
            .boxed(),
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

/// Registers descriptions for every metric this crate emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "portal_query_fetch_total",
            Unit::Count,
            "Total number of backend fetches issued by the query cache."
        );
        describe_counter!(
            "portal_query_coalesced_total",
            Unit::Count,
            "Total number of subscriptions that joined an in-flight fetch."
        );
        describe_counter!(
            "portal_query_superseded_total",
            Unit::Count,
            "Total number of fetch results discarded because a newer fetch was issued."
        );
        describe_counter!(
            "portal_query_invalidated_total",
            Unit::Count,
            "Total number of cache entries marked stale by tag invalidation."
        );
        describe_counter!(
            "portal_query_evict_total",
            Unit::Count,
            "Total number of cache entries evicted after going unused."
        );
        describe_histogram!(
            "portal_query_fetch_ms",
            Unit::Milliseconds,
            "Backend fetch latency in milliseconds."
        );
        describe_counter!(
            "portal_mutation_total",
            Unit::Count,
            "Total number of mutations by outcome."
        );
        describe_counter!(
            "portal_channel_reconnect_total",
            Unit::Count,
            "Total number of scheduled push channel reconnects."
        );
        describe_counter!(
            "portal_channel_event_total",
            Unit::Count,
            "Total number of push events received by event name."
        );
    });
}
