use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_CACHE_HIT_TOTAL, METRIC_CACHE_MISS_TOTAL, METRIC_CACHE_STALE_TOTAL, METRIC_COMPILE_MS,
    METRIC_FLIGHT_IN_FLIGHT, METRIC_FLIGHT_JOINED_TOTAL, METRIC_FLIGHT_REJECTED_TOTAL,
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

/// Register descriptions for every metric the cache layer emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT_TOTAL,
            Unit::Count,
            "Lookups answered by a fresh cached artifact."
        );
        describe_counter!(
            METRIC_CACHE_MISS_TOTAL,
            Unit::Count,
            "Lookups that required a compilation."
        );
        describe_counter!(
            METRIC_CACHE_STALE_TOTAL,
            Unit::Count,
            "Cached artifacts dropped because a dependency changed."
        );
        describe_histogram!(
            METRIC_COMPILE_MS,
            Unit::Milliseconds,
            "Artifact compilation latency in milliseconds."
        );
        describe_counter!(
            METRIC_FLIGHT_JOINED_TOTAL,
            Unit::Count,
            "Requests that joined an in-flight compilation."
        );
        describe_counter!(
            METRIC_FLIGHT_REJECTED_TOTAL,
            Unit::Count,
            "Compilations rejected because the executor was saturated."
        );
        describe_gauge!(
            METRIC_FLIGHT_IN_FLIGHT,
            Unit::Count,
            "Compilations currently admitted."
        );
    });
}
