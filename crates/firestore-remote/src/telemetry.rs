//! # Telemetry Features
//!
//! Logging always goes through `tracing` and is printed by a
//! `tracing_subscriber::fmt` layer. OpenTelemetry export is optional and
//! selected with Cargo features.
//!
//! ## Feature matrix
//!
//! - `otel-tracing`: Enables OpenTelemetry distributed tracing (via spans).
//! - `metrics`: Enables OpenTelemetry metrics (via counters, histograms, etc.).
//! - `otlp`: Exports over OTLP/gRPC. The collector is configured with the
//!   standard `OTEL_EXPORTER_OTLP_*` environment variables.
//! - `stdout`: Prints exported spans and metrics to stdout.
//!
//! Exporters require at least one of `otel-tracing` or `metrics`. Both
//! exporters can be enabled at the same time.
//!
//! ## Metrics behavior
//!
//! - RPC counts, errors and durations are labelled with the RPC name.
//! - Stream metrics track open write streams, restarts and acknowledged
//!   batches.
//! - Every recording function compiles to a no-op without `metrics`.
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 \
//!     cargo run --features otel-tracing,metrics,otlp -- lookup rooms/eros
//! ```

#[cfg(all(
    any(feature = "otlp", feature = "stdout"),
    not(any(feature = "otel-tracing", feature = "metrics"))
))]
compile_error!(
    "The 'otlp' and 'stdout' exporters require at least one of 'otel-tracing' or 'metrics' to be enabled."
);

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "otel-tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel-tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel-tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "otel-tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel-tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otel-tracing")]
use opentelemetry_sdk::trace as sdktrace;

#[cfg(any(feature = "metrics", feature = "otel-tracing"))]
const EXPORT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

pub struct TelemetryProviders {
    #[cfg(feature = "otel-tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otel-tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otel-tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "otel-tracing"))]
    let scope = InstrumentationScope::builder("firestore-remote")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Always subscribe to standard tracing logs printed to the console via
    // `tracing_subscriber::fmt`. This is unrelated to the `opentelemetry_stdout`
    // exporter - it logs spans/events as human-readable output.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "otel-tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "otel-tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

/// Flushes and shuts down every exporter. Errors are printed, not returned:
/// the subscriber may already be gone when this runs.
pub fn shutdown_telemetry(_providers: TelemetryProviders) {
    #[cfg(feature = "otel-tracing")]
    {
        if let Err(err) = _providers.tracer_provider.force_flush() {
            eprintln!("Error flushing traces: {:#?}", err);
        }
        if let Err(err) = _providers.tracer_provider.shutdown() {
            eprintln!("Error shutting down tracer: {:#?}", err);
        }
    }

    #[cfg(feature = "metrics")]
    {
        if let Err(err) = _providers.meter_provider.force_flush() {
            eprintln!("Error flushing metrics: {:#?}", err);
        }
        if let Err(err) = _providers.meter_provider.shutdown() {
            eprintln!("Error shutting down meter: {:#?}", err);
        }
    }
}

#[cfg(any(feature = "metrics", feature = "otel-tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("firestore-remote")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let reader = sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(EXPORT_INTERVAL)
            .build();
        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .build()
            .context("failed to build metrics exporter")?;
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(EXPORT_INTERVAL)
            .build();
        builder.with_reader(reader)
    };

    Ok(builder.build())
}

#[cfg(feature = "otel-tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(batch(opentelemetry_stdout::SpanExporter::default()));

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .build()
            .context("failed to build tracer exporter")?;
        builder.with_span_processor(batch(exporter))
    };

    Ok(builder.build())
}

#[cfg(all(feature = "otel-tracing", any(feature = "stdout", feature = "otlp")))]
fn batch<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: opentelemetry_sdk::trace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(EXPORT_INTERVAL)
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

// Metric handles - only compiled when metrics feature is enabled
#[cfg(feature = "metrics")]
static RPCS_STARTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RPC_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RPC_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static STREAMS_OPEN: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static STREAM_RESTARTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static WRITE_ACKS: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = RPCS_STARTED.set(
        meter
            .u64_counter("rpcs_started")
            .with_description("Unary and streaming calls issued")
            .build(),
    );

    let _ = RPC_ERRORS.set(
        meter
            .u64_counter("rpc_errors")
            .with_description("Calls that finished with a non-ok status")
            .build(),
    );

    let _ = RPC_DURATION_MS.set(
        meter
            .f64_histogram("rpc_duration")
            .with_unit("ms")
            .with_description("Unary call duration, token fetch included")
            .build(),
    );

    let _ = STREAMS_OPEN.set(
        meter
            .i64_up_down_counter("streams_open")
            .with_description("Streams currently open")
            .build(),
    );

    let _ = STREAM_RESTARTS.set(
        meter
            .u64_counter("stream_restarts")
            .with_description("Stream restarts after a backoff")
            .build(),
    );

    let _ = WRITE_ACKS.set(
        meter
            .u64_counter("write_acks")
            .with_description("Mutation batches acknowledged on the write stream")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_rpcs_started(rpc: &'static str) {
    if let Some(counter) = RPCS_STARTED.get() {
        counter.add(1, &[KeyValue::new("rpc", rpc)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_rpcs_started(_rpc: &'static str) {}

#[cfg(feature = "metrics")]
pub fn increment_rpc_errors(rpc: &'static str) {
    if let Some(counter) = RPC_ERRORS.get() {
        counter.add(1, &[KeyValue::new("rpc", rpc)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_rpc_errors(_rpc: &'static str) {}

#[cfg(feature = "metrics")]
pub fn record_rpc_duration(rpc: &'static str, duration_ms: f64) {
    if let Some(histogram) = RPC_DURATION_MS.get() {
        histogram.record(duration_ms, &[KeyValue::new("rpc", rpc)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_rpc_duration(_rpc: &'static str, _duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn increment_streams_open() {
    if let Some(counter) = STREAMS_OPEN.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_streams_open() {}

#[cfg(feature = "metrics")]
pub fn decrement_streams_open() {
    if let Some(counter) = STREAMS_OPEN.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_streams_open() {}

#[cfg(feature = "metrics")]
pub fn increment_stream_restarts() {
    if let Some(counter) = STREAM_RESTARTS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_stream_restarts() {}

#[cfg(feature = "metrics")]
pub fn increment_write_acks() {
    if let Some(counter) = WRITE_ACKS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_write_acks() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_before_init_is_a_no_op() {
        increment_rpcs_started("Commit");
        increment_rpc_errors("Commit");
        record_rpc_duration("Commit", 1.5);
        increment_streams_open();
        decrement_streams_open();
        increment_stream_restarts();
        increment_write_acks();
    }

    #[cfg(any(feature = "metrics", feature = "otel-tracing"))]
    #[test]
    fn resource_names_the_service() {
        let resource = resource();
        assert!(resource.iter().any(|(key, value)| {
            key.as_str() == semvcns::resource::SERVICE_NAME && value.as_str() == "firestore-remote"
        }));
    }
}
