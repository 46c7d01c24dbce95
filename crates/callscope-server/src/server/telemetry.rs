//! # Telemetry Features
//!
//! Structured logging through `tracing-subscriber` is always on. Every call
//! runs inside an `rpc` span carrying its method and transaction id, and
//! handler events additionally carry the transaction id published in the
//! thread's `LogContext` at half-close.
//!
//! OpenTelemetry export is optional.
//!
//! ## Feature matrix
//!
//! - `otel`: Exports spans through OpenTelemetry.
//! - `metrics`: Enables OpenTelemetry metrics (counters, histograms, etc.).
//! - `honeycomb`: Enables the Honeycomb OTLP exporter.
//! - `stdout`: Enables the stdout OTLP exporter.
//!
//! ## Feature constraints
//!
//! - Exporters require using at least one of: `otel` or `metrics`.
//! - Both `honeycomb` and `stdout` exporters can be enabled at the same time.
//!
//! ## Metrics
//!
//! - `calls` - calls started, by shape
//! - `calls_inflight` - calls currently holding a permit
//! - `responses_sent` - response messages handed to the transport
//! - `stream_errors` - calls that ended with an error status
//! - `call_duration` - end-to-end call duration (ms)
//! - `context_attached` / `context_restored` - half-close context
//!   activations and their restorations; the two must stay equal
//!
//! ## Example usage
//!
//! ```bash
//! cargo run --features otel,metrics,honeycomb
//! cargo run --features otel,stdout
//! ```

// Disallow using `honeycomb` without `otel` or `metrics`
#[cfg(all(feature = "honeycomb", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'honeycomb' feature requires at least one of 'otel' or 'metrics' to be enabled.");

// Disallow using `stdout` without `otel` or `metrics`
#[cfg(all(feature = "stdout", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'otel' or 'metrics' to be enabled.");

use callscope_core::types::StreamShape;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "otel")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "honeycomb", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(feature = "honeycomb")]
use tonic::metadata::MetadataMap;
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "otel")))]
use tonic::transport::ClientTlsConfig;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "callscope";

pub struct TelemetryProviders {
    #[cfg(feature = "otel")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every exporter. Errors are reported on stderr
    /// since the subscriber may already be torn down.
    pub fn shutdown(&self) {
        #[cfg(feature = "otel")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otel")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otel")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "otel"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Console output is independent of the `opentelemetry_stdout` exporter.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "otel")]
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

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "otel")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "honeycomb")]
struct HoneycombSettings {
    metadata: MetadataMap,
    endpoint: String,
    compression: Compression,
}

#[cfg(feature = "honeycomb")]
fn honeycomb_settings() -> anyhow::Result<HoneycombSettings> {
    use anyhow::Context;
    use std::str::FromStr;

    let mut metadata = MetadataMap::new();
    let api_key = std::env::var("HONEYCOMB_API_KEY").context("missing `HONEYCOMB_API_KEY`")?;
    let dataset = std::env::var("HONEYCOMB_DATASET").context("missing `HONEYCOMB_DATASET`")?;
    metadata.insert(
        "x-honeycomb-team",
        api_key.parse().context("invalid API key")?,
    );
    metadata.insert(
        "x-honeycomb-dataset",
        dataset.parse().context("invalid dataset")?,
    );

    let endpoint = std::env::var("HONEYCOMB_ENDPOINT").context("missing `HONEYCOMB_ENDPOINT`")?;
    let raw = std::env::var("HONEYCOMB_COMPRESSION")
        .context("missing `HONEYCOMB_COMPRESSION`")?
        .to_ascii_lowercase();
    let compression = Compression::from_str(&raw)?;

    Ok(HoneycombSettings {
        metadata,
        endpoint,
        compression,
    })
}

#[cfg(any(feature = "metrics", feature = "otel"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
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
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let settings = honeycomb_settings()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(settings.compression)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "otel")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let exporter = SpanExporter::default();
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let settings = honeycomb_settings()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(settings.compression)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;

        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();

        builder.with_span_processor(batch)
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
static CALLS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CALLS_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RESPONSES_SENT: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static STREAM_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CALL_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CONTEXT_ATTACHED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CONTEXT_RESTORED: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = CALLS.set(
        meter
            .u64_counter("calls")
            .with_description("Total gRPC calls started")
            .build(),
    );

    let _ = CALLS_INFLIGHT.set(
        meter
            .i64_up_down_counter("calls_inflight")
            .with_description("Concurrent gRPC calls")
            .build(),
    );

    let _ = RESPONSES_SENT.set(
        meter
            .u64_counter("responses_sent")
            .with_description("Response messages handed to the transport")
            .build(),
    );

    let _ = STREAM_ERRORS.set(
        meter
            .u64_counter("stream_errors")
            .with_description("Calls that ended with an error status")
            .build(),
    );

    let _ = CALL_DURATION_MS.set(
        meter
            .f64_histogram("call_duration")
            .with_unit("ms")
            .with_description("End-to-end call duration")
            .build(),
    );

    let _ = CONTEXT_ATTACHED.set(
        meter
            .u64_counter("context_attached")
            .with_description("Call contexts activated at half-close")
            .build(),
    );

    let _ = CONTEXT_RESTORED.set(
        meter
            .u64_counter("context_restored")
            .with_description("Call contexts restored after half-close")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_calls(shape: StreamShape) {
    if let Some(counter) = CALLS.get() {
        counter.add(1, &[KeyValue::new("shape", shape.as_str())]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_calls(_shape: StreamShape) {}

#[cfg(feature = "metrics")]
pub fn increment_calls_inflight() {
    if let Some(counter) = CALLS_INFLIGHT.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_calls_inflight() {}

#[cfg(feature = "metrics")]
pub fn decrement_calls_inflight() {
    if let Some(counter) = CALLS_INFLIGHT.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_calls_inflight() {}

#[cfg(feature = "metrics")]
pub fn increment_responses_sent(count: u64) {
    if let Some(counter) = RESPONSES_SENT.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_responses_sent(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_stream_errors() {
    if let Some(counter) = STREAM_ERRORS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_stream_errors() {}

#[cfg(feature = "metrics")]
pub fn record_call_duration(duration_ms: f64) {
    if let Some(histogram) = CALL_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_call_duration(_duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn increment_context_attached() {
    if let Some(counter) = CONTEXT_ATTACHED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_context_attached() {}

#[cfg(feature = "metrics")]
pub fn increment_context_restored() {
    if let Some(counter) = CONTEXT_RESTORED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_context_restored() {}
