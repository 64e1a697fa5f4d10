//! # Telemetry
//!
//! Logging is always on: a `tracing_subscriber` registry with an `EnvFilter`
//! (from `RUST_LOG`, else `LOG_LEVEL`) and a `fmt` layer printing pretty text
//! or JSON lines.
//!
//! Tracing and metrics are switched on at runtime (`TRACING_ENABLED`,
//! `METRICS_ENABLED`) and exported through OpenTelemetry. Exporters are picked
//! at compile time:
//!
//! - `otlp`: OTLP over gRPC to `OTLP_ENDPOINT` (or the exporter's default).
//! - `stdout`: human-readable dump to stdout, useful locally.
//!
//! With neither feature the providers are still installed, so spans and
//! metric handles work, but nothing leaves the process.
//!
//! ## Span behavior
//!
//! - Every call runs inside a `grpc.call` span opened by the context-tag stage.
//! - A W3C `traceparent` on the inbound metadata becomes the span's parent.
//! - Root traces are sampled at `TRACING_SAMPLE_RATE`; children follow their
//!   parent's decision.
//!
//! ## Metrics
//!
//! - `grpc.server.concurrent_requests`: calls in flight, by method.
//! - `grpc.server.requests`: completed calls, by method and status code.
//! - `grpc.server.duration`: call latency in milliseconds, by method.
//!
//! The `record_*` helpers are no-ops until metrics are initialized.

use crate::server::{config::TelemetryConfig, error::Result};
use opentelemetry::{
    InstrumentationScope, KeyValue,
    metrics::{Counter, Gauge, Histogram, Meter},
    trace::TracerProvider,
};
use opentelemetry_sdk::{
    Resource, metrics as sdkmetrics, propagation::TraceContextPropagator, trace as sdktrace,
};
use opentelemetry_semantic_conventions as semvcns;
use std::{sync::OnceLock, time::Duration};
use tonic::Code;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "otlp")]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};

const SCOPE: &str = "rpckit";

/// Providers that must be flushed before the process exits.
#[derive(Default)]
pub struct TelemetryProviders {
    tracer_provider: Option<sdktrace::SdkTracerProvider>,
    meter_provider: Option<sdkmetrics::SdkMeterProvider>,
}

impl TelemetryProviders {
    /// Flushes and shuts down every installed provider.
    ///
    /// Failures are printed to stderr since the subscriber may already be
    /// gone at this point.
    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider {
            if let Err(err) = provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        if let Some(provider) = self.meter_provider {
            if let Err(err) = provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

/// Installs logging plus the tracing and metrics providers enabled by
/// `config`.
///
/// Safe to call more than once per process: later calls keep the subscriber
/// installed by the first.
///
/// # Errors
///
/// Returns [`StartupError::ExporterInit`] if an exporter cannot be built.
///
/// [`StartupError::ExporterInit`]: crate::server::error::StartupError::ExporterInit
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryProviders> {
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let tracer_provider = config
        .tracing_enabled
        .then(|| init_tracer(config))
        .transpose()?;
    let meter_provider = config
        .metrics_enabled
        .then(|| init_metrics(config))
        .transpose()?;

    let scope = InstrumentationScope::builder(SCOPE)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let pretty = (!config.log_json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_thread_ids(true)
            .with_line_number(true)
            .with_target(false)
            .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
            .with_file(true)
            .pretty()
    });
    let json = config.log_json.then(|| {
        tracing_subscriber::fmt::layer()
            .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
            .json()
    });

    let otel_traces = tracer_provider.as_ref().map(|provider| {
        opentelemetry::global::set_tracer_provider(provider.clone());
        tracing_opentelemetry::layer()
            .with_tracer(provider.tracer_with_scope(scope.clone()))
            .with_error_records_to_exceptions(true)
    });

    let otel_metrics = meter_provider.as_ref().map(|provider| {
        opentelemetry::global::set_meter_provider(provider.clone());
        init_metric_handles(&opentelemetry::global::meter_with_scope(scope.clone()));
        tracing_opentelemetry::MetricsLayer::new(provider.clone())
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .with(otel_traces)
        .with(otel_metrics)
        .try_init();

    if installed.is_err() {
        tracing::debug!("global subscriber already installed; keeping it");
    }

    if config.profiling_enabled {
        tracing::warn!("profiling requested but no profiler backend is available; continuing");
    }

    Ok(TelemetryProviders {
        tracer_provider,
        meter_provider,
    })
}

fn resource(config: &TelemetryConfig) -> Resource {
    Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

fn init_tracer(config: &TelemetryConfig) -> Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder()
        .with_resource(resource(config))
        .with_sampler(sdktrace::Sampler::ParentBased(Box::new(
            sdktrace::Sampler::TraceIdRatioBased(config.sample_rate),
        )));

    #[cfg(feature = "stdout")]
    let builder = {
        let exporter = opentelemetry_stdout::SpanExporter::default();
        builder.with_span_processor(batch_processor(exporter))
    };

    #[cfg(feature = "otlp")]
    let builder = {
        let exporter = opentelemetry_otlp::SpanExporter::builder().with_tonic();
        let exporter = match &config.otlp_endpoint {
            Some(endpoint) => exporter.with_endpoint(endpoint.clone()),
            None => exporter,
        };
        let exporter = exporter
            .with_timeout(Duration::from_secs(10))
            .with_compression(Compression::Gzip)
            .with_protocol(Protocol::Grpc)
            .build()
            .map_err(|e| crate::server::error::StartupError::exporter("trace", e))?;

        builder.with_span_processor(batch_processor(exporter))
    };

    Ok(builder.build())
}

#[cfg(any(feature = "stdout", feature = "otlp"))]
fn batch_processor<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: opentelemetry_sdk::trace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

fn init_metrics(config: &TelemetryConfig) -> Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource(config));

    #[cfg(feature = "stdout")]
    let builder = {
        let exporter = opentelemetry_stdout::MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(Duration::from_secs(5))
            .build();
        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        let exporter = opentelemetry_otlp::MetricExporter::builder().with_tonic();
        let exporter = match &config.otlp_endpoint {
            Some(endpoint) => exporter.with_endpoint(endpoint.clone()),
            None => exporter,
        };
        let exporter = exporter
            .with_timeout(Duration::from_secs(10))
            .with_compression(Compression::Gzip)
            .with_protocol(Protocol::Grpc)
            .with_temporality(sdkmetrics::Temporality::Delta)
            .build()
            .map_err(|e| crate::server::error::StartupError::exporter("metrics", e))?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

static CONCURRENT_REQUESTS: OnceLock<Gauge<i64>> = OnceLock::new();
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
static DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();

fn init_metric_handles(meter: &Meter) {
    let _ = CONCURRENT_REQUESTS.set(
        meter
            .i64_gauge("grpc.server.concurrent_requests")
            .with_description("gRPC calls currently in flight")
            .build(),
    );

    let _ = REQUESTS.set(
        meter
            .u64_counter("grpc.server.requests")
            .with_description("Completed gRPC calls")
            .build(),
    );

    let _ = DURATION_MS.set(
        meter
            .f64_histogram("grpc.server.duration")
            .with_unit("ms")
            .with_description("End-to-end gRPC call latency")
            .build(),
    );
}

/// Publishes the current number of in-flight calls for `method`.
pub fn record_concurrency(method: &str, in_flight: i64) {
    if let Some(gauge) = CONCURRENT_REQUESTS.get() {
        gauge.record(in_flight, &[KeyValue::new("method", method.to_owned())]);
    }
}

/// Records one completed call.
pub fn record_request(method: &str, code: Code, elapsed: Duration) {
    let method = KeyValue::new("method", method.to_owned());

    if let Some(counter) = REQUESTS.get() {
        counter.add(
            1,
            &[
                method.clone(),
                KeyValue::new("code", format!("{code:?}")),
            ],
        );
    }

    if let Some(histogram) = DURATION_MS.get() {
        histogram.record(elapsed.as_secs_f64() * 1_000.0, &[method]);
    }
}
