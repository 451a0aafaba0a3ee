//! Tracing and OpenTelemetry wiring.
//!
//! Log level comes from `POLOS_LOG_LEVEL` via the config; the OTLP span
//! pipeline is optional (`POLOS_OTEL_ENABLED=false` disables it) and its
//! failure is never fatal to worker startup.
//!
//! Trace identity (deterministic trace ids, traceparent inheritance, span
//! kinds) lives in [`polos_domain::trace`] and is stamped onto spans by
//! the executor; this module only sets up the export side.

use opentelemetry::trace::TracerProvider as _;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use polos_domain::config::WorkerConfig;
use polos_domain::error::{Error, Result};

pub use polos_domain::trace::{parse_traceparent, span_kind_for, trace_id_from_execution};

/// Initialise the tracing subscriber, with an OTLP layer when enabled.
///
/// Safe to call more than once; subsequent calls are no-ops (the first
/// subscriber wins).
pub fn init(cfg: &WorkerConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&cfg.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    if !cfg.otel.enabled {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .ok();
        return Ok(());
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
        .map_err(|e| Error::Config(format!("otlp exporter: {e}")))?;
    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_service_name(cfg.otel.service_name.clone())
                .build(),
        )
        .build();
    let tracer = provider.tracer("polos-worker");
    opentelemetry::global::set_tracer_provider(provider);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()
        .ok();
    Ok(())
}
