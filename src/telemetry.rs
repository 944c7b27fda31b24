use std::time::Duration;

use anyhow::Result;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{TonicExporterBuilder, WithExportConfig};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Config, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;

/// Keeps the exporters alive, flushes them when dropped
pub(crate) struct TelemetryGuard {
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.meter_provider.take() {
            if let Err(err) = provider.shutdown() {
                tracing::error!("Failed to shut down meter provider: {}", err);
            }
            global::shutdown_tracer_provider();
        }
    }
}

/// Console logging is always on, OTLP export only when an endpoint is given
pub(crate) fn init_telemetry(endpoint: Option<&str>) -> Result<TelemetryGuard> {
    let exporters = endpoint.map(install_exporters).transpose()?;
    let (tracer, meter_provider) = match exporters {
        Some((tracer, meter_provider)) => (Some(tracer), Some(meter_provider)),
        None => (None, None),
    };

    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("INFO")))
        .with(tracer.map(OpenTelemetryLayer::new))
        .with(meter_provider.clone().map(MetricsLayer::new))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(TelemetryGuard { meter_provider })
}

fn install_exporters(endpoint: &str) -> Result<(Tracer, SdkMeterProvider)> {
    let service_resource = Resource::new(vec![
        KeyValue::new(SERVICE_NAME, env!("CARGO_PKG_NAME")),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ]);

    let tracer_provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(build_tonic_exporter(endpoint))
        .with_trace_config(Config::default().with_resource(service_resource.clone()))
        .install_batch(runtime::Tokio)?;
    let tracer = tracer_provider.tracer(env!("CARGO_PKG_NAME"));
    global::set_tracer_provider(tracer_provider);

    let meter_provider = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(build_tonic_exporter(endpoint))
        .with_resource(service_resource)
        .build()?;

    global::set_text_map_propagator(TraceContextPropagator::new());
    Ok((tracer, meter_provider))
}

fn build_tonic_exporter(endpoint: &str) -> TonicExporterBuilder {
    opentelemetry_otlp::new_exporter()
        .tonic()
        .with_timeout(Duration::from_secs(15))
        .with_endpoint(endpoint)
}
