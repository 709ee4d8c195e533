//! Logging and OpenTelemetry initialization.
//!
//! Every cascade process is short-lived: a driver on a login node or one
//! turn at the start of a batch job. Log lines go to stderr, which the
//! batch service already captures into the job's `.out` file, so logs are
//! never exported. With an OTLP endpoint configured, turn spans and the
//! counters in [`metrics`] are exported, tagged with the job they came from.

pub mod metrics;
pub mod turn;

use crate::error::{Error, Result};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::warn;

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// Optional OTLP endpoint (e.g. "http://localhost:4317").
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
    /// Resource attributes identifying this process, see [`job_attributes`].
    pub attributes: Vec<KeyValue>,
}

/// Resource attributes for one cascade process.
///
/// Jobs from many turns export into the same backend; these tell them
/// apart.
pub fn job_attributes(cluster: &str, user: &str, job_id: Option<&str>) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new("cascade.cluster", cluster.to_string()),
        KeyValue::new("cascade.user", user.to_string()),
    ];
    if let Some(id) = job_id {
        attributes.push(KeyValue::new("slurm.job_id", id.to_string()));
    }
    attributes
}

/// Keeps the export pipelines alive. Dropping it flushes and shuts them
/// down, so hold it until the process is about to exit.
pub struct TelemetryGuard {
    export: Option<Export>,
}

impl TelemetryGuard {
    /// Whether spans and metrics leave the process.
    pub fn is_exporting(&self) -> bool {
        self.export.is_some()
    }
}

struct Export {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(export) = self.export.take() else {
            return;
        };
        // Metrics first: the final turn counters matter more than its span.
        if let Err(e) = export.meter_provider.shutdown() {
            warn!(error = %e, "metric export did not shut down cleanly");
        }
        if let Err(e) = export.tracer_provider.shutdown() {
            warn!(error = %e, "span export did not shut down cleanly");
        }
    }
}

/// Install the stderr log subscriber, plus span and metric export when an
/// endpoint is configured.
///
/// # Errors
///
/// Fails if an OTLP exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let export = match &config.endpoint {
        Some(endpoint) => Some(build_export(endpoint, &config)?),
        None => None,
    };
    let span_layer = export.as_ref().map(|export| {
        tracing_opentelemetry::layer().with_tracer(export.tracer_provider.tracer("cascade-rs"))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(span_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard { export })
}

fn build_export(endpoint: &str, config: &TelemetryConfig) -> Result<Export> {
    use opentelemetry_otlp::WithExportConfig as _;

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attributes(config.attributes.iter().cloned())
        .build();

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("OTLP span exporter for {endpoint}: {e}")))?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter)
        .with_resource(resource.clone())
        .build();

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("OTLP metric exporter for {endpoint}: {e}")))?;
    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .with_resource(resource)
        .build();
    opentelemetry::global::set_meter_provider(meter_provider.clone());

    Ok(Export {
        tracer_provider,
        meter_provider,
    })
}
