//! Logging and tracing setup for the vnode binary
//!
//! Installs a JSON `tracing` subscriber filtered by `RUST_LOG`. When an OTLP
//! endpoint is configured, spans and metrics are also exported over gRPC and
//! the W3C TraceContext propagator is registered globally.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,vnode=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize OpenTelemetry tracer
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize OTLP metrics exporter
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for traces and metrics
    pub service_name: String,

    /// Name of the virtual node, attached to every exported span and metric
    pub node_name: Option<String>,

    /// OTLP endpoint (e.g. "http://otel-collector:4317"); `None` logs locally only
    pub otlp_endpoint: Option<String>,

    /// Emit human-readable logs instead of JSON
    pub pretty: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "vnode".to_string(),
            node_name: None,
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            pretty: false,
        }
    }
}

/// Initialize telemetry with the given configuration
///
/// Fails if a global subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = build_resource(&config.service_name, config.node_name.as_deref());

    let otel_layer = if let Some(endpoint) = &config.otlp_endpoint {
        init_otlp_metrics(endpoint, resource.clone())?;
        let provider = init_otlp_tracer(endpoint, resource)?;
        let tracer = provider.tracer(config.service_name.clone());
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // Option<Layer> implements Layer, so exactly one of these is active
    let (json_layer, pretty_layer) = if config.pretty {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    Ok(())
}

fn build_resource(service_name: &str, node_name: Option<&str>) -> Resource {
    let mut attributes = vec![KeyValue::new(
        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
        service_name.to_string(),
    )];

    if let Some(node) = node_name {
        attributes.push(KeyValue::new("vnode.node.name", node.to_string()));
    }
    // Set via the Deployment's downward API
    if let Ok(pod_name) = std::env::var("POD_NAME") {
        attributes.push(KeyValue::new("k8s.pod.name", pod_name));
    }
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace));
    }

    attributes.push(KeyValue::new(
        opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
        env!("CARGO_PKG_VERSION").to_string(),
    ));

    Resource::new(attributes)
}

fn init_otlp_tracer(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());

    Ok(provider)
}

fn init_otlp_metrics(endpoint: &str, resource: Resource) -> Result<(), TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let reader =
        opentelemetry_sdk::metrics::PeriodicReader::builder(exporter, runtime::Tokio).build();

    let meter_provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(meter_provider);

    Ok(())
}
