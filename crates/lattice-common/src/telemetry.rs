//! Logging and optional trace export for lattice-train processes
//!
//! Both sides of a deploy log through `tracing`. A developer's terminal gets
//! compact text; a worker pod gets JSON lines so the cluster's log collector
//! can parse them. When `OTEL_EXPORTER_OTLP_ENDPOINT` is set, spans are also
//! exported over OTLP, tagged with the job and role a worker pod belongs to.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::{JOB_NAME_ENV, ROLE_ENV};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,lattice_train=debug,kube=info,tower=warn,hyper=warn";

/// Environment variables copied onto the exported resource, with their attribute keys
const RESOURCE_ENV: &[(&str, &str)] = &[
    (JOB_NAME_ENV, "lattice.train.job"),
    (ROLE_ENV, "lattice.train.role"),
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The OTLP span exporter could not be built
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),

    /// Buffered spans could not be flushed on exit
    #[error("failed to shut down tracer: {0}")]
    Shutdown(String),
}

/// Owns the span exporter installed by [`init_telemetry`].
///
/// Call [`TelemetryGuard::shutdown`] before the process exits so batched
/// spans reach the collector. It blocks, so async callers run it on a
/// blocking thread.
#[derive(Default)]
pub struct TelemetryGuard {
    provider: Option<TracerProvider>,
}

impl TelemetryGuard {
    /// Flush and stop the exporter; a no-op when no endpoint was configured
    pub fn shutdown(self) -> Result<(), TelemetryError> {
        match self.provider {
            Some(provider) => provider
                .shutdown()
                .map_err(|e| TelemetryError::Shutdown(e.to_string())),
            None => Ok(()),
        }
    }
}

/// Output format for log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human-readable lines, for a developer's terminal
    #[default]
    Text,
    /// JSON lines with span context, for log collectors in the cluster
    Json,
}

impl LogFormat {
    /// JSON inside a pod, text everywhere else
    pub fn detect() -> Self {
        if crate::kube_utils::is_running_in_cluster() {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Settings for [`init_telemetry`]
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` on exported spans
    pub service_name: String,

    /// OTLP collector (e.g. "http://otel-collector:4317"); logs only when `None`
    pub otlp_endpoint: Option<String>,

    /// Log line format
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "lattice-train".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|e| !e.is_empty()),
            format: LogFormat::detect(),
        }
    }
}

/// Install the global `tracing` subscriber
///
/// # Example
///
/// ```ignore
/// use lattice_common::telemetry::{init_telemetry, TelemetryConfig};
///
/// let telemetry = init_telemetry(TelemetryConfig::default())?;
/// // ...
/// telemetry.shutdown()?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let mut guard = TelemetryGuard::default();
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let provider = span_exporter(endpoint, build_resource(&config.service_name))?;
            let tracer = provider.tracer(config.service_name.clone());
            guard.provider = Some(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(guard)
}

fn resource_attributes(
    service_name: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];
    for (var, key) in RESOURCE_ENV {
        if let Some(value) = lookup(var).filter(|v| !v.is_empty()) {
            attributes.push(KeyValue::new(*key, value));
        }
    }
    attributes
}

fn build_resource(service_name: &str) -> Resource {
    Resource::new(resource_attributes(service_name, |var| {
        std::env::var(var).ok()
    }))
}

fn span_exporter(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
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
