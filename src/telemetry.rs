//! Tracing and metrics setup
//!
//! - JSON structured logging through `tracing-subscriber`, filtered by `RUST_LOG`
//! - OTLP export of traces and metrics when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
//! - [`Metrics`], the instrument set handed to the controller through its
//!   context instead of living in globals

use opentelemetry::metrics::{Counter, Histogram, Meter};
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

use crate::task::TaskKind;

/// Errors raised while installing telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Tracer pipeline could not be built
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Metrics pipeline could not be built
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Telemetry settings
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to traces and metrics
    pub service_name: String,

    /// OTLP gRPC endpoint; logs only when unset
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "regent".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }
}

/// Install the global subscriber, and OTLP pipelines if configured
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = build_resource(&config.service_name);

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            init_otlp_metrics(endpoint, resource.clone())?;
            let provider = init_otlp_tracer(endpoint, resource)?;
            let tracer = provider.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,regent=debug,kube=info,tower=warn,hyper=warn"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(())
}

fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![KeyValue::new(
        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
        service_name.to_string(),
    )];

    for (var, key) in [
        ("POD_NAME", "k8s.pod.name"),
        ("POD_NAMESPACE", "k8s.namespace.name"),
        ("NODE_NAME", "k8s.node.name"),
    ] {
        if let Ok(value) = std::env::var(var) {
            attributes.push(KeyValue::new(key, value));
        }
    }

    attributes.push(KeyValue::new(
        opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
        env!("CARGO_PKG_VERSION"),
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

/// Controller instruments
///
/// Cheap to clone; every instrument is a handle into the meter provider it was
/// created from. Without an installed provider the instruments are no-ops.
#[derive(Clone, Debug)]
pub struct Metrics {
    passes: Counter<u64>,
    pass_duration: Histogram<f64>,
    leader_transfers: Counter<u64>,
    pod_actions: Counter<u64>,
}

impl Metrics {
    /// Create the instrument set on `meter`
    pub fn new(meter: &Meter) -> Self {
        Self {
            passes: meter
                .u64_counter("regent_reconcile_passes_total")
                .with_description("Reconciliation passes by result kind")
                .with_unit("{passes}")
                .build(),
            pass_duration: meter
                .f64_histogram("regent_reconcile_duration_seconds")
                .with_description("Duration of reconciliation passes in seconds")
                .with_unit("s")
                .build(),
            leader_transfers: meter
                .u64_counter("regent_leader_transfers_total")
                .with_description("Leadership transfers requested, by outcome")
                .with_unit("{transfers}")
                .build(),
            pod_actions: meter
                .u64_counter("regent_pod_actions_total")
                .with_description("Pod create, update and delete calls")
                .with_unit("{actions}")
                .build(),
        }
    }

    /// Instruments on the global meter provider
    pub fn global() -> Self {
        Self::new(&global::meter("regent"))
    }

    /// Record one finished pass
    pub fn record_pass(&self, group: &str, kind: TaskKind, seconds: f64) {
        let attrs = [
            KeyValue::new("group", group.to_string()),
            KeyValue::new("result", kind.to_string()),
        ];
        self.passes.add(1, &attrs);
        self.pass_duration.record(seconds, &attrs);
    }

    /// Record a leadership transfer attempt
    pub fn record_transfer(&self, group: &str, ok: bool) {
        self.leader_transfers.add(
            1,
            &[
                KeyValue::new("group", group.to_string()),
                KeyValue::new("outcome", if ok { "ok" } else { "error" }),
            ],
        );
    }

    /// Record a pod mutation (`create`, `update`, `delete`)
    pub fn record_pod_action(&self, group: &str, action: &'static str) {
        self.pod_actions.add(
            1,
            &[
                KeyValue::new("group", group.to_string()),
                KeyValue::new("action", action),
            ],
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::global()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_names_the_service() {
        let config = TelemetryConfig {
            otlp_endpoint: None,
            ..Default::default()
        };
        assert_eq!(config.service_name, "regent");
    }

    #[test]
    fn metrics_record_without_a_provider() {
        let metrics = Metrics::global();
        metrics.record_pass("tidb/pd", TaskKind::Complete, 0.01);
        metrics.record_transfer("tidb/pd", true);
        metrics.record_pod_action("tidb/pd", "delete");
    }
}
