use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber: env-filtered JSON logs, plus an OTLP span
/// exporter when `otlp_endpoint` is set.
///
/// Falls back to plain JSON logging if the exporter cannot be built, so a
/// missing collector never keeps the service from starting.
pub fn init_tracing(service_name: &str, log_level: &str, otlp_endpoint: Option<&str>) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .json()
        .flatten_event(true);

    let (telemetry, exporter_error) = match otlp_endpoint {
        Some(endpoint) => match build_tracer(service_name, endpoint) {
            Ok(tracer) => (
                Some(tracing_opentelemetry::layer().with_tracer(tracer).boxed()),
                None,
            ),
            Err(e) => (None, Some((endpoint.to_string(), e))),
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(telemetry)
        .with(fmt_layer)
        .init();

    if let Some((endpoint, e)) = exporter_error {
        tracing::error!(
            service = %service_name,
            endpoint = %endpoint,
            error = %e,
            "Failed to initialize OTLP tracer, continuing with local logs only"
        );
    }
}

fn build_tracer(
    service_name: &str,
    endpoint: &str,
) -> Result<sdktrace::Tracer, opentelemetry::trace::TraceError> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
        ])))
        .install_batch(runtime::Tokio)
}
