use opentelemetry::trace::TraceId;
use tracing_subscriber::{EnvFilter, Registry, prelude::*};

///  Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _; // opentelemetry::Context -> opentelemetry::trace::Span
    use tracing_opentelemetry::OpenTelemetrySpanExt as _; // tracing::Span to opentelemetry::Context

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

fn init_tracer() -> opentelemetry_sdk::trace::Tracer {
    use opentelemetry::trace::TracerProvider;
    #[cfg(feature = "telemetry")]
    use opentelemetry_otlp::SpanExporter;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    let builder = SdkTracerProvider::builder();
    #[cfg(feature = "telemetry")]
    let builder = match SpanExporter::builder().with_tonic().build() {
        Ok(exporter) => builder.with_batch_exporter(exporter),
        Err(e) => {
            eprintln!("failed to build span exporter, traces are not exported: {e}");
            builder
        }
    };
    builder.build().tracer("k0smotron")
}

/// Initialize tracing
pub async fn init() {
    let telemetry = tracing_opentelemetry::layer().with_tracer(init_tracer());
    let logger = tracing_subscriber::fmt::layer().compact();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_default();

    let collector = Registry::default()
        .with(telemetry)
        .with(logger)
        .with(env_filter);

    if let Err(e) = tracing::subscriber::set_global_default(collector) {
        eprintln!("tracing subscriber already installed: {e}");
    }
}
