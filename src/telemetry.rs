//! Logging and trace export for `hubstage` runs.
//!
//! hubstage mostly runs unattended: a scheduler fires `hubstage merge` on a
//! cron, and dashboards poll `hubstage status`. Command results go to stdout;
//! everything here writes to stderr or ships off-host, so a cron log holds
//! the merge events and stdout stays parseable with `--format json`.
//!
//! Where events go is picked from `OTEL_EXPORTER_OTLP_ENDPOINT`:
//!
//! | Value          | Sink                                                  |
//! |----------------|-------------------------------------------------------|
//! | unset or empty | compact lines, `RUST_LOG` filter (default [`QUIET`])  |
//! | `stderr`       | one JSON object per event, spans closed with timings  |
//! | a URL          | OTLP over HTTP (traces and logs), `otel` feature only |
//!
//! A scheduler that traces its jobs can pass `TRACEPARENT`; the merge run's
//! spans (lease, publish, cleanup) then hang under that job's trace.

use tracing_subscriber::EnvFilter;

/// Default filter for the compact sink: lease and publish events from
/// hubstage, only warnings from everything else.
pub const QUIET: &str = "warn,hubstage=info";

/// Default filter for the structured sinks.
const VERBOSE: &str = "info";

/// Where events are written.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Sink {
    Compact,
    Json,
    Otlp,
}

impl Sink {
    fn from_endpoint(endpoint: Option<&str>) -> Self {
        match endpoint.map(str::trim) {
            None | Some("") => Self::Compact,
            Some("stderr") => Self::Json,
            Some(_) => Self::Otlp,
        }
    }
}

/// Keeps exporters alive for the run. Dropping it flushes buffered spans and
/// log records, so `main` holds it until the command finishes.
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    providers: Option<OtlpProviders>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(providers) = self.providers.take() {
            providers.shutdown();
        }
    }
}

/// Install the subscriber for this process.
///
/// A subscriber that is already installed (tests, embedding callers) is left
/// in place.
#[must_use]
pub fn init() -> TelemetryGuard {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    match Sink::from_endpoint(endpoint.as_deref()) {
        Sink::Compact => init_compact(),
        Sink::Json => init_json(),
        #[cfg(feature = "otel")]
        Sink::Otlp => init_otlp(),
        #[cfg(not(feature = "otel"))]
        Sink::Otlp => {
            eprintln!(
                "warning: OTEL_EXPORTER_OTLP_ENDPOINT is set but this hubstage build has no 'otel' feature; logging to stderr"
            );
            init_compact()
        }
    }
}

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

const fn unexported() -> TelemetryGuard {
    TelemetryGuard {
        #[cfg(feature = "otel")]
        providers: None,
    }
}

fn init_compact() -> TelemetryGuard {
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter(QUIET))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    unexported()
}

fn init_json() -> TelemetryGuard {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let _ = tracing_subscriber::registry()
        .with(filter(VERBOSE))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE),
        )
        .try_init();
    unexported()
}

// ---------------------------------------------------------------------------
// OTLP
// ---------------------------------------------------------------------------

#[cfg(feature = "otel")]
struct OtlpProviders {
    traces: opentelemetry_sdk::trace::SdkTracerProvider,
    logs: opentelemetry_sdk::logs::SdkLoggerProvider,
}

#[cfg(feature = "otel")]
impl OtlpProviders {
    /// Exporters read the endpoint from the environment and append
    /// `/v1/traces` and `/v1/logs` themselves.
    fn build() -> Result<Self, String> {
        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .build()
            .map_err(|e| format!("span exporter: {e}"))?;
        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_http()
            .build()
            .map_err(|e| format!("log exporter: {e}"))?;
        let resource = service_resource();
        Ok(Self {
            traces: opentelemetry_sdk::trace::SdkTracerProvider::builder()
                .with_simple_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            logs: opentelemetry_sdk::logs::SdkLoggerProvider::builder()
                .with_simple_exporter(logs)
                .with_resource(resource)
                .build(),
        })
    }

    fn shutdown(self) {
        if let Err(e) = self.traces.shutdown() {
            eprintln!("hubstage: flushing traces failed: {e}");
        }
        if let Err(e) = self.logs.shutdown() {
            eprintln!("hubstage: flushing logs failed: {e}");
        }
    }
}

#[cfg(feature = "otel")]
fn init_otlp() -> TelemetryGuard {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let providers = match OtlpProviders::build() {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("warning: OTLP export disabled ({e}); logging to stderr");
            return init_compact();
        }
    };

    attach_scheduler_trace();

    let tracer = providers.traces.tracer(env!("CARGO_PKG_NAME"));
    let _ = tracing_subscriber::registry()
        .with(filter(VERBOSE))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(OpenTelemetryTracingBridge::new(&providers.logs))
        .try_init();

    TelemetryGuard {
        providers: Some(providers),
    }
}

/// Parent this run's spans on the scheduler job named by `TRACEPARENT`.
#[cfg(feature = "otel")]
fn attach_scheduler_trace() {
    use opentelemetry::propagation::TextMapPropagator as _;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use std::collections::HashMap;

    let Ok(traceparent) = std::env::var("TRACEPARENT") else {
        return;
    };
    let carrier = HashMap::from([("traceparent".to_owned(), traceparent)]);
    let cx = TraceContextPropagator::new().extract(&carrier);
    // Process-lifetime context; the guard is never dropped.
    std::mem::forget(cx.attach());
}

#[cfg(feature = "otel")]
fn service_resource() -> opentelemetry_sdk::Resource {
    use opentelemetry::KeyValue;
    opentelemetry_sdk::Resource::builder()
        .with_attribute(KeyValue::new("service.name", env!("CARGO_PKG_NAME")))
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .build()
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    #[test]
    fn sink_follows_endpoint() {
        assert_eq!(Sink::from_endpoint(None), Sink::Compact);
        assert_eq!(Sink::from_endpoint(Some("")), Sink::Compact);
        assert_eq!(Sink::from_endpoint(Some("  ")), Sink::Compact);
        assert_eq!(Sink::from_endpoint(Some("stderr")), Sink::Json);
        assert_eq!(
            Sink::from_endpoint(Some("http://collector:4318")),
            Sink::Otlp
        );
    }

    #[test]
    fn quiet_filter_parses() {
        assert!(EnvFilter::try_new(QUIET).is_ok());
    }
}
