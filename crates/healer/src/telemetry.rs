//! Logging and metrics export setup for the binary.

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::Resource;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool, format: LogFormat) {
    let default_filter = if verbose {
        "healer=debug,notify=debug,info"
    } else {
        "healer=info,notify=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (text, json) = match format {
        LogFormat::Text => (Some(fmt::layer()), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_current_span(true))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
}

/// Keeps the OTLP meter provider alive; flushes it on shutdown.
#[derive(Default)]
pub struct MetricsGuard {
    provider: Option<SdkMeterProvider>,
}

impl MetricsGuard {
    pub fn shutdown(self) {
        if let Some(provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                warn!(error = %e, "Failed to flush metrics exporter");
            }
        }
    }
}

/// Export metrics over OTLP/HTTP when an endpoint is configured.
///
/// Without an endpoint the global meter stays a no-op and metrics are only
/// served from `/metrics`.
pub fn init_metrics(endpoint: Option<&str>) -> Result<MetricsGuard> {
    let Some(endpoint) = endpoint else {
        return Ok(MetricsGuard::default());
    };
    let endpoint = metrics_url(endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(endpoint.as_str())
        .build()
        .with_context(|| format!("failed to build OTLP metric exporter for {endpoint}"))?;

    let provider = SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(Resource::builder().with_service_name("healer").build())
        .build();
    global::set_meter_provider(provider.clone());

    info!(%endpoint, "OTLP metrics export enabled");
    Ok(MetricsGuard {
        provider: Some(provider),
    })
}

/// A programmatic HTTP endpoint is used verbatim, so a collector base URL
/// such as `http://otel:4318` gets the metrics signal path appended.
fn metrics_url(endpoint: &str) -> String {
    const SIGNAL_PATH: &str = "/v1/metrics";

    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.ends_with(SIGNAL_PATH) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{SIGNAL_PATH}")
    }
}
