//! Logging and OpenTelemetry export.
//!
//! Local output always goes through a `fmt` layer filtered by `RUST_LOG` or
//! the configured level. With an OTLP endpoint, spans, log events and the
//! `visitq` instruments from [`metrics`] are exported there as well.

pub mod metrics;
pub mod sync;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint (e.g. "http://localhost:4317"). Local output only when `None`.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            service_name: metrics::METER_NAME.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl From<&Config> for TelemetryConfig {
    fn from(config: &Config) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone().filter(|e| !e.is_empty()),
            log_level: config.log_level.clone(),
            ..Self::default()
        }
    }
}

/// Keeps the export pipelines alive. Dropping it flushes and shuts them down.
pub struct TelemetryGuard {
    export: Option<Pipelines>,
}

impl TelemetryGuard {
    pub fn is_exporting(&self) -> bool {
        self.export.is_some()
    }
}

struct Pipelines {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
    logs: SdkLoggerProvider,
}

impl Pipelines {
    fn connect(endpoint: &str, service_name: &str) -> Result<Self> {
        let resource = Resource::builder()
            .with_service_name(service_name.to_string())
            .with_attribute(KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")))
            .build();

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let points = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let records = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;

        Ok(Self {
            traces: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            metrics: SdkMeterProvider::builder()
                .with_periodic_exporter(points)
                .with_resource(resource.clone())
                .build(),
            logs: SdkLoggerProvider::builder()
                .with_batch_exporter(records)
                .with_resource(resource)
                .build(),
        })
    }
}

impl Drop for Pipelines {
    fn drop(&mut self) {
        // Logs first so records emitted while spans close still go out.
        let _ = self.logs.shutdown();
        let _ = self.metrics.shutdown();
        let _ = self.traces.shutdown();
    }
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

/// Install the global subscriber and, when an endpoint is set, the OTLP
/// pipelines and the global meter provider the `visitq` instruments use.
///
/// Fails if an exporter cannot be built or a subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let export = config
        .endpoint
        .as_deref()
        .map(|endpoint| Pipelines::connect(endpoint, &config.service_name))
        .transpose()?;

    if let Some(pipelines) = &export {
        opentelemetry::global::set_meter_provider(pipelines.metrics.clone());
    }

    let trace_layer = export.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(p.traces.tracer(metrics::METER_NAME))
    });
    let log_layer = export.as_ref().map(|p| {
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&p.logs)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard { export })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned()).unwrap()
    }

    #[test]
    fn follows_the_loaded_config() {
        let telemetry = TelemetryConfig::from(&config(&[
            ("VISITQ_REMOTE_URL", "https://backend.example"),
            ("VISITQ_REMOTE_KEY", "key"),
            ("OTEL_ENDPOINT", "http://collector:4317"),
            ("LOG_LEVEL", "visitq=debug"),
        ]));
        assert_eq!(telemetry.endpoint.as_deref(), Some("http://collector:4317"));
        assert_eq!(telemetry.log_level, "visitq=debug");
        assert_eq!(telemetry.service_name, metrics::METER_NAME);
    }

    #[test]
    fn blank_endpoint_keeps_output_local() {
        let telemetry = TelemetryConfig::from(&config(&[
            ("VISITQ_REMOTE_URL", "https://backend.example"),
            ("VISITQ_REMOTE_KEY", "key"),
            ("OTEL_ENDPOINT", ""),
        ]));
        assert_eq!(telemetry.endpoint, None);
        assert_eq!(telemetry.log_level, "info");
    }
}
