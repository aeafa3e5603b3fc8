//! Tracing/OpenTelemetry initialization for the orchestrator binary.
//!
//! A console `fmt` layer is always present; an OTLP layer is added only
//! when an endpoint is configured. This is the only process-wide global
//! state this crate sets up, per the "no singletons" design note — every
//! other component takes its loggers/sinks as constructor arguments.
//!
//! Configuration via environment variables:
//! - `OTEL_SERVICE_NAME`
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`
//! - `OTEL_TRACES_SAMPLER_ARG` (0.0-1.0)

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otlp_endpoint: Option<String>,
    pub sampling_ratio: f64,
    pub enable_console_logging: bool,
    pub log_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "dut-orchestrator".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            enable_console_logging: true,
            log_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }

        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = Some(endpoint);
        }

        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(r) = ratio.parse::<f64>() {
                config.sampling_ratio = r.clamp(0.0, 1.0);
            }
        }

        config
    }
}

/// Installs the global `tracing` subscriber and, if an OTLP endpoint is
/// configured, returns the tracer so [`shutdown_telemetry`] can flush it.
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(endpoint) = &config.otlp_endpoint {
        let tracer = init_otlp_tracer(&config.service_name, endpoint, config.sampling_ratio)?;
        let telemetry_layer = OpenTelemetryLayer::new(tracer.clone());

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(telemetry_layer);

        if config.enable_console_logging {
            subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
        } else {
            subscriber.init();
        }

        tracing::info!(
            service_name = %config.service_name,
            endpoint = %endpoint,
            sampling_ratio = config.sampling_ratio,
            "telemetry initialized with OTLP export"
        );

        Ok(Some(tracer))
    } else {
        let subscriber = tracing_subscriber::registry().with(env_filter);

        if config.enable_console_logging {
            subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
        } else {
            subscriber.init();
        }

        tracing::info!("telemetry initialized (console only, no OTLP)");
        Ok(None)
    }
}

fn init_otlp_tracer(
    service_name: &str,
    endpoint: &str,
    sampling_ratio: f64,
) -> anyhow::Result<Tracer> {
    let sampler = if sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(sampling_ratio)
    };

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name.to_string());
    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}

/// Flushes pending OTLP spans. Must be called before process exit or the
/// batch exporter's buffer is lost.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
