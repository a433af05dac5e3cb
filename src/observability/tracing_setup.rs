//! Tracing Setup
//!
//! Installs the global subscriber once per process: an `EnvFilter`
//! (`RUST_LOG`, default `info`) and a text or JSON fmt layer. With the
//! `datadog` feature an OpenTelemetry layer exports spans to the APM agent.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use super::config::DatadogConfig;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn fmt_layer<S>(json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    }
}

#[cfg(not(feature = "datadog"))]
pub fn init(config: &DatadogConfig) -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(config.json_logs))
        .try_init()?;

    tracing::debug!(service = %config.service_name, "tracing initialized");
    Ok(())
}

#[cfg(feature = "datadog")]
pub fn init(config: &DatadogConfig) -> Result<(), BoxError> {
    use opentelemetry_datadog::DatadogPropagator;
    use opentelemetry_sdk::trace::Sampler;

    opentelemetry::global::set_text_map_propagator(DatadogPropagator::default());

    let tracer = opentelemetry_datadog::new_pipeline()
        .with_service_name(&config.service_name)
        .with_agent_endpoint(&config.trace_addr)
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(config.trace_sample_rate))
                .with_resource(opentelemetry_sdk::Resource::new(vec![
                    opentelemetry::KeyValue::new("service.name", config.service_name.clone()),
                    opentelemetry::KeyValue::new("service.version", config.version.clone()),
                    opentelemetry::KeyValue::new("deployment.environment", config.env.clone()),
                ])),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    // fmt layer before otel so spans are logged before being exported
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(config.json_logs))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()?;

    tracing::info!(
        service = %config.service_name,
        env = %config.env,
        version = %config.version,
        sample_rate = %config.trace_sample_rate,
        "Datadog observability initialized"
    );
    Ok(())
}

/// Flush pending spans. Call before exit.
pub fn shutdown() {
    #[cfg(feature = "datadog")]
    {
        tracing::info!("Shutting down Datadog tracing...");
        opentelemetry::global::shutdown_tracer_provider();
    }
}
