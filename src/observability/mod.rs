//! Observability
//!
//! - Structured logging through `tracing`, installed by [`init_tracing`]
//! - Span helpers for requests, publishes and storage calls
//! - Self-metrics through the [`MetricsRecorder`] trait
//! - With the `datadog` feature: APM export and a DogStatsD recorder
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RUST_LOG` | `info` | Log filter |
//! | `LOG_FORMAT` | `text` | `json` switches to JSON lines |
//! | `DD_SERVICE` | binary name | Service name |
//! | `DD_ENV` | `development` | Environment tag |
//! | `DD_VERSION` | pkg version | Service version |
//! | `DD_DOGSTATSD_URL` | `127.0.0.1:8125` | DogStatsD address |
//! | `DD_TRACE_AGENT_URL` | `http://127.0.0.1:8126` | APM agent URL |
//! | `DD_TRACE_SAMPLE_RATE` | `1.0` | Trace sampling rate |
//! | `DD_METRIC_PREFIX` | `metrics_pipeline` | Metric name prefix |
//! | `DD_TAGS` | `` | Global tags (k1:v1,k2:v2) |

pub mod config;
#[cfg(feature = "datadog")]
pub mod metrics;
pub mod recorder;
pub mod spans;
pub mod tracing_setup;

pub use config::DatadogConfig;
#[cfg(feature = "datadog")]
pub use metrics::StatsdMetrics;
pub use spans::*;
pub use tracing_setup::{init as init_tracing, shutdown};

pub use recorder::{
    noop_metrics, simulated_metrics, MetricType, MetricsRecorder, NoopMetrics, RecordedMetric,
    SharedMetrics, SimulatedMetrics,
};

/// Recorder for a binary: DogStatsD with the `datadog` feature, no-op otherwise
pub fn default_metrics(config: &DatadogConfig) -> SharedMetrics {
    #[cfg(feature = "datadog")]
    {
        std::sync::Arc::new(StatsdMetrics::new(config))
    }
    #[cfg(not(feature = "datadog"))]
    {
        let _ = config;
        noop_metrics()
    }
}
