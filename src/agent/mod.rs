//! Metrics agent
//!
//! A [`Collector`] feeds a bounded channel of capacity `rate_limit`; a
//! [`PublisherPool`] of `rate_limit` workers drains it. Cancelling the token
//! stops the collector, which closes the channel, which lets the workers
//! drain and exit.

pub mod collector;
pub mod pool;
pub mod publisher;

pub use collector::{Collector, MetricSource, RuntimeSource};
pub use pool::{PoolHandle, PublisherPool, WorkerReport};
pub use publisher::{
    build_publisher, detect_origin, GrpcPublisher, HttpPublisher, PublishError, Publisher,
};

use crate::config::AgentConfig;
use crate::observability::{noop_metrics, SharedMetrics};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Agent {
    config: AgentConfig,
    source: Box<dyn MetricSource>,
    publisher: Arc<dyn Publisher>,
    metrics: SharedMetrics,
}

impl Agent {
    /// Runtime source and the configured transport. Call inside a tokio
    /// runtime.
    pub fn new(config: AgentConfig) -> Result<Self, PublishError> {
        let publisher = build_publisher(&config)?;
        Ok(Self::with_parts(config, Box::new(RuntimeSource::new()), publisher))
    }

    pub fn with_parts(
        config: AgentConfig,
        source: Box<dyn MetricSource>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Agent {
            config,
            source,
            publisher,
            metrics: noop_metrics(),
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Collect and publish until `cancel` fires, then drain. Returns what
    /// each worker could not deliver before the shutdown timeout.
    pub async fn run(self, cancel: CancellationToken) -> Vec<WorkerReport> {
        let capacity = self.config.rate_limit.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        let pool = PublisherPool::new(self.publisher, &self.config)
            .with_metrics(self.metrics)
            .spawn(rx);
        let collector = Collector::new(
            self.source,
            self.config.poll_interval(),
            self.config.report_interval(),
        );

        collector.run(tx, cancel).await;
        let reports = pool.join().await;

        let lost: usize = reports.iter().map(|r| r.undelivered.len()).sum();
        if lost > 0 {
            warn!(counters = lost, "Agent stopped with undelivered counters");
        } else {
            info!("Agent stopped");
        }
        reports
    }
}
