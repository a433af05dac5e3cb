//! Publisher Pool
//!
//! `rate_limit` workers share one receiver. Each worker delivers batches
//! strictly one at a time and owns a carried failed-counter set:
//! - on success the carried set is cleared
//! - on failure the counters of the attempt (not the gauges) are carried
//!   into the next attempt
//!
//! When the channel closes every worker drains its carried set, retrying
//! every `drain_interval` until it is empty or `shutdown_timeout` elapses.

use super::publisher::{PublishError, Publisher};
use crate::config::AgentConfig;
use crate::metric::{MetricDto, MetricSet};
use crate::observability::{noop_metrics, publish_span, SharedMetrics};
use crate::security::signer::to_dto;
use crate::security::Signer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn, Instrument};

pub struct PublisherPool {
    publisher: Arc<dyn Publisher>,
    signer: Option<Signer>,
    workers: usize,
    drain_interval: Duration,
    shutdown_timeout: Duration,
    metrics: SharedMetrics,
}

impl PublisherPool {
    pub fn new(publisher: Arc<dyn Publisher>, config: &AgentConfig) -> Self {
        PublisherPool {
            publisher,
            signer: Signer::from_secret(config.key.as_deref()),
            workers: config.rate_limit.max(1),
            drain_interval: config.drain_interval(),
            shutdown_timeout: config.shutdown_timeout(),
            metrics: noop_metrics(),
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Start the workers. They run until `rx` is closed and drained.
    pub fn spawn(self, rx: mpsc::Receiver<MetricSet>) -> PoolHandle {
        let rx = Arc::new(Mutex::new(rx));
        let mut tasks = JoinSet::new();
        for id in 0..self.workers {
            let worker = Worker {
                id,
                publisher: self.publisher.clone(),
                signer: self.signer.clone(),
                carried: MetricSet::new(),
                drain_interval: self.drain_interval,
                shutdown_timeout: self.shutdown_timeout,
                metrics: self.metrics.clone(),
            };
            tasks.spawn(worker.run(rx.clone()));
        }
        info!(workers = self.workers, transport = self.publisher.transport(), "Publisher pool started");
        PoolHandle { tasks }
    }
}

pub struct PoolHandle {
    tasks: JoinSet<WorkerReport>,
}

/// What a worker left undelivered when it stopped
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub id: usize,
    pub undelivered: MetricSet,
}

impl PoolHandle {
    /// Wait for every worker to finish draining
    pub async fn join(mut self) -> Vec<WorkerReport> {
        let mut reports = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => warn!(error = %e, "Publisher worker panicked"),
            }
        }
        reports.sort_by_key(|r| r.id);
        reports
    }
}

struct Worker {
    id: usize,
    publisher: Arc<dyn Publisher>,
    signer: Option<Signer>,
    carried: MetricSet,
    drain_interval: Duration,
    shutdown_timeout: Duration,
    metrics: SharedMetrics,
}

impl Worker {
    async fn run(mut self, rx: Arc<Mutex<mpsc::Receiver<MetricSet>>>) -> WorkerReport {
        loop {
            let next = { rx.lock().await.recv().await };
            match next {
                Some(batch) => {
                    let _ = self.deliver(batch).await;
                }
                None => break,
            }
        }
        self.drain().await;
        WorkerReport {
            id: self.id,
            undelivered: self.carried,
        }
    }

    fn encode(&self, set: &MetricSet) -> Vec<MetricDto> {
        set.iter()
            .map(|(name, value)| to_dto(self.signer.as_ref(), name, value))
            .collect()
    }

    /// One attempt: carried counters plus `batch`.
    ///
    /// The attempt's counters are carried before the publish is awaited, so
    /// dropping this future mid-flight loses nothing.
    async fn deliver(&mut self, batch: MetricSet) -> Result<(), PublishError> {
        let mut attempt = self.carried.clone();
        attempt.merge_set(batch);
        if attempt.is_empty() {
            return Ok(());
        }
        self.carried = attempt.counters();

        let dtos = self.encode(&attempt);
        let transport = self.publisher.transport();
        let started = std::time::Instant::now();
        let result = self
            .publisher
            .publish(&dtos)
            .instrument(publish_span(self.id, transport, dtos.len()))
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .record_publish(transport, dtos.len(), elapsed_ms, result.is_ok());

        match &result {
            Ok(()) => {
                self.carried.clear();
                debug!(worker = self.id, batch = dtos.len(), "Batch delivered");
            }
            Err(e) => {
                warn!(
                    worker = self.id,
                    batch = dtos.len(),
                    carried = self.carried.len(),
                    error = %e,
                    "Delivery failed"
                );
            }
        }
        self.metrics.record_carried(self.id, self.carried.len());
        result
    }

    /// Retry carried counters every `drain_interval` until they are
    /// delivered or `shutdown_timeout` runs out. An attempt still in flight
    /// at the deadline is cut off; its counters stay carried.
    async fn drain(&mut self) {
        if self.carried.is_empty() {
            return;
        }
        info!(worker = self.id, carried = self.carried.len(), "Draining failed counters");

        let deadline = Instant::now() + self.shutdown_timeout;
        while !self.carried.is_empty() {
            let wake = Instant::now() + self.drain_interval;
            if wake >= deadline {
                break;
            }
            tokio::time::sleep_until(wake).await;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, self.deliver(MetricSet::new())).await.is_err() {
                warn!(worker = self.id, "Delivery still in flight at shutdown timeout");
                break;
            }
        }

        if !self.carried.is_empty() {
            warn!(
                worker = self.id,
                undelivered = self.carried.len(),
                "Shutdown timeout reached with undelivered counters"
            );
        }
    }
}
