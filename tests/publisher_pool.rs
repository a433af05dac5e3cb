//! Publisher pool delivery guarantees against a live HTTP server

use async_trait::async_trait;
use metrics_pipeline::agent::{HttpPublisher, PublishError, Publisher, PublisherPool};
use metrics_pipeline::config::{AgentConfig, ServerConfig};
use metrics_pipeline::metric::{MetricDto, MetricSet, MetricValue};
use metrics_pipeline::observability::simulated_metrics;
use metrics_pipeline::storage::{MemStorage, Storage};
use metrics_pipeline::MetricsServer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// Drops the first `failures` attempts on the floor, forwards the rest
struct Flaky {
    inner: HttpPublisher,
    failures: AtomicUsize,
}

#[async_trait]
impl Publisher for Flaky {
    async fn publish(&self, batch: &[MetricDto]) -> Result<(), PublishError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PublishError::Network("connection refused".into()));
        }
        self.inner.publish(batch).await
    }

    fn transport(&self) -> &'static str {
        "flaky"
    }
}

async fn start_server(key: &str) -> (AgentConfig, MemStorage, CancellationToken) {
    let storage = MemStorage::new();
    let server = MetricsServer::new(
        ServerConfig::default().with_key(key),
        Arc::new(storage.clone()),
    )
    .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(server.serve(listener, None, cancel.clone()));

    let agent = AgentConfig::default()
        .with_address(addr.to_string())
        .with_key(key)
        .with_rate_limit(1)
        .with_drain_interval(Duration::from_millis(20))
        .with_shutdown_timeout(Duration::from_secs(5));
    (agent, storage, cancel)
}

fn set(entries: &[(&str, MetricValue)]) -> MetricSet {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

#[tokio::test]
async fn test_failed_counters_are_delivered_once() {
    let (config, storage, cancel) = start_server("foobar").await;
    storage.set_counter("a", 100).await.unwrap();

    let publisher = Arc::new(Flaky {
        inner: HttpPublisher::new(&config, None, None).unwrap(),
        failures: AtomicUsize::new(1),
    });
    let metrics = simulated_metrics();
    let (tx, rx) = mpsc::channel(1);
    let pool = PublisherPool::new(publisher, &config)
        .with_metrics(metrics.clone())
        .spawn(rx);

    tx.send(set(&[
        ("a", MetricValue::Counter(3)),
        ("b", MetricValue::Counter(5)),
        ("g", MetricValue::Gauge(7.0)),
    ]))
    .await
    .unwrap();
    tx.send(set(&[("a", MetricValue::Counter(2))])).await.unwrap();
    drop(tx);

    let reports = pool.join().await;
    assert!(reports.iter().all(|r| r.undelivered.is_empty()));

    assert_eq!(storage.get_counter("a").await.unwrap(), 105);
    assert_eq!(storage.get_counter("b").await.unwrap(), 5);
    // Gauges from a failed attempt are not retried
    assert!(storage.get_gauge("g").await.is_err());

    assert_eq!(metrics.publish_failures(), 1);
    assert_eq!(metrics.publish_successes(), 1);
    assert_eq!(metrics.last_carried(0), Some(0.0));
    cancel.cancel();
}

#[tokio::test]
async fn test_channel_close_drains_carried_counters() {
    let (config, storage, cancel) = start_server("foobar").await;
    let publisher = Arc::new(Flaky {
        inner: HttpPublisher::new(&config, None, None).unwrap(),
        failures: AtomicUsize::new(3),
    });

    let (tx, rx) = mpsc::channel(1);
    let pool = PublisherPool::new(publisher, &config).spawn(rx);
    tx.send(set(&[("PollCount", MetricValue::Counter(4))]))
        .await
        .unwrap();
    drop(tx);

    let reports = pool.join().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].undelivered.is_empty());
    assert_eq!(storage.get_counter("PollCount").await.unwrap(), 4);
    cancel.cancel();
}

#[tokio::test]
async fn test_drain_stops_at_shutdown_timeout() {
    let config = AgentConfig::default()
        .with_address("127.0.0.1:9")
        .with_drain_interval(Duration::from_millis(10))
        .with_shutdown_timeout(Duration::from_millis(50));
    let publisher = Arc::new(Flaky {
        inner: HttpPublisher::new(&config, None, None).unwrap(),
        failures: AtomicUsize::new(usize::MAX),
    });

    let (tx, rx) = mpsc::channel(1);
    let pool = PublisherPool::new(publisher, &config).spawn(rx);
    tx.send(set(&[("a", MetricValue::Counter(1))])).await.unwrap();
    drop(tx);

    let reports = pool.join().await;
    assert_eq!(
        reports[0].undelivered.get("a"),
        Some(&MetricValue::Counter(1))
    );
}

/// Refuses the first attempt, then never answers
struct Stalling {
    attempts: AtomicUsize,
}

#[async_trait]
impl Publisher for Stalling {
    async fn publish(&self, _batch: &[MetricDto]) -> Result<(), PublishError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(PublishError::Network("connection refused".into()));
        }
        std::future::pending::<()>().await;
        Ok(())
    }

    fn transport(&self) -> &'static str {
        "stalling"
    }
}

#[tokio::test]
async fn test_stalled_delivery_at_shutdown_keeps_counters() {
    let config = AgentConfig::default()
        .with_drain_interval(Duration::from_millis(10))
        .with_shutdown_timeout(Duration::from_millis(100));
    let publisher = Arc::new(Stalling {
        attempts: AtomicUsize::new(0),
    });

    let (tx, rx) = mpsc::channel(1);
    let pool = PublisherPool::new(publisher.clone(), &config).spawn(rx);
    tx.send(set(&[
        ("a", MetricValue::Counter(7)),
        ("g", MetricValue::Gauge(1.0)),
    ]))
    .await
    .unwrap();
    drop(tx);

    let reports = tokio::time::timeout(Duration::from_secs(5), pool.join())
        .await
        .expect("pool must stop at the shutdown timeout");
    assert_eq!(
        reports[0].undelivered.get("a"),
        Some(&MetricValue::Counter(7))
    );
    assert!(reports[0].undelivered.get("g").is_none());
    assert_eq!(publisher.attempts.load(Ordering::SeqCst), 2);
}

/// Holds every attempt until released
struct Gate {
    release: Notify,
    started: Notify,
}

#[async_trait]
impl Publisher for Gate {
    async fn publish(&self, _batch: &[MetricDto]) -> Result<(), PublishError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }

    fn transport(&self) -> &'static str {
        "gate"
    }
}

#[tokio::test]
async fn test_full_channel_applies_backpressure() {
    let config = AgentConfig::default().with_rate_limit(1);
    let gate = Arc::new(Gate {
        release: Notify::new(),
        started: Notify::new(),
    });

    let (tx, rx) = mpsc::channel(config.rate_limit);
    let pool = PublisherPool::new(gate.clone(), &config).spawn(rx);

    tx.send(set(&[("a", MetricValue::Counter(1))])).await.unwrap();
    gate.started.notified().await;

    // The only worker is busy; one batch fits in the buffer, the next does not
    tx.try_send(set(&[("a", MetricValue::Counter(1))])).unwrap();
    assert!(matches!(
        tx.try_send(set(&[("a", MetricValue::Counter(1))])),
        Err(mpsc::error::TrySendError::Full(_))
    ));

    gate.release.notify_one();
    gate.started.notified().await;
    gate.release.notify_one();
    drop(tx);
    pool.join().await;
}
