//! Metrics Recorder Trait
//!
//! The pipeline's own health metrics go through this trait so components
//! never depend on a concrete client:
//! - Production: DogStatsD (`datadog` feature)
//! - Tests: in-memory recording with assertion helpers

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for recording self-metrics
pub trait MetricsRecorder: Send + Sync + 'static {
    /// Increment a counter by 1
    fn incr(&self, name: &str, tags: &[&str]);

    /// Record a histogram/distribution value
    fn histogram(&self, name: &str, value: f64, tags: &[&str]);

    /// Set a gauge value
    fn gauge(&self, name: &str, value: f64, tags: &[&str]);

    /// Record a timing in milliseconds
    fn timing(&self, name: &str, duration_ms: f64, tags: &[&str]);

    /// One delivery attempt by a publisher worker
    fn record_publish(&self, transport: &str, batch: usize, duration_ms: f64, success: bool) {
        let transport_tag = format!("transport:{}", transport);
        let status_tag = format!("status:{}", if success { "success" } else { "error" });

        self.timing("publish.duration", duration_ms, &[&transport_tag, &status_tag]);
        self.histogram("publish.batch_size", batch as f64, &[&transport_tag]);
        self.incr("publish.count", &[&transport_tag, &status_tag]);
    }

    /// Size of a worker's carried failed-counter set after an attempt
    fn record_carried(&self, worker: usize, counters: usize) {
        let worker_tag = format!("worker:{}", worker);
        self.gauge("publish.carried_counters", counters as f64, &[&worker_tag]);
    }

    /// One ingestion request that reached storage
    fn record_ingest(&self, route: &str, items: usize, duration_ms: f64) {
        let route_tag = format!("route:{}", route);
        self.timing("ingest.duration", duration_ms, &[&route_tag]);
        self.histogram("ingest.items", items as f64, &[&route_tag]);
    }

    /// A request or batch item rejected before or during storage
    fn record_rejection(&self, reason: &str) {
        let reason_tag = format!("reason:{}", reason);
        self.incr("ingest.rejected", &[&reason_tag]);
    }
}

/// No-op metrics recorder
#[derive(Clone, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    #[inline]
    fn incr(&self, _name: &str, _tags: &[&str]) {}
    #[inline]
    fn histogram(&self, _name: &str, _value: f64, _tags: &[&str]) {}
    #[inline]
    fn gauge(&self, _name: &str, _value: f64, _tags: &[&str]) {}
    #[inline]
    fn timing(&self, _name: &str, _duration_ms: f64, _tags: &[&str]) {}
}

#[derive(Debug, Clone)]
pub struct RecordedMetric {
    pub name: String,
    pub value: f64,
    pub tags: Vec<String>,
    pub metric_type: MetricType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
    Timing,
}

/// Records everything in memory for assertions
#[derive(Default)]
pub struct SimulatedMetrics {
    recorded: Mutex<Vec<RecordedMetric>>,
    publish_success: AtomicU64,
    publish_failure: AtomicU64,
    ingested_items: AtomicU64,
    rejections: AtomicU64,
}

impl SimulatedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_recorded(&self) -> Vec<RecordedMetric> {
        self.recorded.lock().clone()
    }

    pub fn get_by_name(&self, name: &str) -> Vec<RecordedMetric> {
        self.recorded
            .lock()
            .iter()
            .filter(|m| m.name == name)
            .cloned()
            .collect()
    }

    pub fn publish_successes(&self) -> u64 {
        self.publish_success.load(Ordering::SeqCst)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failure.load(Ordering::SeqCst)
    }

    pub fn ingested_items(&self) -> u64 {
        self.ingested_items.load(Ordering::SeqCst)
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::SeqCst)
    }

    /// Latest carried-counter gauge reported by `worker`
    pub fn last_carried(&self, worker: usize) -> Option<f64> {
        let worker_tag = format!("worker:{}", worker);
        self.recorded
            .lock()
            .iter()
            .rev()
            .find(|m| m.name == "publish.carried_counters" && m.tags.contains(&worker_tag))
            .map(|m| m.value)
    }

    pub fn clear(&self) {
        self.recorded.lock().clear();
        self.publish_success.store(0, Ordering::SeqCst);
        self.publish_failure.store(0, Ordering::SeqCst);
        self.ingested_items.store(0, Ordering::SeqCst);
        self.rejections.store(0, Ordering::SeqCst);
    }

    pub fn assert_metric(&self, name: &str, metric_type: MetricType) -> bool {
        self.recorded
            .lock()
            .iter()
            .any(|m| m.name == name && m.metric_type == metric_type)
    }

    fn push(&self, name: &str, value: f64, tags: &[&str], metric_type: MetricType) {
        self.recorded.lock().push(RecordedMetric {
            name: name.to_string(),
            value,
            tags: tags.iter().map(|s| s.to_string()).collect(),
            metric_type,
        });
    }
}

impl MetricsRecorder for SimulatedMetrics {
    fn incr(&self, name: &str, tags: &[&str]) {
        self.push(name, 1.0, tags, MetricType::Counter);
    }

    fn histogram(&self, name: &str, value: f64, tags: &[&str]) {
        self.push(name, value, tags, MetricType::Histogram);
    }

    fn gauge(&self, name: &str, value: f64, tags: &[&str]) {
        self.push(name, value, tags, MetricType::Gauge);
    }

    fn timing(&self, name: &str, duration_ms: f64, tags: &[&str]) {
        self.push(name, duration_ms, tags, MetricType::Timing);
    }

    fn record_publish(&self, transport: &str, batch: usize, duration_ms: f64, success: bool) {
        if success {
            self.publish_success.fetch_add(1, Ordering::SeqCst);
        } else {
            self.publish_failure.fetch_add(1, Ordering::SeqCst);
        }
        let transport_tag = format!("transport:{}", transport);
        let status_tag = format!("status:{}", if success { "success" } else { "error" });
        self.timing("publish.duration", duration_ms, &[&transport_tag, &status_tag]);
        self.histogram("publish.batch_size", batch as f64, &[&transport_tag]);
        self.incr("publish.count", &[&transport_tag, &status_tag]);
    }

    fn record_ingest(&self, route: &str, items: usize, duration_ms: f64) {
        self.ingested_items.fetch_add(items as u64, Ordering::SeqCst);
        let route_tag = format!("route:{}", route);
        self.timing("ingest.duration", duration_ms, &[&route_tag]);
        self.histogram("ingest.items", items as f64, &[&route_tag]);
    }

    fn record_rejection(&self, reason: &str) {
        self.rejections.fetch_add(1, Ordering::SeqCst);
        let reason_tag = format!("reason:{}", reason);
        self.incr("ingest.rejected", &[&reason_tag]);
    }
}

/// Arc wrapper for trait object usage
pub type SharedMetrics = Arc<dyn MetricsRecorder>;

pub fn noop_metrics() -> SharedMetrics {
    Arc::new(NoopMetrics)
}

pub fn simulated_metrics() -> Arc<SimulatedMetrics> {
    Arc::new(SimulatedMetrics::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_metrics_records() {
        let metrics = SimulatedMetrics::new();

        metrics.incr("test.counter", &["tag:value"]);
        metrics.histogram("test.histogram", 42.0, &[]);
        metrics.gauge("test.gauge", 100.0, &[]);
        metrics.timing("test.timing", 5.5, &[]);

        assert_eq!(metrics.get_recorded().len(), 4);
        assert!(metrics.assert_metric("test.counter", MetricType::Counter));
        assert!(metrics.assert_metric("test.timing", MetricType::Timing));
    }

    #[test]
    fn test_publish_tracking() {
        let metrics = SimulatedMetrics::new();

        metrics.record_publish("http", 10, 1.0, true);
        metrics.record_publish("http", 10, 1.0, false);
        metrics.record_publish("grpc", 3, 0.5, true);

        assert_eq!(metrics.publish_successes(), 2);
        assert_eq!(metrics.publish_failures(), 1);
        assert_eq!(metrics.get_by_name("publish.count").len(), 3);
    }

    #[test]
    fn test_carried_gauge_is_per_worker() {
        let metrics = SimulatedMetrics::new();

        metrics.record_carried(0, 2);
        metrics.record_carried(1, 7);
        metrics.record_carried(0, 0);

        assert_eq!(metrics.last_carried(0), Some(0.0));
        assert_eq!(metrics.last_carried(1), Some(7.0));
        assert_eq!(metrics.last_carried(2), None);
    }

    #[test]
    fn test_noop_metrics_no_panic() {
        let metrics = NoopMetrics;
        metrics.record_publish("http", 1, 1.0, true);
        metrics.record_carried(0, 1);
        metrics.record_ingest("/updates/", 2, 0.1);
        metrics.record_rejection("hash");
    }

    #[test]
    fn test_clear_metrics() {
        let metrics = SimulatedMetrics::new();
        metrics.record_ingest("/update/", 1, 1.0);
        metrics.record_rejection("type");
        metrics.clear();
        assert_eq!(metrics.ingested_items(), 0);
        assert_eq!(metrics.rejections(), 0);
        assert!(metrics.get_recorded().is_empty());
    }
}
