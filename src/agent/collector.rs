//! Metric sampling and the poll/report loop

use crate::metric::{MetricSet, MetricValue};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Produces one snapshot of named values per poll
pub trait MetricSource: Send + 'static {
    fn sample(&mut self) -> MetricSet;
}

/// Process metrics available without extra dependencies
pub struct RuntimeSource {
    started: Instant,
}

impl RuntimeSource {
    pub fn new() -> Self {
        RuntimeSource {
            started: Instant::now(),
        }
    }
}

impl Default for RuntimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for RuntimeSource {
    fn sample(&mut self) -> MetricSet {
        let mut set = MetricSet::new();
        set.insert("PollCount", MetricValue::Counter(1));
        set.insert("RandomValue", MetricValue::Gauge(rand::random::<f64>()));
        set.insert(
            "Uptime",
            MetricValue::Gauge(self.started.elapsed().as_secs_f64()),
        );
        if let Some((virt, resident)) = read_statm() {
            set.insert("VirtualMemory", MetricValue::Gauge(virt));
            set.insert("ResidentMemory", MetricValue::Gauge(resident));
        }
        set
    }
}

/// `(virtual, resident)` bytes of this process; Linux only
fn read_statm() -> Option<(f64, f64)> {
    let raw = std::fs::read_to_string("/proc/self/statm").ok()?;
    parse_statm(&raw, 4096)
}

fn parse_statm(raw: &str, page_size: u64) -> Option<(f64, f64)> {
    let mut fields = raw.split_whitespace();
    let size: u64 = fields.next()?.parse().ok()?;
    let resident: u64 = fields.next()?.parse().ok()?;
    Some(((size * page_size) as f64, (resident * page_size) as f64))
}

/// Samples on every poll tick and hands the accumulated set to the publisher
/// channel on every report tick
pub struct Collector {
    source: Box<dyn MetricSource>,
    poll_interval: Duration,
    report_interval: Duration,
    pending: MetricSet,
}

impl Collector {
    pub fn new(
        source: Box<dyn MetricSource>,
        poll_interval: Duration,
        report_interval: Duration,
    ) -> Self {
        Collector {
            source,
            poll_interval,
            report_interval,
            pending: MetricSet::new(),
        }
    }

    /// Run until `cancel` fires or every receiver is gone. Dropping the
    /// sender on return closes the channel.
    pub async fn run(mut self, tx: mpsc::Sender<MetricSet>, cancel: CancellationToken) {
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = interval_at(
            tokio::time::Instant::now() + self.report_interval,
            self.report_interval,
        );
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            report_ms = self.report_interval.as_millis() as u64,
            "Collector started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = report.tick() => {
                    if self.pending.is_empty() {
                        continue;
                    }
                    debug!(metrics = self.pending.len(), "Report tick");
                    // Waits for a slot while every worker is busy and the
                    // buffer is full; the batch stays pending until it has one
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        permit = tx.reserve() => match permit {
                            Ok(permit) => permit.send(std::mem::take(&mut self.pending)),
                            Err(_) => {
                                warn!("Publisher pool is gone; collector stopping");
                                return;
                            }
                        },
                    }
                }
                _ = poll.tick() => {
                    let sample = self.source.sample();
                    self.pending.merge_set(sample);
                }
            }
        }

        // Final hand-off only if it does not block shutdown
        if !self.pending.is_empty() {
            let batch = std::mem::take(&mut self.pending);
            let metrics = batch.len();
            if tx.try_send(batch).is_err() {
                warn!(metrics, "Dropped final batch at shutdown");
            }
        }
        info!("Collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ticks;

    impl MetricSource for Ticks {
        fn sample(&mut self) -> MetricSet {
            let mut set = MetricSet::new();
            set.insert("PollCount", MetricValue::Counter(1));
            set.insert("Last", MetricValue::Gauge(1.0));
            set
        }
    }

    #[test]
    fn test_runtime_source_sample() {
        let mut source = RuntimeSource::new();
        let set = source.sample();
        assert_eq!(set.get("PollCount"), Some(&MetricValue::Counter(1)));
        assert!(matches!(set.get("RandomValue"), Some(MetricValue::Gauge(_))));
        assert!(matches!(set.get("Uptime"), Some(MetricValue::Gauge(_))));
    }

    #[test]
    fn test_parse_statm() {
        assert_eq!(
            parse_statm("100 25 10 1 0 40 0\n", 4096),
            Some((409600.0, 102400.0))
        );
        assert_eq!(parse_statm("garbage", 4096), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_accumulate_into_one_report() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let collector = Collector::new(
            Box::new(Ticks),
            Duration::from_millis(100),
            Duration::from_millis(1000),
        );
        let handle = tokio::spawn(collector.run(tx, cancel.clone()));

        let batch = rx.recv().await.unwrap();
        // Polls at 0, 100, ..., 900 ms land before the first report at 1 s
        assert_eq!(batch.get("PollCount"), Some(&MetricValue::Counter(10)));
        assert_eq!(batch.get("Last"), Some(&MetricValue::Gauge(1.0)));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_closes_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let collector = Collector::new(
            Box::new(Ticks),
            Duration::from_millis(10),
            Duration::from_secs(60),
        );
        let handle = tokio::spawn(collector.run(tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(35)).await;
        cancel.cancel();
        handle.await.unwrap();

        // Pending polls are handed off once, then the channel is closed
        let last = rx.recv().await.unwrap();
        assert_eq!(last.get("PollCount"), Some(&MetricValue::Counter(4)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_blocked_keeps_report() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(MetricSet::new()).unwrap();

        let cancel = CancellationToken::new();
        let collector = Collector::new(
            Box::new(Ticks),
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        let handle = tokio::spawn(collector.run(tx, cancel.clone()));

        // Past the first report tick; the collector waits for a free slot
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        assert!(rx.recv().await.unwrap().is_empty());
        handle.await.unwrap();

        let report = rx.recv().await.unwrap();
        assert_eq!(report.get("PollCount"), Some(&MetricValue::Counter(10)));
        assert!(rx.recv().await.is_none());
    }
}
