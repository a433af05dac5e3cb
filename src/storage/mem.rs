use super::{sort_items, Storage, StorageError, StorageResult};
use crate::metric::{MetricKind, MetricValue, StorageItem};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct MemState {
    gauges: HashMap<String, f64>,
    counters: HashMap<String, i64>,
}

impl MemState {
    fn apply(&mut self, item: &StorageItem) -> MetricValue {
        match item.value {
            MetricValue::Gauge(value) => {
                self.gauges.insert(item.name.clone(), value);
                MetricValue::Gauge(value)
            }
            MetricValue::Counter(delta) => {
                let total = self.counters.entry(item.name.clone()).or_insert(0);
                *total = total.saturating_add(delta);
                MetricValue::Counter(*total)
            }
        }
    }
}

/// In-process metric store.
///
/// Every operation takes one coarse lock, so writes to different names
/// serialize.
#[derive(Clone, Default)]
pub struct MemStorage {
    state: Arc<Mutex<MemState>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.gauges.len() + state.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn set(&self, item: &StorageItem) -> StorageResult<MetricValue> {
        Ok(self.state.lock().apply(item))
    }

    async fn get(&self, kind: MetricKind, name: &str) -> StorageResult<MetricValue> {
        let state = self.state.lock();
        let found = match kind {
            MetricKind::Gauge => state.gauges.get(name).copied().map(MetricValue::Gauge),
            MetricKind::Counter => state.counters.get(name).copied().map(MetricValue::Counter),
        };
        found.ok_or_else(|| StorageError::NotFound {
            kind,
            name: name.to_string(),
        })
    }

    async fn set_metrics(&self, batch: &[StorageItem]) -> StorageResult<Vec<StorageItem>> {
        let mut state = self.state.lock();
        Ok(batch
            .iter()
            .map(|item| StorageItem::new(item.name.clone(), state.apply(item)))
            .collect())
    }

    async fn get_all(&self) -> StorageResult<Vec<StorageItem>> {
        let mut items: Vec<StorageItem> = {
            let state = self.state.lock();
            state
                .gauges
                .iter()
                .map(|(name, value)| StorageItem::new(name.clone(), MetricValue::Gauge(*value)))
                .chain(state.counters.iter().map(|(name, total)| {
                    StorageItem::new(name.clone(), MetricValue::Counter(*total))
                }))
                .collect()
        };
        sort_items(&mut items);
        Ok(items)
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gauge_replace() {
        let storage = MemStorage::new();
        assert_eq!(storage.set_gauge("Alloc", 1.5).await.unwrap(), 1.5);
        assert_eq!(storage.set_gauge("Alloc", 2.5).await.unwrap(), 2.5);
        assert_eq!(storage.get_gauge("Alloc").await.unwrap(), 2.5);
    }

    #[tokio::test]
    async fn test_counter_accumulates() {
        let storage = MemStorage::new();
        assert_eq!(storage.set_counter("PollCount", 5).await.unwrap(), 5);
        assert_eq!(storage.set_counter("PollCount", 5).await.unwrap(), 10);
        assert_eq!(storage.get_counter("PollCount").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_same_name_both_kinds() {
        let storage = MemStorage::new();
        storage.set_gauge("x", 1.0).await.unwrap();
        storage.set_counter("x", 2).await.unwrap();
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.get_gauge("x").await.unwrap(), 1.0);
        assert_eq!(storage.get_counter("x").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_metric() {
        let storage = MemStorage::new();
        assert!(matches!(
            storage.get_counter("nope").await,
            Err(StorageError::NotFound { kind: MetricKind::Counter, .. })
        ));
    }

    #[tokio::test]
    async fn test_get_all_sorted() {
        let storage = MemStorage::new();
        storage.set_counter("b", 1).await.unwrap();
        storage.set_gauge("z", 1.0).await.unwrap();
        storage.set_counter("a", 1).await.unwrap();
        storage.set_gauge("c", 1.0).await.unwrap();

        let names: Vec<(MetricKind, String)> = storage
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|item| (item.kind(), item.name))
            .collect();
        assert_eq!(
            names,
            vec![
                (MetricKind::Gauge, "c".to_string()),
                (MetricKind::Gauge, "z".to_string()),
                (MetricKind::Counter, "a".to_string()),
                (MetricKind::Counter, "b".to_string()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_counter_no_lost_updates() {
        let storage = MemStorage::new();
        let mut handles = Vec::new();
        for task in 0..8i64 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    storage.set_counter("hits", task + 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // 250 * (1 + 2 + ... + 8)
        assert_eq!(storage.get_counter("hits").await.unwrap(), 250 * 36);
    }
}
