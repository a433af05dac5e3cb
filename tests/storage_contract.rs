//! The same contract checked against every storage backend

use metrics_pipeline::config::ServerConfig;
use metrics_pipeline::metric::{MetricKind, MetricValue, StorageItem};
use metrics_pipeline::storage::{open_storage, MemStorage, SqlStorage, Storage, StorageError};
use std::sync::Arc;

async fn backends(dir: &tempfile::TempDir) -> Vec<Arc<dyn Storage>> {
    let dsn = format!("sqlite://{}", dir.path().join("metrics.db").display());
    vec![
        Arc::new(MemStorage::new()),
        Arc::new(SqlStorage::connect(&dsn).await.unwrap()),
    ]
}

#[tokio::test]
async fn test_gauge_replace_and_counter_accumulate() {
    let dir = tempfile::tempdir().unwrap();
    for storage in backends(&dir).await {
        let name = storage.backend_name();

        storage.set_gauge("g", 1.0).await.unwrap();
        storage.set_gauge("g", 2.5).await.unwrap();
        assert_eq!(storage.get_gauge("g").await.unwrap(), 2.5, "{}", name);

        assert_eq!(storage.set_counter("c", 3).await.unwrap(), 3, "{}", name);
        assert_eq!(storage.set_counter("c", 4).await.unwrap(), 7, "{}", name);
        assert_eq!(storage.get_counter("c").await.unwrap(), 7, "{}", name);

        // Same name, other kind, is a separate record
        storage.set_counter("g", 1).await.unwrap();
        assert_eq!(storage.get_gauge("g").await.unwrap(), 2.5, "{}", name);
        assert_eq!(storage.get_counter("g").await.unwrap(), 1, "{}", name);

        assert!(
            matches!(
                storage.get(MetricKind::Gauge, "missing").await,
                Err(StorageError::NotFound { .. })
            ),
            "{}",
            name
        );
        storage.ping().await.unwrap();
    }
}

#[tokio::test]
async fn test_counter_saturates_at_max() {
    let dir = tempfile::tempdir().unwrap();
    for storage in backends(&dir).await {
        let name = storage.backend_name();

        assert_eq!(storage.set_counter("big", i64::MAX).await.unwrap(), i64::MAX, "{}", name);
        assert_eq!(storage.set_counter("big", 1).await.unwrap(), i64::MAX, "{}", name);
        assert_eq!(storage.get_counter("big").await.unwrap(), i64::MAX, "{}", name);

        let all = storage.get_all().await.unwrap();
        assert!(
            all.contains(&StorageItem::new("big", MetricValue::Counter(i64::MAX))),
            "{}",
            name
        );
    }
}

#[tokio::test]
async fn test_batch_and_snapshot_order() {
    let dir = tempfile::tempdir().unwrap();
    for storage in backends(&dir).await {
        let name = storage.backend_name();
        let batch = vec![
            StorageItem::new("z", MetricValue::Counter(1)),
            StorageItem::new("b", MetricValue::Gauge(1.0)),
            StorageItem::new("z", MetricValue::Counter(2)),
            StorageItem::new("a", MetricValue::Gauge(3.0)),
        ];

        let stored = storage.set_metrics(&batch).await.unwrap();
        assert_eq!(stored[2], StorageItem::new("z", MetricValue::Counter(3)), "{}", name);

        let all = storage.get_all().await.unwrap();
        assert_eq!(
            all,
            vec![
                StorageItem::new("a", MetricValue::Gauge(3.0)),
                StorageItem::new("b", MetricValue::Gauge(1.0)),
                StorageItem::new("z", MetricValue::Counter(3)),
            ],
            "{}",
            name
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_counters_lose_nothing() {
    let dir = tempfile::tempdir().unwrap();
    for storage in backends(&dir).await {
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let storage = storage.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    storage.set_counter("shared", 2).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(
            storage.get_counter("shared").await.unwrap(),
            8 * 25 * 2,
            "{}",
            storage.backend_name()
        );
    }
}

#[tokio::test]
async fn test_factory_picks_backend_from_dsn() {
    let dir = tempfile::tempdir().unwrap();

    let memory = open_storage(&ServerConfig::default()).await.unwrap();
    assert_eq!(memory.backend_name(), "memory");

    let dsn = format!("sqlite://{}", dir.path().join("factory.db").display());
    let sql = open_storage(&ServerConfig::default().with_database_dsn(dsn.clone()))
        .await
        .unwrap();
    assert_eq!(sql.backend_name(), "sqlite");
    sql.set_counter("persisted", 9).await.unwrap();
    drop(sql);

    // Reopening the same file keeps the data
    let reopened = SqlStorage::connect(&dsn).await.unwrap();
    assert_eq!(reopened.get_counter("persisted").await.unwrap(), 9);
}
