//! Storage Engine
//!
//! Key-value contract over `(name, kind)`:
//! - gauges are replaced on write
//! - counters accumulate, and the write returns the new running total
//!
//! Two backends share the contract:
//! - [`MemStorage`]: in-process maps behind one lock
//! - [`SqlStorage`]: SQLite table keyed by `(id, kind)`, accumulation pushed
//!   into an atomic upsert
//!
//! The server builds one backend through [`open_storage`] and hands the same
//! `Arc<dyn Storage>` to every ingestion path.

mod mem;
mod sql;

pub use mem::MemStorage;
pub use sql::SqlStorage;

use crate::config::ServerConfig;
use crate::metric::{MetricKind, MetricValue, StorageItem};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub enum StorageError {
    /// No record for `(name, kind)`
    NotFound { kind: MetricKind, name: String },
    /// Backend I/O or database failure
    Backend(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound { kind, name } => {
                write!(f, "{} metric {:?} not found", kind, name)
            }
            StorageError::Backend(reason) => write!(f, "storage failure: {}", reason),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Apply one write with kind semantics and return the stored value
    async fn set(&self, item: &StorageItem) -> StorageResult<MetricValue>;

    async fn get(&self, kind: MetricKind, name: &str) -> StorageResult<MetricValue>;

    /// Apply a batch. Each key is written atomically; the batch as a whole
    /// is not a transaction. Returns the post-write values in input order.
    async fn set_metrics(&self, batch: &[StorageItem]) -> StorageResult<Vec<StorageItem>>;

    /// Every record, gauges first, then by name
    async fn get_all(&self) -> StorageResult<Vec<StorageItem>>;

    async fn ping(&self) -> StorageResult<()>;

    fn backend_name(&self) -> &'static str;

    async fn set_gauge(&self, name: &str, value: f64) -> StorageResult<f64> {
        match self.set(&StorageItem::new(name, MetricValue::Gauge(value))).await? {
            MetricValue::Gauge(stored) => Ok(stored),
            MetricValue::Counter(_) => Err(kind_mismatch(name)),
        }
    }

    async fn set_counter(&self, name: &str, delta: i64) -> StorageResult<i64> {
        match self.set(&StorageItem::new(name, MetricValue::Counter(delta))).await? {
            MetricValue::Counter(total) => Ok(total),
            MetricValue::Gauge(_) => Err(kind_mismatch(name)),
        }
    }

    async fn get_gauge(&self, name: &str) -> StorageResult<f64> {
        match self.get(MetricKind::Gauge, name).await? {
            MetricValue::Gauge(value) => Ok(value),
            MetricValue::Counter(_) => Err(kind_mismatch(name)),
        }
    }

    async fn get_counter(&self, name: &str) -> StorageResult<i64> {
        match self.get(MetricKind::Counter, name).await? {
            MetricValue::Counter(total) => Ok(total),
            MetricValue::Gauge(_) => Err(kind_mismatch(name)),
        }
    }
}

fn kind_mismatch(name: &str) -> StorageError {
    StorageError::Backend(format!("backend returned the wrong kind for {:?}", name))
}

pub(crate) fn sort_items(items: &mut [StorageItem]) {
    items.sort_by(|a, b| a.kind().cmp(&b.kind()).then_with(|| a.name.cmp(&b.name)));
}

/// Backend chosen by configuration: a database DSN selects SQLite,
/// otherwise metrics live in memory.
pub async fn open_storage(config: &ServerConfig) -> StorageResult<Arc<dyn Storage>> {
    match config.database_dsn.as_deref().filter(|dsn| !dsn.is_empty()) {
        Some(dsn) => {
            let storage = SqlStorage::connect(dsn).await?;
            info!(backend = storage.backend_name(), "Storage opened");
            Ok(Arc::new(storage))
        }
        None => {
            let storage = MemStorage::new();
            info!(backend = storage.backend_name(), "Storage opened");
            Ok(Arc::new(storage))
        }
    }
}
