use super::{Storage, StorageError, StorageResult};
use crate::metric::{MetricKind, MetricValue, StorageItem};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, instrument};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS metrics (
    id    TEXT    NOT NULL,
    kind  TEXT    NOT NULL,
    value REAL,
    delta INTEGER,
    PRIMARY KEY (id, kind)
)
"#;

const UPSERT_GAUGE: &str = r#"
INSERT INTO metrics (id, kind, value) VALUES (?, 'gauge', ?)
ON CONFLICT (id, kind) DO UPDATE SET value = excluded.value
RETURNING value
"#;

const UPSERT_COUNTER: &str = r#"
INSERT INTO metrics (id, kind, delta) VALUES (?, 'counter', ?)
ON CONFLICT (id, kind) DO UPDATE SET delta = CASE
    WHEN metrics.delta > 9223372036854775807 - excluded.delta THEN 9223372036854775807
    ELSE metrics.delta + excluded.delta
END
RETURNING delta
"#;

/// SQLite-backed store.
///
/// Counter accumulation happens inside the upsert, so concurrent writers of
/// the same name never lose an update and writers of different names never
/// contend on an application lock.
#[derive(Clone)]
pub struct SqlStorage {
    pool: SqlitePool,
}

fn is_memory(dsn: &str) -> bool {
    matches!(dsn, ":memory:" | "sqlite::memory:" | "sqlite://:memory:")
}

impl SqlStorage {
    /// Connect and create the table if needed. Accepts `sqlite://` URLs and
    /// plain file paths.
    #[instrument(skip(dsn))]
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(dsn)?.create_if_missing(true);

        // Every connection to `:memory:` is its own database, and closing
        // the only one discards it
        let pool = if is_memory(dsn) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(options)
        .await?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        debug!("metrics table ready");
        Ok(SqlStorage { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn upsert<'e, E>(executor: E, item: &StorageItem) -> StorageResult<MetricValue>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        match item.value {
            MetricValue::Gauge(value) => {
                let stored: f64 = sqlx::query_scalar(UPSERT_GAUGE)
                    .bind(&item.name)
                    .bind(value)
                    .fetch_one(executor)
                    .await?;
                Ok(MetricValue::Gauge(stored))
            }
            MetricValue::Counter(delta) => {
                let total: i64 = sqlx::query_scalar(UPSERT_COUNTER)
                    .bind(&item.name)
                    .bind(delta)
                    .fetch_one(executor)
                    .await?;
                Ok(MetricValue::Counter(total))
            }
        }
    }
}

#[async_trait]
impl Storage for SqlStorage {
    async fn set(&self, item: &StorageItem) -> StorageResult<MetricValue> {
        Self::upsert(&self.pool, item).await
    }

    async fn get(&self, kind: MetricKind, name: &str) -> StorageResult<MetricValue> {
        let not_found = || StorageError::NotFound {
            kind,
            name: name.to_string(),
        };
        match kind {
            MetricKind::Gauge => {
                let value: Option<f64> =
                    sqlx::query_scalar("SELECT value FROM metrics WHERE id = ? AND kind = 'gauge'")
                        .bind(name)
                        .fetch_optional(&self.pool)
                        .await?;
                value.map(MetricValue::Gauge).ok_or_else(not_found)
            }
            MetricKind::Counter => {
                let total: Option<i64> = sqlx::query_scalar(
                    "SELECT delta FROM metrics WHERE id = ? AND kind = 'counter'",
                )
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
                total.map(MetricValue::Counter).ok_or_else(not_found)
            }
        }
    }

    /// Upserts run one after another; a failure part-way leaves the earlier
    /// writes in place.
    async fn set_metrics(&self, batch: &[StorageItem]) -> StorageResult<Vec<StorageItem>> {
        let mut stored = Vec::with_capacity(batch.len());
        for item in batch {
            let value = Self::upsert(&self.pool, item).await?;
            stored.push(StorageItem::new(item.name.clone(), value));
        }
        Ok(stored)
    }

    async fn get_all(&self) -> StorageResult<Vec<StorageItem>> {
        // 'gauge' > 'counter' lexically, so order kinds explicitly
        let rows = sqlx::query(
            r#"
            SELECT id, kind, value, delta FROM metrics
            ORDER BY CASE kind WHEN 'gauge' THEN 0 ELSE 1 END, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let kind: String = row.try_get("kind")?;
            let value = match kind.parse::<MetricKind>() {
                Ok(MetricKind::Gauge) => MetricValue::Gauge(row.try_get::<f64, _>("value")?),
                Ok(MetricKind::Counter) => MetricValue::Counter(row.try_get::<i64, _>("delta")?),
                Err(_) => {
                    return Err(StorageError::Backend(format!(
                        "unexpected kind {:?} for {:?}",
                        kind, id
                    )))
                }
            };
            items.push(StorageItem::new(id, value));
        }
        Ok(items)
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_semantics_in_memory() {
        let storage = SqlStorage::connect("sqlite::memory:").await.unwrap();
        assert_eq!(storage.set_counter("PollCount", 5).await.unwrap(), 5);
        assert_eq!(storage.set_counter("PollCount", 5).await.unwrap(), 10);
        assert_eq!(storage.set_gauge("Sys", 1.0).await.unwrap(), 1.0);
        assert_eq!(storage.set_gauge("Sys", 13220880.0).await.unwrap(), 13220880.0);

        assert_eq!(storage.get_counter("PollCount").await.unwrap(), 10);
        assert_eq!(storage.get_gauge("Sys").await.unwrap(), 13220880.0);
        assert!(matches!(
            storage.get_gauge("PollCount").await,
            Err(StorageError::NotFound { .. })
        ));
        storage.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_all_orders_gauges_first() {
        let storage = SqlStorage::connect(":memory:").await.unwrap();
        storage.set_counter("a", 1).await.unwrap();
        storage.set_gauge("b", 2.0).await.unwrap();

        let all = storage.get_all().await.unwrap();
        assert_eq!(all[0], StorageItem::new("b", MetricValue::Gauge(2.0)));
        assert_eq!(all[1], StorageItem::new("a", MetricValue::Counter(1)));
    }

    #[tokio::test]
    async fn test_memory_connection_is_never_recycled() {
        let storage = SqlStorage::connect(":memory:").await.unwrap();
        let options = storage.pool().options();
        assert_eq!(options.get_max_connections(), 1);
        assert_eq!(options.get_idle_timeout(), None);
        assert_eq!(options.get_max_lifetime(), None);
    }
}
