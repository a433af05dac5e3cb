pub mod agent;
pub mod config;
pub mod metric;
pub mod observability;
pub mod proto;
pub mod security;
pub mod server;
pub mod storage;

pub use agent::{Agent, MetricSource, PublishError, Publisher, PublisherPool};
pub use config::{AgentConfig, ConfigError, ServerConfig, Transport};
pub use metric::{FailedMetric, MetricDto, MetricError, MetricKind, MetricSet, MetricValue, StorageItem};
pub use server::{IngestError, Ingestor, MetricsServer};
pub use storage::{open_storage, MemStorage, SqlStorage, Storage, StorageError};
