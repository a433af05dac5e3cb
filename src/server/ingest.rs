//! Ingestion Endpoint core
//!
//! Protocol-agnostic request handling shared by the HTTP router and the gRPC
//! service. Each operation validates, verifies, touches storage once and
//! reports a typed [`IngestError`] that the transports map to their own
//! status codes.

use crate::metric::{FailedMetric, MetricDto, MetricError, MetricKind, MetricValue, StorageItem};
use crate::observability::{storage_span, SharedMetrics};
use crate::security::signer::to_dto;
use crate::security::{
    trust, CompressionError, EnvelopeError, Opener, Signer, TrustError, TrustedSubnet,
};
use crate::storage::{Storage, StorageError};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn, Instrument};

/// Failure of one ingestion request
#[derive(Debug)]
pub enum IngestError {
    /// Validation or signature failure
    Metric(MetricError),
    /// Read path found nothing
    NotFound { kind: MetricKind, name: String },
    /// Body could not be decompressed, decrypted or parsed
    Unreadable(String),
    /// Origin rejected by the trusted subnet
    PermissionDenied(TrustError),
    /// Backend failure
    Storage(String),
}

impl IngestError {
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            IngestError::Metric(MetricError::UnknownMetricType(_)) => StatusCode::NOT_IMPLEMENTED,
            IngestError::Metric(_) => StatusCode::BAD_REQUEST,
            IngestError::NotFound { .. } => StatusCode::NOT_FOUND,
            IngestError::Unreadable(_) => StatusCode::BAD_REQUEST,
            IngestError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            IngestError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short tag for self-metrics
    pub fn reason(&self) -> &'static str {
        match self {
            IngestError::Metric(MetricError::UnknownMetricType(_)) => "unknown_type",
            IngestError::Metric(MetricError::EmptyMetricName) => "empty_name",
            IngestError::Metric(MetricError::WrongMetricValue(_)) => "wrong_value",
            IngestError::Metric(MetricError::HashCheckFailed(_)) => "hash_mismatch",
            IngestError::NotFound { .. } => "not_found",
            IngestError::Unreadable(_) => "unreadable",
            IngestError::PermissionDenied(_) => "untrusted",
            IngestError::Storage(_) => "storage",
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Metric(e) => write!(f, "{}", e),
            IngestError::NotFound { kind, name } => {
                write!(f, "{} metric {:?} not found", kind, name)
            }
            IngestError::Unreadable(reason) => write!(f, "unreadable body: {}", reason),
            IngestError::PermissionDenied(e) => write!(f, "permission denied: {}", e),
            IngestError::Storage(reason) => write!(f, "storage failure: {}", reason),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<IngestError> for tonic::Status {
    fn from(e: IngestError) -> Self {
        let message = e.to_string();
        match e {
            IngestError::Metric(MetricError::UnknownMetricType(_)) => {
                tonic::Status::unimplemented(message)
            }
            IngestError::Metric(_) | IngestError::Unreadable(_) => {
                tonic::Status::invalid_argument(message)
            }
            IngestError::NotFound { .. } => tonic::Status::not_found(message),
            IngestError::PermissionDenied(_) => tonic::Status::permission_denied(message),
            IngestError::Storage(_) => tonic::Status::internal(message),
        }
    }
}

impl From<MetricError> for IngestError {
    fn from(e: MetricError) -> Self {
        IngestError::Metric(e)
    }
}

impl From<StorageError> for IngestError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { kind, name } => IngestError::NotFound { kind, name },
            StorageError::Backend(reason) => IngestError::Storage(reason),
        }
    }
}

impl From<TrustError> for IngestError {
    fn from(e: TrustError) -> Self {
        IngestError::PermissionDenied(e)
    }
}

impl From<EnvelopeError> for IngestError {
    fn from(e: EnvelopeError) -> Self {
        IngestError::Unreadable(e.to_string())
    }
}

impl From<CompressionError> for IngestError {
    fn from(e: CompressionError) -> Self {
        IngestError::Unreadable(e.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(e: serde_json::Error) -> Self {
        IngestError::Unreadable(e.to_string())
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Shared request handler. Cheap to clone; one instance is built per server
/// and handed to every transport.
#[derive(Clone)]
pub struct Ingestor {
    storage: Arc<dyn Storage>,
    signer: Option<Signer>,
    opener: Option<Arc<Opener>>,
    trusted: Option<TrustedSubnet>,
    metrics: SharedMetrics,
}

impl Ingestor {
    pub fn new(storage: Arc<dyn Storage>, metrics: SharedMetrics) -> Self {
        Ingestor {
            storage,
            signer: None,
            opener: None,
            trusted: None,
            metrics,
        }
    }

    pub fn with_signer(mut self, signer: Option<Signer>) -> Self {
        self.signer = signer;
        self
    }

    pub fn with_opener(mut self, opener: Option<Opener>) -> Self {
        self.opener = opener.map(Arc::new);
        self
    }

    pub fn with_trusted_subnet(mut self, subnet: Option<TrustedSubnet>) -> Self {
        self.trusted = subnet;
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn trusted_subnet(&self) -> Option<&TrustedSubnet> {
        self.trusted.as_ref()
    }

    /// Trust check for a protected operation
    pub fn admit(&self, origin: Option<&str>) -> IngestResult<()> {
        trust::admit(self.trusted.as_ref(), origin).map_err(|e| {
            warn!(origin = origin.unwrap_or("-"), error = %e, "Rejected untrusted caller");
            self.metrics.record_rejection("untrusted");
            IngestError::from(e)
        })
    }

    /// Decrypt a sealed body. Without a private key a sealed body is
    /// unreadable.
    pub fn open(&self, sealed: &[u8]) -> IngestResult<Vec<u8>> {
        let opener = self.opener.as_ref().ok_or_else(|| {
            IngestError::Unreadable("encrypted body but no private key configured".into())
        })?;
        opener.open(sealed).map_err(|e| {
            self.metrics.record_rejection("unreadable");
            IngestError::from(e)
        })
    }

    fn respond(&self, item: &StorageItem) -> MetricDto {
        to_dto(self.signer.as_ref(), &item.name, &item.value)
    }

    fn verify(&self, dto: &MetricDto, value: &MetricValue) -> Result<(), MetricError> {
        match &self.signer {
            Some(signer) => signer.verify_dto(dto, value),
            None => Ok(()),
        }
    }

    fn reject<T>(&self, err: IngestError) -> IngestResult<T> {
        match &err {
            IngestError::NotFound { kind, name } => debug!(%kind, %name, "Metric not found"),
            IngestError::Storage(reason) => error!(reason = %reason, "Storage failure"),
            other => debug!(error = %other, "Rejected request"),
        }
        if !matches!(err, IngestError::NotFound { .. }) {
            self.metrics.record_rejection(err.reason());
        }
        Err(err)
    }

    /// Plain path update, `/update/{type}/{name}/{value}`. Path updates
    /// carry no signature.
    pub async fn update_path(&self, kind: &str, name: &str, raw: &str) -> IngestResult<MetricDto> {
        let started = Instant::now();
        let parsed = parse_path(kind, name)
            .and_then(|kind| MetricValue::parse(kind, raw))
            .map(|value| StorageItem::new(name, value));
        let item = match parsed {
            Ok(item) => item,
            Err(e) => return self.reject(e.into()),
        };
        let stored = match self.store_one(&item).await {
            Ok(stored) => stored,
            Err(e) => return self.reject(e),
        };
        self.metrics.record_ingest("update_path", 1, elapsed_ms(started));
        Ok(self.respond(&stored))
    }

    /// Single JSON update; echoes the post-write value
    pub async fn update_one(&self, dto: MetricDto) -> IngestResult<MetricDto> {
        let started = Instant::now();
        let item = match dto.decode() {
            Ok(item) => item,
            Err(e) => return self.reject(e.into()),
        };
        if let Err(e) = self.verify(&dto, &item.value) {
            return self.reject(e.into());
        }
        let stored = match self.store_one(&item).await {
            Ok(stored) => stored,
            Err(e) => return self.reject(e),
        };
        self.metrics.record_ingest("update", 1, elapsed_ms(started));
        Ok(self.respond(&stored))
    }

    async fn store_one(&self, item: &StorageItem) -> IngestResult<StorageItem> {
        let value = self
            .storage
            .set(item)
            .instrument(storage_span(self.storage.backend_name(), "set"))
            .await?;
        Ok(StorageItem::new(item.name.clone(), value))
    }

    /// Batch update.
    ///
    /// Every entry is validated before anything is written. An unknown type
    /// or a bad signature anywhere rejects the whole request. Entries with an
    /// empty name or a malformed value are returned as failed and skipped.
    /// The remaining entries are written without a transaction; a storage
    /// failure part-way leaves earlier writes in place.
    pub async fn update_batch(&self, batch: Vec<MetricDto>) -> IngestResult<Vec<FailedMetric>> {
        let started = Instant::now();
        let mut valid = Vec::with_capacity(batch.len());
        let mut failed = Vec::new();

        for dto in batch {
            if let Err(e) = dto.metric_kind() {
                return self.reject(e.into());
            }
            let item = match dto.decode() {
                Ok(item) => item,
                Err(e) => {
                    self.metrics.record_rejection(IngestError::Metric(e.clone()).reason());
                    failed.push(FailedMetric::new(dto, e));
                    continue;
                }
            };
            if let Err(e) = self.verify(&dto, &item.value) {
                return self.reject(e.into());
            }
            valid.push(item);
        }

        if !valid.is_empty() {
            let written = self
                .storage
                .set_metrics(&valid)
                .instrument(storage_span(self.storage.backend_name(), "set_metrics"))
                .await;
            if let Err(e) = written {
                return self.reject(e.into());
            }
        }

        if !failed.is_empty() {
            warn!(failed = failed.len(), stored = valid.len(), "Batch partially rejected");
        }
        self.metrics.record_ingest("updates", valid.len(), elapsed_ms(started));
        Ok(failed)
    }

    /// JSON value query; only `id` and `type` are read
    pub async fn value(&self, query: &MetricDto) -> IngestResult<MetricDto> {
        let (kind, name) = match query.key() {
            Ok(key) => key,
            Err(e) => return self.reject(e.into()),
        };
        let item = self.lookup(kind, name).await?;
        Ok(self.respond(&item))
    }

    /// Plain-text value query, `/value/{type}/{name}`
    pub async fn value_path(&self, kind: &str, name: &str) -> IngestResult<MetricValue> {
        let kind = match parse_path(kind, name) {
            Ok(kind) => kind,
            Err(e) => return self.reject(e.into()),
        };
        Ok(self.lookup(kind, name).await?.value)
    }

    async fn lookup(&self, kind: MetricKind, name: &str) -> IngestResult<StorageItem> {
        match self
            .storage
            .get(kind, name)
            .instrument(storage_span(self.storage.backend_name(), "get"))
            .await
        {
            Ok(value) => Ok(StorageItem::new(name, value)),
            Err(e) => self.reject(e.into()),
        }
    }

    pub async fn get_all(&self) -> IngestResult<Vec<StorageItem>> {
        match self
            .storage
            .get_all()
            .instrument(storage_span(self.storage.backend_name(), "get_all"))
            .await
        {
            Ok(items) => Ok(items),
            Err(e) => self.reject(e.into()),
        }
    }

    /// Signed wire form of every stored metric
    pub async fn get_all_dtos(&self) -> IngestResult<Vec<MetricDto>> {
        let items = self.get_all().await?;
        Ok(items.iter().map(|item| self.respond(item)).collect())
    }

    /// Storage reachability; never mutates
    pub async fn ping(&self) -> IngestResult<()> {
        self.storage
            .ping()
            .instrument(storage_span(self.storage.backend_name(), "ping"))
            .await
            .map_err(|e| {
                error!(error = %e, "Storage ping failed");
                IngestError::from(e)
            })
    }
}

/// Path segments are checked type first, then name
fn parse_path(kind: &str, name: &str) -> Result<MetricKind, MetricError> {
    let kind: MetricKind = kind.parse()?;
    if name.is_empty() {
        return Err(MetricError::EmptyMetricName);
    }
    Ok(kind)
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
