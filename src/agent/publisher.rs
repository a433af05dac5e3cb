//! Outbound delivery of one signed batch
//!
//! A [`Publisher`] performs a single attempt and reports success or failure;
//! retry policy lives in the pool. Bodies are sealed first (when a public
//! key is configured) and compressed second.

use crate::config::{AgentConfig, Transport};
use crate::metric::{FailedMetric, MetricDto};
use crate::proto::metrics_client::MetricsClient;
use crate::proto::{Metric, UpdateMetricsRequest};
use crate::security::compression::GZIP;
use crate::security::{
    compress, decompress, CompressionError, EnvelopeError, Sealer, ENCRYPTION_HEADER,
    ENCRYPTION_SCHEME, ORIGIN_HEADER,
};
use async_trait::async_trait;
use reqwest::Client;
use std::fmt;
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use tonic::codec::CompressionEncoding;
use tonic::metadata::MetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum PublishError {
    /// Connection, timeout or other transport failure
    Network(String),
    /// Server answered with a non-success status
    Rejected { status: String, message: String },
    Serialization(String),
    Envelope(EnvelopeError),
    Compression(CompressionError),
    Configuration(String),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Network(reason) => write!(f, "network error: {}", reason),
            PublishError::Rejected { status, message } => {
                write!(f, "server rejected batch ({}): {}", status, message)
            }
            PublishError::Serialization(reason) => write!(f, "serialization error: {}", reason),
            PublishError::Envelope(e) => write!(f, "{}", e),
            PublishError::Compression(e) => write!(f, "{}", e),
            PublishError::Configuration(reason) => write!(f, "publisher config: {}", reason),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<EnvelopeError> for PublishError {
    fn from(e: EnvelopeError) -> Self {
        PublishError::Envelope(e)
    }
}

impl From<CompressionError> for PublishError {
    fn from(e: CompressionError) -> Self {
        PublishError::Compression(e)
    }
}

impl From<serde_json::Error> for PublishError {
    fn from(e: serde_json::Error) -> Self {
        PublishError::Serialization(e.to_string())
    }
}

impl From<tonic::Status> for PublishError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Unknown => {
                PublishError::Network(status.to_string())
            }
            code => PublishError::Rejected {
                status: format!("{:?}", code),
                message: status.message().to_string(),
            },
        }
    }
}

/// One delivery attempt of an already-signed batch
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, batch: &[MetricDto]) -> Result<(), PublishError>;

    /// Tag used in logs and self-metrics
    fn transport(&self) -> &'static str;
}

fn log_failed(failed: &[FailedMetric]) {
    if failed.is_empty() {
        return;
    }
    warn!(count = failed.len(), "Server refused part of the batch");
    for entry in failed {
        debug!(id = %entry.metric.id, error = %entry.error, "Refused metric");
    }
}

fn with_scheme(address: &str, tls: bool) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.trim_end_matches('/').to_string()
    } else if tls {
        format!("https://{}", address.trim_end_matches('/'))
    } else {
        format!("http://{}", address.trim_end_matches('/'))
    }
}

/// JSON batch over `POST /updates/`
pub struct HttpPublisher {
    client: Client,
    url: String,
    sealer: Option<Sealer>,
    origin: Option<IpAddr>,
}

impl HttpPublisher {
    pub fn new(
        config: &AgentConfig,
        sealer: Option<Sealer>,
        origin: Option<IpAddr>,
    ) -> Result<Self, PublishError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| {
                PublishError::Configuration(format!("failed to create HTTP client: {}", e))
            })?;
        Ok(HttpPublisher {
            client,
            url: format!("{}/updates/", with_scheme(&config.address, false)),
            sealer,
            origin,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, batch: &[MetricDto]) -> Result<(), PublishError> {
        let mut body = serde_json::to_vec(batch)?;
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::CONTENT_ENCODING, GZIP)
            .header(reqwest::header::ACCEPT_ENCODING, GZIP);

        if let Some(sealer) = &self.sealer {
            body = sealer.seal(&body)?;
            request = request.header(ENCRYPTION_HEADER, ENCRYPTION_SCHEME);
        }
        if let Some(origin) = self.origin {
            request = request.header(ORIGIN_HEADER, origin.to_string());
        }

        let response = request
            .body(compress(&body)?)
            .send()
            .await
            .map_err(|e| PublishError::Network(e.to_string()))?;

        let status = response.status();
        let gzipped = response
            .headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case(GZIP))
            .unwrap_or(false);
        let raw = response
            .bytes()
            .await
            .map_err(|e| PublishError::Network(e.to_string()))?;
        let payload = if gzipped { decompress(&raw)? } else { raw.to_vec() };

        if !status.is_success() {
            return Err(PublishError::Rejected {
                status: status.to_string(),
                message: String::from_utf8_lossy(&payload).trim().to_string(),
            });
        }

        let failed: Vec<FailedMetric> = serde_json::from_slice(&payload)?;
        log_failed(&failed);
        Ok(())
    }

    fn transport(&self) -> &'static str {
        "http"
    }
}

/// Batch over `metrics.v1.Metrics/UpdateMetrics` with gzip compression
pub struct GrpcPublisher {
    client: MetricsClient<Channel>,
    sealer: Option<Sealer>,
    origin: Option<IpAddr>,
}

impl GrpcPublisher {
    /// Connects lazily; must be called inside a tokio runtime
    pub fn new(
        config: &AgentConfig,
        sealer: Option<Sealer>,
        origin: Option<IpAddr>,
    ) -> Result<Self, PublishError> {
        let tls = config.tls_ca.is_some();
        let mut endpoint = Endpoint::from_shared(with_scheme(&config.address, tls))
            .map_err(|e| PublishError::Configuration(e.to_string()))?
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout());

        if let Some(ca) = &config.tls_ca {
            let pem = std::fs::read(ca).map_err(|e| {
                PublishError::Configuration(format!("{}: {}", ca.display(), e))
            })?;
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem)))
                .map_err(|e| PublishError::Configuration(e.to_string()))?;
        }

        Ok(Self::from_channel(endpoint.connect_lazy(), sealer, origin))
    }

    pub fn from_channel(channel: Channel, sealer: Option<Sealer>, origin: Option<IpAddr>) -> Self {
        let client = MetricsClient::new(channel)
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip);
        GrpcPublisher {
            client,
            sealer,
            origin,
        }
    }
}

#[async_trait]
impl Publisher for GrpcPublisher {
    async fn publish(&self, batch: &[MetricDto]) -> Result<(), PublishError> {
        let message = match &self.sealer {
            Some(sealer) => UpdateMetricsRequest {
                metrics: Vec::new(),
                sealed: sealer.seal(&serde_json::to_vec(batch)?)?,
            },
            None => UpdateMetricsRequest {
                metrics: batch.iter().cloned().map(Metric::from).collect(),
                sealed: Vec::new(),
            },
        };

        let mut request = tonic::Request::new(message);
        if let Some(origin) = self.origin {
            let value = MetadataValue::try_from(origin.to_string())
                .map_err(|e| PublishError::Configuration(e.to_string()))?;
            request.metadata_mut().insert(ORIGIN_HEADER, value);
        }

        let mut client = self.client.clone();
        let response = client.update_metrics(request).await?.into_inner();
        let failed: Vec<FailedMetric> = response.failed.into_iter().map(Into::into).collect();
        log_failed(&failed);
        Ok(())
    }

    fn transport(&self) -> &'static str {
        "grpc"
    }
}

/// Address this host uses to reach `address`, found by "connecting" a UDP
/// socket. No packet is sent.
pub fn detect_origin(address: &str) -> Option<IpAddr> {
    let target = address
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(target).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}

/// Transport chosen by configuration, with envelope and origin resolved
pub fn build_publisher(config: &AgentConfig) -> Result<Arc<dyn Publisher>, PublishError> {
    let sealer = config.crypto_key.as_ref().map(Sealer::from_file).transpose()?;
    let origin = config.origin_ip.or_else(|| {
        let detected = detect_origin(&config.address);
        if detected.is_none() {
            warn!(address = %config.address, "Could not detect origin IP");
        }
        detected
    });
    info!(
        transport = ?config.transport,
        address = %config.address,
        encrypted = sealer.is_some(),
        origin = ?origin,
        "Publisher configured"
    );

    Ok(match config.transport {
        Transport::Http => Arc::new(HttpPublisher::new(config, sealer, origin)?),
        Transport::Grpc => Arc::new(GrpcPublisher::new(config, sealer, origin)?),
    })
}
