//! Metrics server
//!
//! One [`Ingestor`] is built from the configuration and shared by the HTTP
//! router and, when `grpc_address` is set, the gRPC service. Both listeners
//! stop on the same cancellation token; shutdown is bounded by
//! `shutdown_timeout`.

pub mod grpc;
pub mod http;
pub mod ingest;

pub use grpc::{GrpcMetricsService, TrustLayer, TrustedService};
pub use ingest::{IngestError, IngestResult, Ingestor};

use crate::config::ServerConfig;
use crate::observability::{noop_metrics, SharedMetrics};
use crate::security::{EnvelopeError, Opener, Signer};
use crate::storage::Storage;
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tracing::{error, info, warn};

#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
    Envelope(EnvelopeError),
    Transport(tonic::transport::Error),
    Task(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
            ServerError::Envelope(e) => write!(f, "key error: {}", e),
            ServerError::Transport(e) => write!(f, "gRPC transport error: {}", e),
            ServerError::Task(reason) => write!(f, "server task failed: {}", reason),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<EnvelopeError> for ServerError {
    fn from(e: EnvelopeError) -> Self {
        ServerError::Envelope(e)
    }
}

impl From<tonic::transport::Error> for ServerError {
    fn from(e: tonic::transport::Error) -> Self {
        ServerError::Transport(e)
    }
}

pub struct MetricsServer {
    config: ServerConfig,
    ingestor: Ingestor,
}

impl MetricsServer {
    /// Loads the private key, if configured, and builds the shared ingestor
    pub fn new(config: ServerConfig, storage: Arc<dyn Storage>) -> Result<Self, ServerError> {
        Self::with_metrics(config, storage, noop_metrics())
    }

    pub fn with_metrics(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        metrics: SharedMetrics,
    ) -> Result<Self, ServerError> {
        let opener = config.crypto_key.as_ref().map(Opener::from_file).transpose()?;
        let ingestor = Ingestor::new(storage, metrics)
            .with_signer(Signer::from_secret(config.key.as_deref()))
            .with_opener(opener)
            .with_trusted_subnet(config.trusted_subnet);
        Ok(MetricsServer { config, ingestor })
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn router(&self) -> axum::Router {
        http::router(self.ingestor.clone())
    }

    /// Bind the configured addresses and serve until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        let http_listener = TcpListener::bind(&self.config.address).await?;
        let grpc_listener = match &self.config.grpc_address {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        self.serve(http_listener, grpc_listener, cancel).await
    }

    /// Serve on already-bound listeners
    pub async fn serve(
        self,
        http_listener: TcpListener,
        grpc_listener: Option<TcpListener>,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        let mut tasks: JoinSet<Result<(), ServerError>> = JoinSet::new();

        info!(addr = %http_listener.local_addr()?, "HTTP server listening");
        let router = self.router();
        let http_cancel = cancel.clone();
        tasks.spawn(async move {
            axum::serve(http_listener, router)
                .with_graceful_shutdown(http_cancel.cancelled_owned())
                .await?;
            Ok(())
        });

        if let Some(listener) = grpc_listener {
            info!(
                addr = %listener.local_addr()?,
                tls = self.config.tls_enabled(),
                "gRPC server listening"
            );
            let mut builder = Server::builder();
            if let (Some(cert), Some(key)) = (&self.config.tls_cert, &self.config.tls_key) {
                let cert = tokio::fs::read(cert).await?;
                let key = tokio::fs::read(key).await?;
                builder =
                    builder.tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))?;
            }
            let router = builder
                .layer(TrustLayer::new(self.config.trusted_subnet))
                .add_service(GrpcMetricsService::new(self.ingestor.clone()).into_server());
            let grpc_cancel = cancel.clone();
            tasks.spawn(async move {
                router
                    .serve_with_incoming_shutdown(
                        TcpListenerStream::new(listener),
                        grpc_cancel.cancelled_owned(),
                    )
                    .await?;
                Ok(())
            });
        }

        // A listener that exits on its own takes the other one down with it
        let mut first_exit = None;
        tokio::select! {
            _ = cancel.cancelled() => {}
            Some(joined) = tasks.join_next() => {
                cancel.cancel();
                first_exit = Some(flatten(joined));
            }
        }
        info!("Shutting down metrics server");

        let timeout = self.config.shutdown_timeout();
        let drained = tokio::time::timeout(timeout, async {
            let mut result = Ok(());
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = flatten(joined) {
                    result = Err(e);
                }
            }
            result
        })
        .await;

        let drained = match drained {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Graceful shutdown timed out");
                tasks.abort_all();
                Ok(())
            }
        };

        match first_exit {
            Some(Err(e)) => {
                error!(error = %e, "Server exited with error");
                Err(e)
            }
            _ => drained,
        }
    }
}

fn flatten(
    joined: Result<Result<(), ServerError>, tokio::task::JoinError>,
) -> Result<(), ServerError> {
    joined.map_err(|e| ServerError::Task(e.to_string()))?
}
