//! gRPC transport
//!
//! A tonic `Metrics` service over the shared [`Ingestor`], fronted by
//! [`TrustLayer`] which rejects untrusted callers of protected methods
//! before their message is decoded.

use super::ingest::{IngestError, Ingestor};
use crate::metric::MetricDto;
use crate::observability::request_span;
use crate::proto::metrics_server::{Metrics, MetricsServer};
use crate::proto::{
    GetAllMetricsRequest, GetAllMetricsResponse, PingRequest, PingResponse, UpdateMetricsRequest,
    UpdateMetricsResponse, UPDATE_METRICS_PATH,
};
use crate::security::{trust, TrustedSubnet, ORIGIN_HEADER};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tonic::codec::CompressionEncoding;
use tonic::{Request, Response, Status};
use tower::{Layer, Service};
use tracing::{warn, Instrument};

pub struct GrpcMetricsService {
    ingestor: Ingestor,
}

impl GrpcMetricsService {
    pub fn new(ingestor: Ingestor) -> Self {
        GrpcMetricsService { ingestor }
    }

    /// Service ready to mount, with gzip accepted and sent
    pub fn into_server(self) -> MetricsServer<Self> {
        MetricsServer::new(self)
            .accept_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Gzip)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<MetricDto>, IngestError> {
        let plain = self.ingestor.open(sealed)?;
        Ok(serde_json::from_slice(&plain)?)
    }
}

#[tonic::async_trait]
impl Metrics for GrpcMetricsService {
    async fn update_metrics(
        &self,
        request: Request<UpdateMetricsRequest>,
    ) -> Result<Response<UpdateMetricsResponse>, Status> {
        let req = request.into_inner();
        let batch = if req.sealed.is_empty() {
            req.metrics.into_iter().map(MetricDto::from).collect()
        } else {
            self.unseal(&req.sealed)?
        };

        let failed = self
            .ingestor
            .update_batch(batch)
            .instrument(request_span("grpc", UPDATE_METRICS_PATH))
            .await?;

        Ok(Response::new(UpdateMetricsResponse {
            failed: failed.into_iter().map(Into::into).collect(),
        }))
    }

    async fn get_all_metrics(
        &self,
        _request: Request<GetAllMetricsRequest>,
    ) -> Result<Response<GetAllMetricsResponse>, Status> {
        let metrics = self
            .ingestor
            .get_all_dtos()
            .instrument(request_span("grpc", "/metrics.v1.Metrics/GetAllMetrics"))
            .await?;
        Ok(Response::new(GetAllMetricsResponse {
            metrics: metrics.into_iter().map(Into::into).collect(),
        }))
    }

    async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        self.ingestor
            .ping()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        Ok(Response::new(PingResponse {}))
    }
}

/// Tower layer enforcing the trusted subnet on selected gRPC paths
#[derive(Clone)]
pub struct TrustLayer {
    subnet: Option<TrustedSubnet>,
    protected: Arc<[&'static str]>,
}

impl TrustLayer {
    /// Guards `UpdateMetrics`
    pub fn new(subnet: Option<TrustedSubnet>) -> Self {
        Self::with_paths(subnet, &[UPDATE_METRICS_PATH])
    }

    pub fn with_paths(subnet: Option<TrustedSubnet>, paths: &[&'static str]) -> Self {
        TrustLayer {
            subnet,
            protected: paths.into(),
        }
    }
}

impl<S> Layer<S> for TrustLayer {
    type Service = TrustedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TrustedService {
            inner,
            subnet: self.subnet,
            protected: self.protected.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TrustedService<S> {
    inner: S,
    subnet: Option<TrustedSubnet>,
    protected: Arc<[&'static str]>,
}

impl<S, B> Service<http::Request<B>> for TrustedService<S>
where
    S: Service<http::Request<B>, Response = http::Response<tonic::body::BoxBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let path = request.uri().path();
        if self.protected.iter().any(|p| *p == path) {
            let origin = request
                .headers()
                .get(ORIGIN_HEADER)
                .and_then(|v| v.to_str().ok());
            if let Err(e) = trust::admit(self.subnet.as_ref(), origin) {
                warn!(path = %path, error = %e, "Rejected untrusted gRPC caller");
                let response = Status::permission_denied(e.to_string()).into_http();
                return Box::pin(async move { Ok(response) });
            }
        }

        // The ready inner service is the one that must serve this call
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(request).await })
    }
}
