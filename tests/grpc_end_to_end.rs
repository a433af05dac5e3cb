//! gRPC transport end to end, including the trust layer

use metrics_pipeline::agent::{GrpcPublisher, Publisher};
use metrics_pipeline::config::ServerConfig;
use metrics_pipeline::metric::{MetricDto, MetricValue};
use metrics_pipeline::proto::metrics_client::MetricsClient;
use metrics_pipeline::proto::{GetAllMetricsRequest, PingRequest, UpdateMetricsRequest};
use metrics_pipeline::security::{Sealer, Signer};
use metrics_pipeline::storage::{MemStorage, Storage};
use metrics_pipeline::MetricsServer;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

struct TestServer {
    grpc: SocketAddr,
    storage: MemStorage,
    cancel: CancellationToken,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Self {
        let storage = MemStorage::new();
        let server = MetricsServer::new(config, Arc::new(storage.clone())).unwrap();
        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let grpc = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let grpc_addr = grpc.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(http, Some(grpc), cancel.clone()));
        TestServer {
            grpc: grpc_addr,
            storage,
            cancel,
        }
    }

    async fn channel(&self) -> Channel {
        Endpoint::from_shared(format!("http://{}", self.grpc))
            .unwrap()
            .connect()
            .await
            .unwrap()
    }

    async fn publisher(&self, sealer: Option<Sealer>, origin: Option<&str>) -> GrpcPublisher {
        let origin = origin.map(|ip| ip.parse::<IpAddr>().unwrap());
        GrpcPublisher::from_channel(self.channel().await, sealer, origin)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn signed_batch() -> Vec<MetricDto> {
    let signer = Signer::new("foobar");
    vec![
        signer.signed_dto("PollCount", &MetricValue::Counter(5)),
        signer.signed_dto("Sys", &MetricValue::Gauge(13220880.0)),
    ]
}

#[tokio::test]
async fn test_signed_batch_sent_twice_accumulates() {
    let server = TestServer::start(
        ServerConfig::default()
            .with_address("127.0.0.1:0")
            .with_key("foobar"),
    )
    .await;
    let publisher = server.publisher(None, None).await;

    publisher.publish(&signed_batch()).await.unwrap();
    publisher.publish(&signed_batch()).await.unwrap();

    assert_eq!(server.storage.get_counter("PollCount").await.unwrap(), 10);
    assert_eq!(server.storage.get_gauge("Sys").await.unwrap(), 13220880.0);

    let mut client = MetricsClient::new(server.channel().await);
    let all = client
        .get_all_metrics(GetAllMetricsRequest {})
        .await
        .unwrap()
        .into_inner()
        .metrics;
    let ids: Vec<&str> = all.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["Sys", "PollCount"]);
    assert_eq!(all[1].delta, Some(10));
    assert_eq!(
        all[1].hash,
        Some(Signer::new("foobar").sign("PollCount", &MetricValue::Counter(10)))
    );
}

#[tokio::test]
async fn test_trusted_subnet_rejects_outsider() {
    let config = ServerConfig::default()
        .with_address("127.0.0.1:0")
        .with_trusted_subnet("192.168.0.0/16".parse().unwrap());
    let server = TestServer::start(config).await;
    let batch = vec![MetricDto::new("a", &MetricValue::Counter(1))];

    let outsider = server.publisher(None, Some("1.1.1.1")).await;
    let mut client = MetricsClient::new(server.channel().await);
    let mut request = tonic::Request::new(UpdateMetricsRequest {
        metrics: batch.iter().cloned().map(Into::into).collect(),
        sealed: Vec::new(),
    });
    request
        .metadata_mut()
        .insert("x-real-ip", "1.1.1.1".parse().unwrap());
    let status = client.update_metrics(request).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::PermissionDenied);
    assert!(outsider.publish(&batch).await.is_err());
    assert!(server.storage.is_empty());

    let insider = server.publisher(None, Some("192.168.0.100")).await;
    insider.publish(&batch).await.unwrap();
    assert_eq!(server.storage.get_counter("a").await.unwrap(), 1);

    // Only UpdateMetrics is guarded
    client.ping(PingRequest {}).await.unwrap();
}

#[tokio::test]
async fn test_sealed_batch() {
    let key = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/private.pem");
    let config = ServerConfig::default()
        .with_address("127.0.0.1:0")
        .with_crypto_key(&key);
    let server = TestServer::start(config).await;

    let sealer =
        Sealer::from_file(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/public.pem"))
            .unwrap();
    let publisher = server.publisher(Some(sealer), None).await;
    publisher
        .publish(&[MetricDto::new("Alloc", &MetricValue::Gauge(42.5))])
        .await
        .unwrap();

    assert_eq!(server.storage.get_gauge("Alloc").await.unwrap(), 42.5);
}

#[tokio::test]
async fn test_invalid_items_come_back_as_failed() {
    let server = TestServer::start(ServerConfig::default().with_address("127.0.0.1:0")).await;
    let mut client = MetricsClient::new(server.channel().await);

    let response = client
        .update_metrics(UpdateMetricsRequest {
            metrics: vec![
                MetricDto::new("ok", &MetricValue::Counter(3)).into(),
                MetricDto::new("", &MetricValue::Counter(1)).into(),
            ],
            sealed: Vec::new(),
        })
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.failed.len(), 1);
    assert_eq!(response.failed[0].error, "metric name is empty");
    assert_eq!(server.storage.get_counter("ok").await.unwrap(), 3);

    let mut bad_type = MetricDto::new("h", &MetricValue::Counter(1));
    bad_type.kind = "histogram".into();
    let status = client
        .update_metrics(UpdateMetricsRequest {
            metrics: vec![bad_type.into()],
            sealed: Vec::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unimplemented);
}
