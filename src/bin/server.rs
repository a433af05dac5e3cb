#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use metrics_pipeline::config::{config_path_from_args, ServerConfig};
use metrics_pipeline::observability::{self, DatadogConfig};
use metrics_pipeline::storage::open_storage;
use metrics_pipeline::MetricsServer;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dd_config = DatadogConfig::from_env("metrics-server");
    observability::init_tracing(&dd_config).map_err(|e| e as Box<dyn std::error::Error>)?;

    let config = ServerConfig::load(config_path_from_args().as_deref())?;
    info!(
        address = %config.address,
        grpc = ?config.grpc_address,
        signed = config.key.is_some(),
        encrypted = config.crypto_key.is_some(),
        trusted_subnet = ?config.trusted_subnet.map(|s| s.to_string()),
        "Metrics server starting"
    );

    let storage = open_storage(&config).await?;
    let server =
        MetricsServer::with_metrics(config, storage, observability::default_metrics(&dd_config))?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    server.run(cancel).await?;
    observability::shutdown();
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
    cancel.cancel();
}
