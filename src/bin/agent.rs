#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use metrics_pipeline::config::{config_path_from_args, AgentConfig};
use metrics_pipeline::observability::{self, DatadogConfig};
use metrics_pipeline::Agent;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dd_config = DatadogConfig::from_env("metrics-agent");
    observability::init_tracing(&dd_config).map_err(|e| e as Box<dyn std::error::Error>)?;

    let config = AgentConfig::load(config_path_from_args().as_deref())?;
    info!(
        address = %config.address,
        transport = ?config.transport,
        rate_limit = config.rate_limit,
        poll_ms = config.poll_interval_ms,
        report_ms = config.report_interval_ms,
        "Metrics agent starting"
    );

    let agent = Agent::new(config)?.with_metrics(observability::default_metrics(&dd_config));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    agent.run(cancel).await;
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
