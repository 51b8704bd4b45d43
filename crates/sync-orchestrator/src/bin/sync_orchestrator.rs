use std::sync::Arc;

use clap::Parser;
use sync_orchestrator::orchestrator::IndexTargetUrls;
use sync_orchestrator::{Config, Orchestrator};
use sync_state::{ConfigStore, StateStore};
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    info!("starting sync-orchestrator");

    let config_store = Arc::new(ConfigStore::connect(&config.database_url).await?);
    config_store.initialize().await?;

    let state_store = Arc::new(StateStore::connect(&config.database_url).await?);
    state_store.initialize().await?;

    let urls = IndexTargetUrls {
        vector: config.vector_url.clone(),
        search: config.search_url.clone(),
        graph: config.graph_url.clone(),
        extract: config.extract_url.clone(),
    };

    let orchestrator = Arc::new(Orchestrator::new(config_store, state_store, urls).await);

    let orchestrator_loop = Arc::clone(&orchestrator);
    let run_handle = tokio::spawn(async move { orchestrator_loop.run().await });

    let mut shutdown_rx = create_shutdown_signal();
    shutdown_rx.wait_for(|&v| v).await.ok();

    info!("shutdown signal received, stopping source workers");
    orchestrator.shutdown().await;
    run_handle.abort();

    info!("sync-orchestrator shutdown complete");
    Ok(())
}

/// Triggers on Ctrl+C or, on unix, SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c().await.expect("failed to install ctrl-c handler");
            info!("received ctrl-c");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install sigterm handler")
                .recv()
                .await;
            info!("received sigterm");
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
