//! lineage-coordinator: HTTP front end over the coordinator runtime.

mod config;

use std::sync::Arc;

use actors::Coordinator;
use api::{AppState, build_router};
use clap::Parser;
use tracing::info;

use config::Cli;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.coordinator_config()?;
    info!(database = %config.db.endpoint, queue = %config.queue.name, "Starting lineage coordinator");

    let coordinator = Coordinator::start(config).await?;
    let router = build_router(Arc::new(AppState::from_coordinator(&coordinator)));

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    coordinator.shutdown().await;
    info!("lineage-coordinator exited cleanly");
    Ok(())
}
