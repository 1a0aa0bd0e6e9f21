mod config;
mod encoder;
mod handlers;
mod lifecycle;
mod notifier;
mod registry;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, ServerConfig};
use crate::handlers::{build_router, PierState};
use crate::notifier::BackendNotifier;
use crate::registry::ConnectionRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli).context("invalid configuration")?;
    info!(
        listen_addr = %config.listen_addr,
        backend_url = %config.backend_url,
        connect_timeout_secs = config.connect_timeout.as_secs(),
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        "starting beach-pier"
    );

    run(config).await
}

async fn run(config: ServerConfig) -> Result<()> {
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;

    let client = reqwest::Client::builder()
        .timeout(config.connect_timeout)
        .build()
        .context("failed to build backend HTTP client")?;

    let state = PierState {
        registry: ConnectionRegistry::new(),
        notifier: BackendNotifier::new(client, config.backend_url.clone(), config.connect_timeout),
        heartbeat_interval: config.heartbeat_interval,
        metrics,
    };

    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-pier listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
