use anyhow::Context;
use clap::Parser;
use grid_dispatcher::{build_state, config::GridConfig, dispatch_options, GridServer};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,grid_dispatcher=debug")),
        )
        .init();

    let cfg = GridConfig::parse();
    tracing::debug!(config = ?cfg, "loaded config");
    let addr: SocketAddr = cfg.bind.parse().context("parse bind addr")?;

    let state = build_state(&cfg).context("build state")?;
    let server = GridServer::start(state, addr, dispatch_options(&cfg)).await?;
    tracing::info!(
        event = "grid.server.listening",
        addr = %server.addr,
        "grid dispatcher listening"
    );

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    tracing::info!(event = "grid.server.shutdown", "shutting down");
    server.shutdown().await
}
