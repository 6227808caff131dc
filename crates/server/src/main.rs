// crates/server/src/main.rs
//! Streaming fan-out server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use arlens_bus::NatsBus;
use arlens_server::{create_app, AppState};

#[derive(Parser, Debug)]
#[command(name = "arlens-server", about = "AR Server log analysis streaming server")]
struct ServerConfig {
    #[arg(long, env = "ARLENS_NATS_URL", default_value = "nats://localhost:4222")]
    nats_url: String,

    #[arg(long, env = "ARLENS_PORT", default_value_t = 8900)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::parse();

    let bus = Arc::new(
        NatsBus::connect(&config.nats_url)
            .await
            .context("connect nats")?,
    );

    // The AI provider is wired in by deployment; without one the SSE
    // endpoint reports unavailable.
    let state = AppState::new(bus, None);
    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "streaming server listening");

    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}
