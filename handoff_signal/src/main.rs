//! `handoff-signal`: run the signaling server.
//!
//! Settings come from the environment (see `SignalConfig::from_env`), logging
//! from `RUST_LOG`.

use anyhow::Context;
use handoff_signal::{SignalConfig, SignalServer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "handoff_signal=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = SignalConfig::from_env();
    tracing::info!("Starting handoff signaling server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Rooms expire after {}s, at most {} open",
        config.idle_timeout.as_secs(),
        config.max_rooms
    );

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received");
                ctrl_c.cancel();
            }
            Err(e) => tracing::warn!("Cannot listen for interrupts: {}", e),
        }
    });

    SignalServer::new(config).serve(listener, shutdown).await
}
