//! Sotto Relay Server
//!
//! WebSocket-based identity assignment, handshake brokering and encrypted
//! message fan-out.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use relay_server::broker::Broker;
use relay_server::server::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_server=debug".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    info!("Starting Sotto Relay Server");

    let broker = Arc::new(Broker::new());
    let app = app(broker);

    let addr: SocketAddr = std::env::var("RELAY_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
