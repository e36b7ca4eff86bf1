//! # Herald Server
//!
//! Binary that wires the federation core to the outside world: loads
//! configuration, brings up structured logging, hosts the configured
//! domains, and binds the S2S listener. Everything protocol-shaped lives in
//! `herald-federation`; this crate only assembles it.

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use herald_federation::transport::tcp::TcpConnector;
use herald_federation::Router;
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=debug".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting Herald v{}", env!("CARGO_PKG_VERSION"));

    let connector = TcpConnector::new(config.server.s2s_port)
        .with_max_frame_bytes(config.limits.max_frame_bytes);
    let router = Router::new(Arc::new(connector));

    // Pre-create a context per hosted domain so inbound handshakes for them
    // can resolve immediately.
    for domain in config.server.domain_list() {
        router.get_context(&domain).await;
        tracing::info!(%domain, "hosting domain");
    }

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.s2s_port);
    let listener = router.listen(addr, config.limits.max_frame_bytes).await?;

    // Log stanzas delivered by remote peers until shutdown. Embedders would
    // consume this subscription instead.
    let mut deliveries = router.subscribe();
    let delivery_log = tokio::spawn(async move {
        loop {
            match deliveries.recv().await {
                Ok(stanza) => tracing::info!(
                    from = stanza.from.as_deref().unwrap_or("-"),
                    to = stanza.to.as_deref().unwrap_or("-"),
                    "delivered inbound stanza"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "delivery log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    listener.abort();
    delivery_log.abort();

    Ok(())
}
