use anyhow::{Context, Result};
use auction_hub::api::create_app;
use auction_hub::auction::{AuctionHub, AuctionRepo, MemoryAuctionRepo};
use auction_hub::config::AuctionHubConfig;
use auction_hub::hub::Hub;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "auction_hub=info".into()),
        )
        .init();

    info!("Auction hub starting...");

    let config = AuctionHubConfig::from_env().context("Failed to load configuration")?;
    info!(
        bind_address = %config.server.bind_address,
        hub_path = %config.server.hub_path,
        send_timeout_ms = config.hub.send_timeout_ms,
        keep_alive_interval_seconds = config.hub.keep_alive_interval_seconds,
        client_timeout_seconds = config.hub.client_timeout_seconds,
        "Configuration loaded"
    );

    let repo: Arc<dyn AuctionRepo> = Arc::new(MemoryAuctionRepo::with_sample_data());
    let hub = Arc::new(Hub::new(AuctionHub::new(), config.hub.clone()));

    let app = create_app(&config.server.hub_path, Arc::clone(&hub), repo);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
    info!(address = %config.server.bind_address, "Auction hub listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!(
        open_connections = hub.registry().connection_count(),
        "Auction hub stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for ctrl_c signal");
            std::future::pending::<()>().await;
        }
    }
}
