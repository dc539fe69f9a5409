//! TOD Markets realtime listener
//!
//! Fetches the company's connection details, joins its private channel and
//! logs every market event until Ctrl+C.

use std::sync::Arc;

use anyhow::Context;
use tod_core::{ConnectionState, MarketEvent};
use tod_realtime::{
    BroadcastingAuthorizer, ConnectionManager, CredentialCache, EventRouter, PusherTransport,
    RealtimeConfig, SubscriptionRegistry,
};
use tod_rest::{TodClient, TodConfig};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn label(event: MarketEvent) -> &'static str {
    match event {
        MarketEvent::AssetPriceChangeEventCompany => "PRICE CHANGE",
        MarketEvent::OrderUpdated => "ORDER UPDATED",
        MarketEvent::OrderFilled => "ORDER FILLED",
        MarketEvent::OrderCreated => "ORDER CREATED",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tod_realtime=debug")),
        )
        .init();

    info!("Starting TOD Markets realtime listener");

    let config = TodConfig::from_env().context("Invalid REST configuration")?;
    let realtime_config = RealtimeConfig::from_env().context("Invalid realtime configuration")?;
    let client = TodClient::new(config).context("Failed to build REST client")?;

    // Fetch once up front so handlers can be bound to the channel key
    let cache = Arc::new(CredentialCache::new());
    let credentials = cache
        .refresh(&client)
        .await
        .context("Failed to fetch connection details")?;
    info!(
        "Listening as {} (connection {})",
        credentials.display_name, credentials.connection_id
    );

    let registry = Arc::new(SubscriptionRegistry::new());
    for event in MarketEvent::ALL {
        registry.bind(&credentials.channel_key, event.as_str(), move |inbound| {
            info!("[{}] {}", label(event), inbound.payload);
            Ok(())
        });
    }
    let router = Arc::new(EventRouter::new(Arc::clone(&registry)));

    let authorizer = BroadcastingAuthorizer::new(client.clone())?;
    let transport = PusherTransport::new(realtime_config.handshake_timeout);

    let manager = ConnectionManager::spawn(
        realtime_config,
        cache,
        Arc::new(client),
        Arc::new(authorizer),
        transport,
        Arc::clone(&router),
    );

    let mut states = manager.subscribe_states();
    tokio::spawn(async move {
        while let Ok(state) = states.recv().await {
            if state == ConnectionState::Disconnected {
                warn!("Realtime connection is down");
            }
        }
    });

    manager.connect().await?;
    info!("Starting WebSocket listener (press Ctrl+C to stop)...");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down");
    manager.shutdown().await;

    let stats = router.stats();
    info!(
        "Delivered {} event(s), dropped {}, {} handler failure(s)",
        stats.delivered, stats.dropped, stats.handler_failures
    );

    Ok(())
}
