#![forbid(unsafe_code)]

use anyhow::Result;
use mediaroom::config::ServerConfig;
use mediaroom::media::worker_manager::exit_process;
use mediaroom::media::MediasoupEngine;
use mediaroom::metrics::ServerMetrics;
use mediaroom::room::RoomManager;
use mediaroom::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediaroom=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("mediaroom - Starting server");

    let config = ServerConfig::from_env()?;
    if let Some(ip) = config.media.transport_config.announced_ip {
        info!("Announcing {} in ICE candidates", ip);
    }

    // Workers are created up front; a worker death later ends the process
    let engine = MediasoupEngine::new(config.media.clone());
    let metrics = ServerMetrics::new();
    let room_manager = Arc::new(
        RoomManager::initialize(&engine, &config.media, metrics, exit_process()).await?,
    );

    info!(
        "Room manager initialized with {} media workers",
        room_manager.workers().len()
    );

    let signaling_server = SignalingServer::new(room_manager.clone());

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    room_manager.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
