#![forbid(unsafe_code)]

// Signaling module - WebSocket event channel and REST signaling API

pub mod api;
pub mod connection;
pub mod protocol;

use crate::media::types::{MediaError, MediaResult};
use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use protocol::HealthResponse;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Longest accepted room or peer id, in characters
pub const MAX_ID_LEN: usize = 128;

/// Rejects empty or oversized room/peer ids
pub(crate) fn validate_id(field: &str, value: &str) -> MediaResult<()> {
    let len = value.chars().count();
    if len == 0 || len > MAX_ID_LEN {
        return Err(MediaError::InvalidRequest(format!(
            "{field} must be 1 to {MAX_ID_LEN} characters"
        )));
    }
    Ok(())
}

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    room_manager: Arc<RoomManager>,
    metrics: ServerMetrics,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(room_manager: Arc<RoomManager>) -> Self {
        let metrics = room_manager.metrics().clone();
        Self { room_manager, metrics }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        let room_routes = Router::new()
            .route("/{room_id}/rtp-capabilities", get(api::rtp_capabilities))
            .route("/{room_id}/create-transport", post(api::create_transport))
            .route("/{room_id}/connect-transport", post(api::connect_transport))
            .route("/{room_id}/produce", post(api::produce))
            .route("/{room_id}/consume", post(api::consume))
            .route("/{room_id}/resume-consumer", post(api::resume_consumer));

        let recording_routes = Router::new()
            .route("/start", post(api::start_recording))
            .route("/stop", post(api::stop_recording));

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .nest("/api/room", room_routes)
            .nest("/api/recording", recording_routes)
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        rooms: server.room_manager.room_count(),
        peers: server.room_manager.peer_count(),
    })
}

/// Metrics handler - Prometheus text exposition format.
async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let rooms = server.room_manager.room_count();
    let peers = server.room_manager.peer_count();
    let body = server.metrics.render_prometheus(rooms, peers);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.room_manager, server.metrics)
        })
}
