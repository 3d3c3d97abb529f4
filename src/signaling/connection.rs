#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{deliver, ClientMessage, EventSender, ServerMessage};
use super::validate_id;
use crate::media::types::{MediaError, MediaResult};
use crate::metrics::ServerMetrics;
use crate::room::peer::Peer;
use crate::room::RoomManager;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// Events queued beyond this are dropped with a warning.
pub const CHANNEL_CAPACITY: usize = 64;

/// The server pings every client at this interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(25);

/// How long a client may stay silent after a ping before it counts as gone.
/// Any frame resets the deadline, pongs included.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(20);

/// Upper bound on flushing queued events after the client is gone
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Event-channel state of one client, independent of the socket.
///
/// A session is joined to at most one room at a time. Leaving, re-joining and
/// disconnecting all go through `leave`, so the peer is torn down exactly once.
pub struct SignalingSession {
    connection_id: String,
    room_manager: Arc<RoomManager>,
    sender: EventSender,
    peer: Option<Arc<Peer>>,
}

impl SignalingSession {
    pub fn new(room_manager: Arc<RoomManager>, sender: EventSender) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            room_manager,
            sender,
            peer: None,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn peer(&self) -> Option<&Arc<Peer>> {
        self.peer.as_ref()
    }

    fn send(&self, message: &ServerMessage) {
        if let Some(json) = message.to_shared() {
            deliver(&self.sender, json, &self.connection_id);
        }
    }

    /// Parses and dispatches one text frame. Failures are reported to this
    /// client as `error` events and never end the session.
    pub async fn handle_text(&mut self, text: &str) {
        let metrics = self.room_manager.metrics().clone();
        metrics.inc_messages_received();

        let client_msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Invalid message format from {}: {}", self.connection_id, e);
                metrics.inc_errors();
                self.send(&ServerMessage::Error { message: format!("Invalid message format: {e}") });
                return;
            }
        };

        let start = Instant::now();
        let result = self.handle(client_msg).await;
        metrics.observe_request_handling(start.elapsed());

        if let Err(e) = result {
            warn!("Error handling message from {}: {}", self.connection_id, e);
            metrics.inc_errors();
            self.send(&ServerMessage::Error { message: e.to_string() });
        }
    }

    /// # Errors
    /// Returns the failure of the requested action
    pub async fn handle(&mut self, message: ClientMessage) -> MediaResult<()> {
        match message {
            ClientMessage::JoinRoom { room_id, peer_id } => {
                validate_id("roomId", &room_id)?;
                validate_id("peerId", &peer_id)?;

                if let Some(current) = &self.peer {
                    if current.room_id() == room_id && current.id() == peer_id {
                        return Err(MediaError::PeerConflict { room_id, peer_id });
                    }
                    self.leave();
                }

                let peer = self
                    .room_manager
                    .join_room(&room_id, &peer_id, self.sender.clone())
                    .await?;
                debug!("Connection {} is peer {} in room {}", self.connection_id, peer_id, room_id);
                self.peer = Some(peer);
                Ok(())
            }
            ClientMessage::LeaveRoom => {
                if self.peer.is_none() {
                    debug!("Leave from connection {} which is not in a room", self.connection_id);
                }
                self.leave();
                Ok(())
            }
        }
    }

    /// Leaves the current room, if any
    pub fn leave(&mut self) {
        if let Some(peer) = self.peer.take() {
            self.room_manager.leave(&peer);
        }
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        if let Some(peer) = &self.peer {
            info!(
                "Connection {} dropped, peer {} leaves room {}",
                self.connection_id,
                peer.id(),
                peer.room_id()
            );
        }
        self.leave();
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(socket: WebSocket, room_manager: Arc<RoomManager>, metrics: ServerMetrics) {
    let (ws_sender, ws_receiver) = socket.split();
    run_connection(ws_sender, ws_receiver, room_manager, metrics).await;
}

/// Connection loop over any message sink/stream pair.
///
/// The socket carries only room membership and server events, so a joined
/// client is normally silent. Liveness comes from server pings instead: the
/// client is dropped once nothing, not even a pong, arrived for
/// `PING_INTERVAL + PONG_TIMEOUT`.
pub async fn run_connection<S, R, E>(
    mut ws_sender: S,
    mut ws_receiver: R,
    room_manager: Arc<RoomManager>,
    metrics: ServerMetrics,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);
    let mut session = SignalingSession::new(room_manager, tx);
    let connection_id = session.connection_id().to_string();
    info!("New WebSocket connection: {}", connection_id);

    // Spawn task to send events and heartbeat pings to the client
    let mut send_task = tokio::spawn({
        let connection_id = connection_id.clone();
        async move {
            let mut heartbeat = tokio::time::interval(PING_INTERVAL);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            heartbeat.tick().await;
            loop {
                let message = tokio::select! {
                    json = rx.recv() => match json {
                        Some(json) => Message::Text((*json).clone().into()),
                        None => break,
                    },
                    _ = heartbeat.tick() => Message::Ping(Bytes::new()),
                };
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
            debug!("Send task finished for connection: {}", connection_id);
        }
    });

    let liveness = PING_INTERVAL + PONG_TIMEOUT;
    loop {
        let msg = match tokio::time::timeout(liveness, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("WebSocket error on connection {}: {}", connection_id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Connection {} missed its heartbeat, closing", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => session.handle_text(text.as_str()).await,
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Heartbeat only; receiving it already reset the deadline
            }
            Message::Binary(_) => {
                warn!("Unexpected binary message from client {}", connection_id);
            }
        }
    }

    // Disconnect has the same effect as leave-room
    drop(session);

    if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        debug!("Send task for connection {} still pending, aborting", connection_id);
        send_task.abort();
    }
    info!("Connection handler finished: {}", connection_id);
}
