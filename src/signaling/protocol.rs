#![forbid(unsafe_code)]

// Signaling protocol - event channel messages and REST request/response bodies

use crate::media::types::{MediaKind, ProducerSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound half of a client's event channel
pub type EventSender = mpsc::Sender<Arc<String>>;

/// Client-to-Server events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Join a room, creating it on first use
    #[serde(rename = "join-room", rename_all = "camelCase")]
    JoinRoom { room_id: String, peer_id: String },
    /// Leave the current room
    #[serde(rename = "leave-room")]
    LeaveRoom,
}

/// Server-to-Client events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Join accepted, with every producer already present in the room
    #[serde(rename = "joined-room")]
    JoinedRoom { producers: Vec<ProducerSummary> },
    #[serde(rename = "peer-joined", rename_all = "camelCase")]
    PeerJoined { peer_id: String },
    #[serde(rename = "peer-left", rename_all = "camelCase")]
    PeerLeft { peer_id: String },
    /// Another peer started publishing
    #[serde(rename = "newProducer", rename_all = "camelCase")]
    NewProducer {
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
    },
    /// A consumer of this peer was closed because its producer went away
    #[serde(rename = "consumerClosed", rename_all = "camelCase")]
    ConsumerClosed { consumer_id: String },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    /// Serialize once so the same text can be queued for many clients
    pub fn to_shared(&self) -> Option<Arc<String>> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Arc::new(json)),
            Err(e) => {
                warn!("Failed to serialize message: {}", e);
                None
            }
        }
    }
}

/// Queues an event without waiting. A full channel drops the event.
pub fn deliver(sender: &EventSender, json: Arc<String>, target: &str) {
    match sender.try_send(json) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Channel full for {}, dropping message", target);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for {} (disconnected)", target);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilitiesResponse {
    pub rtp_capabilities: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    pub peer_id: String,
    pub direction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub peer_id: String,
    pub transport_id: String,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub peer_id: String,
    pub transport_id: String,
    pub kind: String,
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub producer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub peer_id: String,
    pub producer_id: String,
    pub rtp_capabilities: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumerRequest {
    pub peer_id: String,
    pub consumer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingRequest {
    pub room_id: String,
    pub recording_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingResponse {
    pub success: bool,
    pub recording_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub rooms: usize,
    pub peers: usize,
}
