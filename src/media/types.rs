#![forbid(unsafe_code)]

// Common types and error handling for the media module

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Custom error type for room, peer and engine operations
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Peer {peer_id} is already joined to room {room_id}")]
    PeerConflict { room_id: String, peer_id: String },

    #[error("Peer {peer_id} already has a {direction} transport")]
    DuplicateTransport { peer_id: String, direction: Direction },

    #[error("{0}")]
    InvalidState(String),

    #[error("Cannot consume producer {0} with the given capabilities")]
    CannotConsume(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Engine error: {0}")]
    Engine(String),
}

/// Coarse classification used at the HTTP and event-channel boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidState,
    Engine,
}

impl MediaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RoomNotFound(_)
            | Self::PeerNotFound(_)
            | Self::TransportNotFound(_)
            | Self::ProducerNotFound(_)
            | Self::ConsumerNotFound(_) => ErrorKind::NotFound,
            Self::PeerConflict { .. } | Self::DuplicateTransport { .. } => ErrorKind::Conflict,
            Self::InvalidState(_) | Self::CannotConsume(_) | Self::InvalidRequest(_) => {
                ErrorKind::InvalidState
            }
            Self::Worker(_) | Self::Engine(_) => ErrorKind::Engine,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Media kind of a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

impl FromStr for MediaKind {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(MediaError::InvalidRequest(format!("unknown media kind: {other}"))),
        }
    }
}

/// Direction a transport was created for.
///
/// The engine does not track this itself; the peer records it at creation time
/// and selects transports by matching on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Producing transport
    Send,
    /// Consuming transport
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Recv => f.write_str("recv"),
        }
    }
}

impl FromStr for Direction {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(Self::Send),
            "recv" => Ok(Self::Recv),
            other => Err(MediaError::InvalidRequest(format!("unknown transport direction: {other}"))),
        }
    }
}

/// Transport parameters the remote endpoint needs for ICE/DTLS negotiation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
}

/// Consumer parameters returned to the subscribing client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: serde_json::Value,
    #[serde(rename = "type")]
    pub consumer_type: String,
    pub producer_paused: bool,
}

/// A publishable stream as advertised to other peers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub peer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
}
