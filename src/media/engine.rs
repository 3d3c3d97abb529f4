#![forbid(unsafe_code)]

//! Media engine adapter.
//!
//! The SFU itself (packet forwarding, codecs, congestion control) lives behind
//! these traits. Room and peer state only ever talk to the engine through them,
//! which keeps the signaling core testable without spawning real workers.
//!
//! Negotiation payloads (DTLS parameters, RTP parameters, RTP capabilities) are
//! passed through as opaque JSON; the concrete engine validates them.

use crate::media::config::TransportConfig;
use crate::media::types::{MediaKind, MediaResult, TransportInfo};
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Callback fired once when a worker dies, with a human readable reason
pub type DeathCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// Callback fired once when the observed close event happens
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Registration handle for an engine event handler.
///
/// Dropping it unregisters the handler. Peers keep these next to the resource
/// they observe, so clearing a peer's maps is the single cancellation point.
pub struct Subscription {
    _guard: Option<Box<dyn Any + Send + Sync>>,
}

impl Subscription {
    pub fn new<G: Any + Send + Sync>(guard: G) -> Self {
        Self { _guard: Some(Box::new(guard)) }
    }

    /// A subscription with nothing to release
    pub fn noop() -> Self {
        Self { _guard: None }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Factory for engine workers
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, index: usize) -> MediaResult<Arc<dyn EngineWorker>>;
}

/// One processing context of the engine
#[async_trait]
pub trait EngineWorker: Send + Sync {
    fn id(&self) -> String;

    fn is_alive(&self) -> bool;

    fn on_died(&self, callback: DeathCallback) -> Subscription;

    /// Creates a router with the engine's configured codec set
    async fn create_router(&self) -> MediaResult<Arc<dyn EngineRouter>>;
}

/// Per-room routing context
#[async_trait]
pub trait EngineRouter: Send + Sync {
    fn id(&self) -> String;

    fn rtp_capabilities(&self) -> Value;

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(
        &self,
        config: &TransportConfig,
    ) -> MediaResult<Arc<dyn EngineTransport>>;

    fn close(&self);
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> String;

    /// The subset of parameters the remote endpoint needs
    fn info(&self) -> TransportInfo;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> MediaResult<()>;

    /// Completes DTLS with the server side role
    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Arc<dyn EngineProducer>>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn EngineConsumer>>;

    /// Closing a transport cascades to the producers and consumers created on it
    fn close(&self);
}

pub trait EngineProducer: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn paused(&self) -> bool;

    fn on_transport_close(&self, callback: CloseCallback) -> Subscription;

    fn close(&self);
}

#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> String;

    fn producer_id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> Value;

    fn consumer_type(&self) -> String;

    fn paused(&self) -> bool;

    fn producer_paused(&self) -> bool;

    async fn resume(&self) -> MediaResult<()>;

    fn on_transport_close(&self, callback: CloseCallback) -> Subscription;

    fn on_producer_close(&self, callback: CloseCallback) -> Subscription;

    fn close(&self);
}
