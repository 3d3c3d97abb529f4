#![forbid(unsafe_code)]

// Peer - one participant's transports, producers and consumers within a room.
//
// Resource maps are std mutexes held only for brief lookups/inserts, never
// across an engine call. Requests from the same peer are serialized by
// `op_lock`. Anything created by an engine call that completes after the peer
// closed is closed on the spot instead of being tracked.

use super::Room;
use crate::media::engine::{EngineConsumer, EngineProducer, EngineTransport, Subscription};
use crate::media::types::{
    ConsumerInfo, Direction, MediaError, MediaKind, MediaResult, ProducerSummary, TransportInfo,
};
use crate::signaling::protocol::{deliver, EventSender, ServerMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

struct PeerTransport {
    direction: Direction,
    transport: Arc<dyn EngineTransport>,
}

struct PeerProducer {
    producer: Arc<dyn EngineProducer>,
    _transport_close: Subscription,
}

struct PeerConsumer {
    consumer: Arc<dyn EngineConsumer>,
    _transport_close: Subscription,
    _producer_close: Subscription,
}

/// A participant joined to a room
pub struct Peer {
    id: String,
    room_id: String,
    room: Weak<Room>,
    sender: EventSender,
    /// "peer X in room Y", for channel diagnostics
    label: String,
    op_lock: TokioMutex<()>,
    transports: StdMutex<HashMap<String, PeerTransport>>,
    producers: StdMutex<HashMap<String, PeerProducer>>,
    consumers: StdMutex<HashMap<String, PeerConsumer>>,
    closed: AtomicBool,
}

impl Peer {
    pub(super) fn new(
        id: String,
        room_id: String,
        room: Weak<Room>,
        sender: EventSender,
    ) -> Self {
        Self {
            label: format!("peer {id} in room {room_id}"),
            id,
            room_id,
            room,
            sender,
            op_lock: TokioMutex::new(()),
            transports: StdMutex::new(HashMap::new()),
            producers: StdMutex::new(HashMap::new()),
            consumers: StdMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn transport_count(&self) -> usize {
        self.transports.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn producer_count(&self) -> usize {
        self.producers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn has_producer(&self, producer_id: &str) -> bool {
        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(producer_id)
    }

    pub fn producer_summaries(&self) -> Vec<ProducerSummary> {
        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, p)| ProducerSummary {
                peer_id: self.id.clone(),
                producer_id: id.clone(),
                kind: p.producer.kind(),
            })
            .collect()
    }

    /// Push an event to this peer's signaling channel
    pub fn send(&self, message: &ServerMessage) {
        if let Some(json) = message.to_shared() {
            self.send_raw(json);
        }
    }

    pub(super) fn send_raw(&self, json: Arc<String>) {
        deliver(&self.sender, json, &self.label);
    }

    fn ensure_open(&self) -> MediaResult<()> {
        if self.is_closed() {
            return Err(MediaError::PeerNotFound(self.id.clone()));
        }
        Ok(())
    }

    fn room(&self) -> MediaResult<Arc<Room>> {
        self.room
            .upgrade()
            .ok_or_else(|| MediaError::RoomNotFound(self.room_id.clone()))
    }

    /// Inserts under the map lock unless the peer has closed; the entry is
    /// handed back in that case so the caller can close it.
    fn track<T>(&self, map: &StdMutex<HashMap<String, T>>, id: String, entry: T) -> Result<(), T> {
        let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            return Err(entry);
        }
        map.insert(id, entry);
        Ok(())
    }

    fn transport(&self, transport_id: &str) -> MediaResult<(Direction, Arc<dyn EngineTransport>)> {
        self.transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(transport_id)
            .map(|t| (t.direction, t.transport.clone()))
            .ok_or_else(|| MediaError::TransportNotFound(transport_id.to_string()))
    }

    /// Creates a WebRTC transport on the room's router for one direction.
    ///
    /// # Errors
    /// Returns `DuplicateTransport` if the peer already has a transport for
    /// `direction`, or an engine error if creation fails
    pub async fn create_transport(self: &Arc<Self>, direction: Direction) -> MediaResult<TransportInfo> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;

        let exists = self
            .transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|t| t.direction == direction);
        if exists {
            return Err(MediaError::DuplicateTransport { peer_id: self.id.clone(), direction });
        }

        let room = self.room()?;
        let transport = room.router.create_webrtc_transport(&room.transport_config).await?;
        let transport_id = transport.id();

        if let Some(bitrate) = room.transport_config.max_incoming_bitrate {
            if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                warn!("Failed to cap incoming bitrate on transport {}: {}", transport_id, e);
            }
        }

        let info = transport.info();
        let entry = PeerTransport { direction, transport };
        if let Err(entry) = self.track(&self.transports, transport_id.clone(), entry) {
            entry.transport.close();
            return Err(MediaError::PeerNotFound(self.id.clone()));
        }

        debug!(
            "Created {} transport {} for peer {} in room {}",
            direction, transport_id, self.id, self.room_id
        );
        Ok(info)
    }

    /// Completes DTLS on one of this peer's own transports.
    ///
    /// # Errors
    /// Returns `TransportNotFound` if the transport does not belong to this peer
    pub async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;

        let (_, transport) = self.transport(transport_id)?;
        transport.connect(dtls_parameters).await?;

        debug!("Connected transport {} for peer {}", transport_id, self.id);
        Ok(())
    }

    /// Publishes a stream on a send transport and announces it to the rest of the room.
    ///
    /// # Errors
    /// Returns `TransportNotFound` for an unknown transport, `InvalidState` for a
    /// recv transport, or an engine error if the producer cannot be created
    pub async fn produce(
        self: &Arc<Self>,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<String> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;

        let (direction, transport) = self.transport(transport_id)?;
        if direction != Direction::Send {
            return Err(MediaError::InvalidState(format!(
                "transport {transport_id} is not a send transport"
            )));
        }
        let room = self.room()?;

        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id();

        let transport_close = producer.on_transport_close(Box::new({
            let peer = Arc::downgrade(self);
            let producer_id = producer_id.clone();
            move || {
                if let Some(peer) = peer.upgrade() {
                    let removed = peer
                        .producers
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&producer_id);
                    if removed.is_some() {
                        debug!("Producer {} of peer {} closed with its transport", producer_id, peer.id);
                    }
                }
            }
        }));
        let entry = PeerProducer { producer, _transport_close: transport_close };

        // Tracking and announcing under the room's read lock; joins take the
        // write lock, so a joining peer gets this producer either in its
        // snapshot or as a newProducer event, never both.
        let rejected = {
            let peers = room.peers.read().unwrap_or_else(|e| e.into_inner());
            let is_member = peers.get(&self.id).is_some_and(|p| Arc::ptr_eq(p, self));
            if !is_member {
                Some(entry)
            } else {
                match self.track(&self.producers, producer_id.clone(), entry) {
                    Ok(()) => {
                        room.broadcast_locked(
                            &peers,
                            &self.id,
                            &ServerMessage::NewProducer {
                                peer_id: self.id.clone(),
                                producer_id: producer_id.clone(),
                                kind,
                            },
                        );
                        None
                    }
                    Err(entry) => Some(entry),
                }
            }
        };
        if let Some(entry) = rejected {
            entry.producer.close();
            return Err(MediaError::PeerNotFound(self.id.clone()));
        }

        room.metrics.inc_producers_created();
        info!(
            "Peer {} producing {} ({}) in room {}",
            self.id, producer_id, kind, self.room_id
        );
        Ok(producer_id)
    }

    /// Subscribes to any producer in the room on this peer's recv transport.
    /// The consumer starts paused.
    ///
    /// # Errors
    /// Returns `ProducerNotFound` if no peer in the room owns `producer_id`,
    /// `CannotConsume` if the router rejects the capabilities, and
    /// `TransportNotFound` if the peer has no recv transport
    pub async fn consume(
        self: &Arc<Self>,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerInfo> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;

        let room = self.room()?;
        if !room.has_producer(&self.id, producer_id) {
            return Err(MediaError::ProducerNotFound(producer_id.to_string()));
        }
        if !room.router.can_consume(producer_id, &rtp_capabilities) {
            return Err(MediaError::CannotConsume(producer_id.to_string()));
        }

        let transport = self
            .transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|t| t.direction == Direction::Recv)
            .map(|t| t.transport.clone())
            .ok_or_else(|| {
                MediaError::TransportNotFound(format!("no recv transport for peer {}", self.id))
            })?;

        let consumer = transport.consume(producer_id, rtp_capabilities, true).await?;
        let consumer_id = consumer.id();

        let transport_close = consumer.on_transport_close(Box::new({
            let peer = Arc::downgrade(self);
            let consumer_id = consumer_id.clone();
            move || {
                if let Some(peer) = peer.upgrade() {
                    let removed = peer
                        .consumers
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&consumer_id);
                    if removed.is_some() {
                        debug!("Consumer {} of peer {} closed with its transport", consumer_id, peer.id);
                    }
                }
            }
        }));
        let producer_close = consumer.on_producer_close(Box::new({
            let peer = Arc::downgrade(self);
            let consumer_id = consumer_id.clone();
            move || {
                let Some(peer) = peer.upgrade() else { return };
                let removed = {
                    let mut consumers = peer.consumers.lock().unwrap_or_else(|e| e.into_inner());
                    if consumers.contains_key(&consumer_id) {
                        // Notify before the consumer leaves the map
                        peer.send(&ServerMessage::ConsumerClosed { consumer_id: consumer_id.clone() });
                        consumers.remove(&consumer_id)
                    } else {
                        None
                    }
                };
                if removed.is_some() {
                    debug!("Consumer {} of peer {} closed with its producer", consumer_id, peer.id);
                }
            }
        }));

        let info = ConsumerInfo {
            id: consumer_id.clone(),
            producer_id: consumer.producer_id(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            producer_paused: consumer.producer_paused(),
        };

        let entry = PeerConsumer {
            consumer,
            _transport_close: transport_close,
            _producer_close: producer_close,
        };
        if let Err(entry) = self.track(&self.consumers, consumer_id.clone(), entry) {
            entry.consumer.close();
            return Err(MediaError::PeerNotFound(self.id.clone()));
        }

        room.metrics.inc_consumers_created();
        debug!(
            "Created consumer {} for peer {} in room {}",
            consumer_id, self.id, self.room_id
        );
        Ok(info)
    }

    /// Resumes one of this peer's consumers.
    ///
    /// # Errors
    /// Returns `ConsumerNotFound` if the consumer does not belong to this peer
    pub async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;

        let consumer = self
            .consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(consumer_id)
            .map(|c| c.consumer.clone())
            .ok_or_else(|| MediaError::ConsumerNotFound(consumer_id.to_string()))?;
        consumer.resume().await?;

        debug!("Resumed consumer {} for peer {}", consumer_id, self.id);
        Ok(())
    }

    /// Closes transports first (the engine cascades to their producers and
    /// consumers), then whatever producers and consumers are still tracked.
    /// Safe to call repeatedly.
    pub fn close(&self) {
        let first = !self.closed.swap(true, Ordering::SeqCst);

        let transports = std::mem::take(&mut *self.transports.lock().unwrap_or_else(|e| e.into_inner()));
        let producers = std::mem::take(&mut *self.producers.lock().unwrap_or_else(|e| e.into_inner()));
        let consumers = std::mem::take(&mut *self.consumers.lock().unwrap_or_else(|e| e.into_inner()));

        for entry in transports.values() {
            entry.transport.close();
        }
        for entry in producers.values() {
            entry.producer.close();
        }
        for entry in consumers.values() {
            entry.consumer.close();
        }

        if first {
            info!(
                "Closed peer {} in room {} ({} transports, {} producers, {} consumers)",
                self.id,
                self.room_id,
                transports.len(),
                producers.len(),
                consumers.len()
            );
        }
    }
}
