#![forbid(unsafe_code)]

// Room module - Room registry, membership and event fan-out
pub mod peer;
pub mod recording;

use crate::media::config::{MediaConfig, TransportConfig};
use crate::media::engine::{EngineRouter, MediaEngine};
use crate::media::types::{MediaError, MediaResult, ProducerSummary};
use crate::media::worker_manager::{FatalHandler, WorkerPool};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::ServerMessage;
use peer::Peer;
use recording::RecordingState;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info};

/// How many times a join retries when it lands on a room that is being torn down
const JOIN_ATTEMPTS: usize = 4;

/// Room state
pub struct Room {
    id: String,
    worker_id: String,
    router: Arc<dyn EngineRouter>,
    transport_config: Arc<TransportConfig>,
    metrics: ServerMetrics,
    peers: StdRwLock<HashMap<String, Arc<Peer>>>,
    recording: StdMutex<RecordingState>,
    /// Set under the peers write lock once the last peer leaves; no peer is
    /// ever added afterwards.
    closed: AtomicBool,
}

impl Room {
    fn new(
        id: String,
        worker_id: String,
        router: Arc<dyn EngineRouter>,
        transport_config: Arc<TransportConfig>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            id,
            worker_id,
            router,
            transport_config,
            metrics,
            peers: StdRwLock::new(HashMap::new()),
            recording: StdMutex::new(RecordingState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn rtp_capabilities(&self) -> Value {
        self.router.rtp_capabilities()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn peer(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).get(peer_id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Registers a new peer, sends it the `joined-room` snapshot of every
    /// producer already in the room and announces it to the others.
    ///
    /// # Errors
    /// Returns `PeerConflict` if `peer_id` is already joined, or `RoomNotFound`
    /// if the room has already been torn down
    pub fn add_peer(
        self: &Arc<Self>,
        peer_id: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> MediaResult<Arc<Peer>> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());

        if self.is_closed() {
            return Err(MediaError::RoomNotFound(self.id.clone()));
        }
        if peers.contains_key(peer_id) {
            return Err(MediaError::PeerConflict {
                room_id: self.id.clone(),
                peer_id: peer_id.to_string(),
            });
        }

        let producers: Vec<ProducerSummary> =
            peers.values().flat_map(|p| p.producer_summaries()).collect();

        let peer = Arc::new(Peer::new(
            peer_id.to_string(),
            self.id.clone(),
            Arc::downgrade(self),
            sender,
        ));
        peer.send(&ServerMessage::JoinedRoom { producers });

        self.broadcast_locked(&peers, peer_id, &ServerMessage::PeerJoined {
            peer_id: peer_id.to_string(),
        });
        peers.insert(peer_id.to_string(), peer.clone());

        info!("Peer {} joined room {} ({} peers)", peer_id, self.id, peers.len());
        Ok(peer)
    }

    /// Closes and removes a peer. Returns `None` if it was not joined, otherwise
    /// whether the room is now empty (and closed).
    pub fn remove_peer(&self, peer_id: &str) -> Option<bool> {
        self.detach(peer_id, None)
    }

    /// Removes `peer_id`, but only if it is still the `expected` instance
    fn detach(&self, peer_id: &str, expected: Option<&Arc<Peer>>) -> Option<bool> {
        let (peer, now_empty) = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            let current = peers.get(peer_id)?;
            if expected.is_some_and(|e| !Arc::ptr_eq(e, current)) {
                return None;
            }
            let peer = peers.remove(peer_id)?;
            let now_empty = peers.is_empty();
            if now_empty {
                self.closed.store(true, Ordering::SeqCst);
            }
            self.broadcast_locked(&peers, peer_id, &ServerMessage::PeerLeft {
                peer_id: peer_id.to_string(),
            });
            (peer, now_empty)
        };

        // Outside the room lock: closing fires engine close events that other
        // peers handle
        peer.close();
        info!("Peer {} left room {}", peer_id, self.id);
        Some(now_empty)
    }

    /// Fan out to every peer but `sender_id`; the caller holds the peers lock
    fn broadcast_locked(
        &self,
        peers: &HashMap<String, Arc<Peer>>,
        sender_id: &str,
        message: &ServerMessage,
    ) {
        let Some(json) = message.to_shared() else {
            return;
        };
        for (id, peer) in peers {
            if id != sender_id {
                peer.send_raw(json.clone());
            }
        }
    }

    /// Producer ids share one namespace per room; the requester's own
    /// producers are checked first.
    fn has_producer(&self, requester_id: &str, producer_id: &str) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        if peers.get(requester_id).is_some_and(|p| p.has_producer(producer_id)) {
            return true;
        }
        peers
            .iter()
            .filter(|(id, _)| id.as_str() != requester_id)
            .any(|(_, p)| p.has_producer(producer_id))
    }

    /// # Errors
    /// Returns `InvalidState` if the room is already recording
    pub fn start_recording(&self, recording_id: &str) -> MediaResult<()> {
        self.recording
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .start(recording_id.to_string())?;
        info!("Started recording {} for room {}", recording_id, self.id);
        Ok(())
    }

    /// Returns the id the recording was started with.
    ///
    /// # Errors
    /// Returns `InvalidState` if the room is not recording
    pub fn stop_recording(&self) -> MediaResult<String> {
        let recording_id = self.recording.lock().unwrap_or_else(|e| e.into_inner()).stop()?;
        info!("Stopped recording {} for room {}", recording_id, self.id);
        Ok(recording_id)
    }

    /// Closes every peer and marks the room closed
    fn close_all(&self) -> usize {
        let peers: Vec<Arc<Peer>> = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            self.closed.store(true, Ordering::SeqCst);
            peers.drain().map(|(_, p)| p).collect()
        };
        for peer in &peers {
            peer.close();
        }
        peers.len()
    }
}

type RoomSlot = Arc<OnceCell<Arc<Room>>>;

/// Room registry and the service object handed to every signaling handler.
///
/// The outer HashMap is protected by a std::sync::RwLock held only for brief
/// lookups/inserts, never across await points. Each entry is a `OnceCell`, so
/// concurrent first joins of one room id all wait on a single router creation.
pub struct RoomManager {
    rooms: StdRwLock<HashMap<String, RoomSlot>>,
    workers: WorkerPool,
    transport_config: Arc<TransportConfig>,
    metrics: ServerMetrics,
}

impl RoomManager {
    pub fn new(workers: WorkerPool, transport_config: TransportConfig, metrics: ServerMetrics) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            workers,
            transport_config: Arc::new(transport_config),
            metrics,
        }
    }

    /// Creates the worker pool and the registry around it
    ///
    /// # Errors
    /// Returns an error if any worker fails to start
    pub async fn initialize(
        engine: &dyn MediaEngine,
        config: &MediaConfig,
        metrics: ServerMetrics,
        on_fatal: FatalHandler,
    ) -> MediaResult<Self> {
        let workers =
            WorkerPool::initialize(engine, config.worker_config.num_workers, on_fatal).await?;
        Ok(Self::new(workers, config.transport_config.clone(), metrics))
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Gets an existing room (brief outer read lock, no await)
    ///
    /// # Errors
    /// Returns `RoomNotFound` if the room does not exist
    pub fn get_room(&self, room_id: &str) -> MediaResult<Arc<Room>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(room_id)
            .and_then(|slot| slot.get().cloned())
            .ok_or_else(|| MediaError::RoomNotFound(room_id.to_string()))
    }

    /// Gets a joined peer
    ///
    /// # Errors
    /// Returns `RoomNotFound` or `PeerNotFound`
    pub fn get_peer(&self, room_id: &str, peer_id: &str) -> MediaResult<Arc<Peer>> {
        self.get_room(room_id)?
            .peer(peer_id)
            .ok_or_else(|| MediaError::PeerNotFound(peer_id.to_string()))
    }

    /// Gets or creates a room, creating its router on a round-robin worker exactly once
    ///
    /// # Errors
    /// Returns an error if router creation fails; the next call retries it
    pub async fn get_or_create(&self, room_id: &str) -> MediaResult<Arc<Room>> {
        // Fast path: slot exists (brief outer read lock)
        let existing = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.get(room_id).cloned()
        };
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                rooms.entry(room_id.to_string()).or_default().clone()
            }
        };

        let room = slot.get_or_try_init(|| self.create_room(room_id)).await?;
        Ok(room.clone())
    }

    async fn create_room(&self, room_id: &str) -> MediaResult<Arc<Room>> {
        let worker = self.workers.next_worker();
        info!("Creating new room {} on worker {}", room_id, worker.id());

        let router = worker.create_router().await?;
        debug!("Created router {} for room {}", router.id(), room_id);
        self.metrics.inc_rooms_created();

        Ok(Arc::new(Room::new(
            room_id.to_string(),
            worker.id(),
            router,
            self.transport_config.clone(),
            self.metrics.clone(),
        )))
    }

    /// Router capabilities of a room, creating the room on first use
    ///
    /// # Errors
    /// Returns an error if the room cannot be created
    pub async fn rtp_capabilities(&self, room_id: &str) -> MediaResult<Value> {
        Ok(self.get_or_create(room_id).await?.rtp_capabilities())
    }

    /// Joins `peer_id` to `room_id`, creating the room if needed.
    ///
    /// # Errors
    /// Returns `PeerConflict` if the id is taken in that room, or an engine
    /// error if the room cannot be created
    pub async fn join_room(
        &self,
        room_id: &str,
        peer_id: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> MediaResult<Arc<Peer>> {
        for _ in 0..JOIN_ATTEMPTS {
            let room = self.get_or_create(room_id).await?;
            match room.add_peer(peer_id, sender.clone()) {
                Ok(peer) => {
                    self.metrics.inc_joins();
                    return Ok(peer);
                }
                Err(MediaError::RoomNotFound(_)) if room.is_closed() => {
                    // The last peer left while we were joining; make sure the
                    // dead room is unregistered and start over on a fresh one
                    debug!("Room {} closed during join of {}, retrying", room_id, peer_id);
                    self.unregister(room_id, &room);
                }
                Err(e) => return Err(e),
            }
        }
        Err(MediaError::InvalidState(format!("room {room_id} is closing")))
    }

    /// Removes a peer by id, tearing the room down when it empties
    ///
    /// # Errors
    /// Returns `RoomNotFound` or `PeerNotFound`
    pub fn leave_room(&self, room_id: &str, peer_id: &str) -> MediaResult<()> {
        let room = self.get_room(room_id)?;
        let now_empty = room
            .remove_peer(peer_id)
            .ok_or_else(|| MediaError::PeerNotFound(peer_id.to_string()))?;
        self.after_leave(&room, now_empty);
        Ok(())
    }

    /// Removes this exact peer instance; a newer peer that reused the id is left alone
    pub fn leave(&self, peer: &Arc<Peer>) {
        let Ok(room) = self.get_room(peer.room_id()) else {
            peer.close();
            return;
        };
        match room.detach(peer.id(), Some(peer)) {
            Some(now_empty) => self.after_leave(&room, now_empty),
            None => peer.close(),
        }
    }

    fn after_leave(&self, room: &Arc<Room>, now_empty: bool) {
        self.metrics.inc_leaves();
        if now_empty {
            self.remove_room(room);
        }
    }

    /// Drops the mapping if it still points at `room`
    fn unregister(&self, room_id: &str, room: &Arc<Room>) -> bool {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let current = rooms
            .get(room_id)
            .and_then(|slot| slot.get())
            .is_some_and(|r| Arc::ptr_eq(r, room));
        if current {
            rooms.remove(room_id);
        }
        current
    }

    /// Unregisters an emptied room and closes its router
    fn remove_room(&self, room: &Arc<Room>) {
        self.unregister(&room.id, room);
        room.router.close();
        self.metrics.inc_rooms_closed();
        info!("Room {} is empty, cleaning up", room.id);
    }

    /// # Errors
    /// Returns `RoomNotFound`, or `InvalidState` if already recording
    pub fn start_recording(&self, room_id: &str, recording_id: &str) -> MediaResult<()> {
        self.get_room(room_id)?.start_recording(recording_id)
    }

    /// # Errors
    /// Returns `RoomNotFound`, or `InvalidState` if not recording
    pub fn stop_recording(&self, room_id: &str) -> MediaResult<String> {
        self.get_room(room_id)?.stop_recording()
    }

    /// Gracefully shuts down all rooms: closes every peer, then every router.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");

        let all_rooms: Vec<Arc<Room>> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().filter_map(|(_, slot)| slot.get().cloned()).collect()
        };

        for room in &all_rooms {
            let closed_peers = room.close_all();
            room.router.close();
            self.metrics.inc_rooms_closed();
            info!("Shut down room {} ({} peers)", room.id, closed_peers);
        }

        info!("All rooms shut down ({} total)", all_rooms.len());
    }

    /// Gets current room count
    pub fn room_count(&self) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.values().filter(|slot| slot.initialized()).count()
    }

    /// Gets total peer count across all rooms
    pub fn peer_count(&self) -> usize {
        let rooms: Vec<Arc<Room>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().filter_map(|slot| slot.get().cloned()).collect()
        };
        rooms.iter().map(|room| room.peer_count()).sum()
    }
}
