#![forbid(unsafe_code)]

// In-memory media engine for tests.
//
// Mirrors the engine's close semantics: closing a transport fires
// `transport closed` on its producers and consumers, and a closed producer
// fires `producer closed` on every consumer created from it.

use crate::media::config::TransportConfig;
use crate::media::engine::{
    CloseCallback, DeathCallback, EngineConsumer, EngineProducer, EngineRouter, EngineTransport,
    EngineWorker, MediaEngine, Subscription,
};
use crate::media::types::{MediaError, MediaKind, MediaResult, TransportInfo};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;

type HandlerMap<F> = Arc<Mutex<HashMap<usize, F>>>;

struct HandlerGuard<F: Send + 'static> {
    id: usize,
    map: Weak<Mutex<HashMap<usize, F>>>,
}

impl<F: Send + 'static> Drop for HandlerGuard<F> {
    fn drop(&mut self) {
        if let Some(map) = self.map.upgrade() {
            map.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.id);
        }
    }
}

static NEXT_HANDLER: AtomicUsize = AtomicUsize::new(0);

fn register<F: Send + 'static>(map: &HandlerMap<F>, callback: F) -> Subscription {
    let id = NEXT_HANDLER.fetch_add(1, Ordering::Relaxed);
    map.lock().unwrap_or_else(|e| e.into_inner()).insert(id, callback);
    Subscription::new(HandlerGuard { id, map: Arc::downgrade(map) })
}

/// Handlers are taken out before running so they may drop their own guards
fn fire(map: &HandlerMap<CloseCallback>) {
    let handlers = std::mem::take(&mut *map.lock().unwrap_or_else(|e| e.into_inner()));
    for (_, handler) in handlers {
        handler();
    }
}

#[derive(Default)]
struct EngineState {
    next_id: AtomicUsize,
    routers_created: AtomicUsize,
    routers_closed: AtomicUsize,
    fail_bitrate_cap: AtomicBool,
    workers: Mutex<Vec<Arc<FakeWorker>>>,
    transports: Mutex<HashMap<String, Weak<FakeTransport>>>,
    producers: Mutex<HashMap<String, Weak<FakeProducer>>>,
    gate: Mutex<Option<Arc<CallGate>>>,
    closed_ids: Mutex<HashSet<String>>,
}

impl EngineState {
    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn mark_closed(&self, id: &str) {
        self.closed_ids.lock().unwrap().insert(id.to_string());
    }

    /// Parks the calling engine operation while a gate is installed
    async fn pass_gate(&self) -> Option<Arc<CallGate>> {
        let gate = self.gate.lock().unwrap().clone()?;
        gate.entered.add_permits(1);
        gate.released.acquire().await.unwrap().forget();
        Some(gate)
    }
}

/// Holds transport, producer and consumer creation until released, so a test
/// can change peer or room state while the engine call is in flight.
pub struct CallGate {
    entered: Semaphore,
    released: Semaphore,
    created: Mutex<Vec<String>>,
}

impl CallGate {
    /// Waits until one call is parked at the gate
    pub async fn entered(&self) {
        self.entered.acquire().await.unwrap().forget();
    }

    /// Lets one parked call complete
    pub fn release(&self) {
        self.released.add_permits(1);
    }

    /// Ids of the objects created by calls that passed the gate
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    fn record(gate: Option<Arc<CallGate>>, id: &str) {
        if let Some(gate) = gate {
            gate.created.lock().unwrap().push(id.to_string());
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routers_created(&self) -> usize {
        self.state.routers_created.load(Ordering::SeqCst)
    }

    pub fn routers_closed(&self) -> usize {
        self.state.routers_closed.load(Ordering::SeqCst)
    }

    /// Makes every subsequent `set_max_incoming_bitrate` call fail
    pub fn fail_bitrate_cap(&self, fail: bool) {
        self.state.fail_bitrate_cap.store(fail, Ordering::SeqCst);
    }

    pub fn kill_worker(&self, index: usize, reason: &str) {
        let worker = self.state.workers.lock().unwrap().get(index).cloned();
        if let Some(worker) = worker {
            worker.alive.store(false, Ordering::SeqCst);
            let handlers = std::mem::take(&mut *worker.death_handlers.lock().unwrap());
            for (_, handler) in handlers {
                handler(reason.to_string());
            }
        }
    }

    pub fn transport(&self, transport_id: &str) -> Option<Arc<FakeTransport>> {
        self.state.transports.lock().unwrap().get(transport_id).and_then(Weak::upgrade)
    }

    pub fn close_transport(&self, transport_id: &str) {
        if let Some(transport) = self.transport(transport_id) {
            transport.close();
        }
    }

    pub fn producer(&self, producer_id: &str) -> Option<Arc<FakeProducer>> {
        self.state.producers.lock().unwrap().get(producer_id).and_then(Weak::upgrade)
    }

    /// Parks every later transport, producer or consumer creation at the returned gate
    pub fn gate_calls(&self) -> Arc<CallGate> {
        let gate = Arc::new(CallGate {
            entered: Semaphore::new(0),
            released: Semaphore::new(0),
            created: Mutex::new(Vec::new()),
        });
        *self.state.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Whether the transport, producer or consumer with this id was ever closed
    pub fn was_closed(&self, id: &str) -> bool {
        self.state.closed_ids.lock().unwrap().contains(id)
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_worker(&self, _index: usize) -> MediaResult<Arc<dyn EngineWorker>> {
        let worker = Arc::new(FakeWorker {
            id: self.state.next_id("worker"),
            alive: AtomicBool::new(true),
            death_handlers: Arc::new(Mutex::new(HashMap::new())),
            state: self.state.clone(),
        });
        self.state.workers.lock().unwrap().push(worker.clone());
        Ok(worker)
    }
}

pub struct FakeWorker {
    id: String,
    alive: AtomicBool,
    death_handlers: HandlerMap<DeathCallback>,
    state: Arc<EngineState>,
}

#[async_trait]
impl EngineWorker for FakeWorker {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn on_died(&self, callback: DeathCallback) -> Subscription {
        register(&self.death_handlers, callback)
    }

    async fn create_router(&self) -> MediaResult<Arc<dyn EngineRouter>> {
        // Suspend like a real IPC round trip so concurrent callers interleave
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        if !self.is_alive() {
            return Err(MediaError::Worker(format!("worker {} is dead", self.id)));
        }
        self.state.routers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeRouter {
            id: self.state.next_id("router"),
            closed: AtomicBool::new(false),
            state: self.state.clone(),
        }))
    }
}

pub struct FakeRouter {
    id: String,
    closed: AtomicBool,
    state: Arc<EngineState>,
}

#[async_trait]
impl EngineRouter for FakeRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        json!({
            "codecs": [
                { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
                { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
            ]
        })
    }

    /// Consumable when the capabilities list a codec of the producer's kind
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let producer = self.state.producers.lock().unwrap().get(producer_id).and_then(Weak::upgrade);
        let Some(producer) = producer.filter(|p| !p.closed.load(Ordering::SeqCst)) else {
            return false;
        };
        let kind = producer.kind.to_string();
        rtp_capabilities["codecs"]
            .as_array()
            .is_some_and(|codecs| codecs.iter().any(|c| c["kind"] == kind.as_str()))
    }

    async fn create_webrtc_transport(
        &self,
        _config: &TransportConfig,
    ) -> MediaResult<Arc<dyn EngineTransport>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Engine(format!("router {} closed", self.id)));
        }
        let gate = self.state.pass_gate().await;
        tokio::task::yield_now().await;
        let transport = Arc::new(FakeTransport {
            id: self.state.next_id("transport"),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            max_incoming_bitrate: Mutex::new(None),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            state: self.state.clone(),
        });
        self.state
            .transports
            .lock()
            .unwrap()
            .insert(transport.id.clone(), Arc::downgrade(&transport));
        CallGate::record(gate, &transport.id);
        Ok(transport)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.routers_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct FakeTransport {
    id: String,
    connected: AtomicBool,
    closed: AtomicBool,
    max_incoming_bitrate: Mutex<Option<u32>>,
    producers: Mutex<Vec<Arc<FakeProducer>>>,
    consumers: Mutex<Vec<Arc<FakeConsumer>>>,
    state: Arc<EngineState>,
}

impl FakeTransport {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn max_incoming_bitrate(&self) -> Option<u32> {
        *self.max_incoming_bitrate.lock().unwrap()
    }

    fn ensure_open(&self) -> MediaResult<()> {
        if self.is_closed() {
            return Err(MediaError::Engine(format!("transport {} closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineTransport for FakeTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            id: self.id.clone(),
            ice_parameters: json!({ "usernameFragment": format!("ufrag-{}", self.id), "password": "pwd", "iceLite": true }),
            ice_candidates: json!([{ "foundation": "udpcandidate", "ip": "127.0.0.1", "port": 10000, "protocol": "udp", "type": "host" }]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [{ "algorithm": "sha-256", "value": "00:11" }] }),
        }
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> MediaResult<()> {
        if self.state.fail_bitrate_cap.load(Ordering::SeqCst) {
            return Err(MediaError::Engine("bitrate cap rejected".to_string()));
        }
        *self.max_incoming_bitrate.lock().unwrap() = Some(bitrate);
        Ok(())
    }

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()> {
        self.ensure_open()?;
        tokio::task::yield_now().await;
        if !dtls_parameters["fingerprints"].is_array() {
            return Err(MediaError::Engine("invalid dtlsParameters".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Arc<dyn EngineProducer>> {
        self.ensure_open()?;
        let gate = self.state.pass_gate().await;
        tokio::task::yield_now().await;
        if !rtp_parameters.is_object() {
            return Err(MediaError::Engine("invalid rtpParameters".to_string()));
        }
        let producer = Arc::new(FakeProducer {
            id: self.state.next_id("producer"),
            kind,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            transport_close: Arc::new(Mutex::new(HashMap::new())),
            consumers: Mutex::new(Vec::new()),
            state: self.state.clone(),
        });
        self.state
            .producers
            .lock()
            .unwrap()
            .insert(producer.id.clone(), Arc::downgrade(&producer));
        self.producers.lock().unwrap().push(producer.clone());
        CallGate::record(gate, &producer.id);
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        _rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn EngineConsumer>> {
        self.ensure_open()?;
        let gate = self.state.pass_gate().await;
        tokio::task::yield_now().await;
        let producer = self
            .state
            .producers
            .lock()
            .unwrap()
            .get(producer_id)
            .and_then(Weak::upgrade)
            .filter(|p| !p.closed.load(Ordering::SeqCst))
            .ok_or_else(|| MediaError::Engine(format!("producer {producer_id} closed")))?;

        let consumer = Arc::new(FakeConsumer {
            id: self.state.next_id("consumer"),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            paused: AtomicBool::new(paused),
            producer_paused: producer.paused.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
            transport_close: Arc::new(Mutex::new(HashMap::new())),
            producer_close: Arc::new(Mutex::new(HashMap::new())),
            state: self.state.clone(),
        });
        producer.consumers.lock().unwrap().push(Arc::downgrade(&consumer));
        self.consumers.lock().unwrap().push(consumer.clone());
        CallGate::record(gate, &consumer.id);
        Ok(consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.mark_closed(&self.id);
        let producers = std::mem::take(&mut *self.producers.lock().unwrap());
        let consumers = std::mem::take(&mut *self.consumers.lock().unwrap());
        for producer in producers {
            producer.transport_closed();
        }
        for consumer in consumers {
            consumer.transport_closed();
        }
    }
}

pub struct FakeProducer {
    id: String,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
    transport_close: HandlerMap<CloseCallback>,
    consumers: Mutex<Vec<Weak<FakeConsumer>>>,
    state: Arc<EngineState>,
}

impl FakeProducer {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn transport_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.mark_closed(&self.id);
        fire(&self.transport_close);
        self.notify_consumers();
    }

    fn notify_consumers(&self) {
        let consumers = std::mem::take(&mut *self.consumers.lock().unwrap());
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.producer_closed();
        }
    }
}

impl EngineProducer for FakeProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn on_transport_close(&self, callback: CloseCallback) -> Subscription {
        register(&self.transport_close, callback)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.mark_closed(&self.id);
        self.notify_consumers();
    }
}

pub struct FakeConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    paused: AtomicBool,
    producer_paused: bool,
    closed: AtomicBool,
    transport_close: HandlerMap<CloseCallback>,
    producer_close: HandlerMap<CloseCallback>,
    state: Arc<EngineState>,
}

impl FakeConsumer {
    fn producer_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.mark_closed(&self.id);
            fire(&self.producer_close);
        }
    }

    fn transport_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.mark_closed(&self.id);
            fire(&self.transport_close);
        }
    }
}

#[async_trait]
impl EngineConsumer for FakeConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        json!({ "codecs": [], "encodings": [{ "ssrc": 1111 }] })
    }

    fn consumer_type(&self) -> String {
        "simple".to_string()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused
    }

    async fn resume(&self) -> MediaResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Engine(format!("consumer {} closed", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn on_transport_close(&self, callback: CloseCallback) -> Subscription {
        register(&self.transport_close, callback)
    }

    fn on_producer_close(&self, callback: CloseCallback) -> Subscription {
        register(&self.producer_close, callback)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.mark_closed(&self.id);
    }
}
