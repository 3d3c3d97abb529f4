#![forbid(unsafe_code)]

// mediasoup implementation of the media engine adapter.
// mediasoup closes routers, transports, producers and consumers when the last
// handle is dropped, so each wrapper keeps its handle in an Option and close()
// takes it out.

use crate::media::config::{MediaConfig, TransportConfig, WorkerConfig};
use crate::media::engine::{
    CloseCallback, DeathCallback, EngineConsumer, EngineProducer, EngineRouter, EngineTransport,
    EngineWorker, MediaEngine, Subscription,
};
use crate::media::types::{MediaError, MediaKind, MediaResult, TransportInfo};
use async_trait::async_trait;
use mediasoup::prelude::*;
use mediasoup::rtp_parameters::MediaKind as EngineKind;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use serde_json::Value;
use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroU8};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

fn engine_error(context: &str, error: impl std::fmt::Display) -> MediaError {
    MediaError::Engine(format!("{context}: {error}"))
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> MediaResult<T> {
    serde_json::from_value(value).map_err(|e| engine_error(&format!("invalid {what}"), e))
}

fn to_engine_kind(kind: MediaKind) -> EngineKind {
    match kind {
        MediaKind::Audio => EngineKind::Audio,
        MediaKind::Video => EngineKind::Video,
    }
}

fn from_engine_kind(kind: EngineKind) -> MediaKind {
    match kind {
        EngineKind::Audio => MediaKind::Audio,
        EngineKind::Video => MediaKind::Video,
    }
}

fn hz(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

/// Codec set offered by every room's router
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: None,
            clock_rate: hz(48000),
            channels: NonZeroU8::new(2).unwrap_or(NonZeroU8::MIN),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: None,
            clock_rate: hz(90000),
            parameters: RtpCodecParametersParameters::from([
                ("x-google-start-bitrate", 1000_u32.into()),
            ]),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: None,
            clock_rate: hz(90000),
            parameters: RtpCodecParametersParameters::from([
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
                ("level-asymmetry-allowed", 1_u32.into()),
            ]),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
    ]
}

fn worker_settings(config: &WorkerConfig) -> WorkerSettings {
    let mut settings = WorkerSettings::default();
    settings.log_level = WorkerLogLevel::Warn;
    settings.log_tags = vec![
        WorkerLogTag::Info,
        WorkerLogTag::Ice,
        WorkerLogTag::Dtls,
        WorkerLogTag::Rtp,
        WorkerLogTag::Rtcp,
    ];
    settings.rtc_port_range = config.rtc_min_port..=config.rtc_max_port;
    settings
}

fn listen_info(protocol: Protocol, ip: IpAddr, announced_ip: Option<IpAddr>) -> ListenInfo {
    ListenInfo {
        protocol,
        ip,
        announced_address: announced_ip.map(|ip| ip.to_string()),
        port: None,
        port_range: None,
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
        expose_internal_ip: false,
    }
}

fn transport_options(config: &TransportConfig) -> MediaResult<WebRtcTransportOptions> {
    let mut protocols = Vec::new();
    if config.enable_udp {
        protocols.push(Protocol::Udp);
    }
    if config.enable_tcp {
        protocols.push(Protocol::Tcp);
    }
    if !config.prefer_udp {
        protocols.reverse();
    }

    let mut protocols = protocols.into_iter();
    let first = protocols
        .next()
        .ok_or_else(|| MediaError::Engine("neither UDP nor TCP is enabled".to_string()))?;
    let mut listen_infos =
        WebRtcTransportListenInfos::new(listen_info(first, config.listen_ip, config.announced_ip));
    for protocol in protocols {
        listen_infos = listen_infos.insert(listen_info(protocol, config.listen_ip, config.announced_ip));
    }

    let mut options = WebRtcTransportOptions::new(listen_infos);
    options.initial_available_outgoing_bitrate = config.initial_available_outgoing_bitrate;
    Ok(options)
}

/// Engine backed by in-process mediasoup workers
pub struct MediasoupEngine {
    manager: mediasoup::worker_manager::WorkerManager,
    config: Arc<MediaConfig>,
}

impl MediasoupEngine {
    pub fn new(config: MediaConfig) -> Self {
        Self {
            manager: mediasoup::worker_manager::WorkerManager::new(),
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_worker(&self, index: usize) -> MediaResult<Arc<dyn EngineWorker>> {
        let worker = self
            .manager
            .create_worker(worker_settings(&self.config.worker_config))
            .await
            .map_err(|e| MediaError::Worker(format!("Failed to create worker {index}: {e}")))?;

        let alive = Arc::new(AtomicBool::new(true));
        let handler = worker.on_dead({
            let alive = alive.clone();
            move |_| alive.store(false, Ordering::SeqCst)
        });

        Ok(Arc::new(MediasoupWorker {
            worker,
            alive,
            _alive_watch: Mutex::new(handler),
        }))
    }
}

struct MediasoupWorker {
    worker: Worker,
    alive: Arc<AtomicBool>,
    _alive_watch: Mutex<HandlerId>,
}

#[async_trait]
impl EngineWorker for MediasoupWorker {
    fn id(&self) -> String {
        self.worker.id().to_string()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.worker.closed()
    }

    fn on_died(&self, callback: DeathCallback) -> Subscription {
        let handler = self.worker.on_dead(move |reason| callback(format!("{reason:?}")));
        Subscription::new(Mutex::new(handler))
    }

    async fn create_router(&self) -> MediaResult<Arc<dyn EngineRouter>> {
        let router = self
            .worker
            .create_router(RouterOptions::new(media_codecs()))
            .await
            .map_err(|e| engine_error("Failed to create router", e))?;

        let router_id = router.id().to_string();
        let on_close = router.on_close({
            let router_id = router_id.clone();
            move || debug!("Router {} closed", router_id)
        });

        Ok(Arc::new(MediasoupRouter {
            id: router_id,
            router: Mutex::new(Some(router)),
            _on_close: Mutex::new(on_close),
        }))
    }
}

struct MediasoupRouter {
    id: String,
    router: Mutex<Option<Router>>,
    _on_close: Mutex<HandlerId>,
}

impl MediasoupRouter {
    fn router(&self) -> MediaResult<Router> {
        self.router
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Engine(format!("router {} closed", self.id)))
    }
}

#[async_trait]
impl EngineRouter for MediasoupRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        self.router()
            .map(|router| to_json(router.rtp_capabilities()))
            .unwrap_or(Value::Null)
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(router) = self.router() else {
            return false;
        };
        let Ok(producer_id) = producer_id.parse::<ProducerId>() else {
            return false;
        };
        match serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) {
            Ok(capabilities) => router.can_consume(&producer_id, &capabilities),
            Err(e) => {
                debug!("Unparseable rtpCapabilities: {}", e);
                false
            }
        }
    }

    async fn create_webrtc_transport(
        &self,
        config: &TransportConfig,
    ) -> MediaResult<Arc<dyn EngineTransport>> {
        let router = self.router()?;
        let transport = router
            .create_webrtc_transport(transport_options(config)?)
            .await
            .map_err(|e| engine_error("Failed to create transport", e))?;

        let transport_id = transport.id().to_string();
        let handlers = vec![
            transport.on_dtls_state_change({
                let transport_id = transport_id.clone();
                move |state| debug!("DTLS state {:?} for transport {}", state, transport_id)
            }),
            transport.on_close({
                let transport_id = transport_id.clone();
                Box::new(move || debug!("Transport {} closed", transport_id))
            }),
        ];

        Ok(Arc::new(MediasoupTransport {
            id: transport_id,
            transport: Mutex::new(Some(transport)),
            _handlers: Mutex::new(handlers),
        }))
    }

    fn close(&self) {
        if self.router.lock().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            info!("Closed router {}", self.id);
        }
    }
}

struct MediasoupTransport {
    id: String,
    transport: Mutex<Option<WebRtcTransport>>,
    _handlers: Mutex<Vec<HandlerId>>,
}

impl MediasoupTransport {
    fn transport(&self) -> MediaResult<WebRtcTransport> {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Engine(format!("transport {} closed", self.id)))
    }
}

#[async_trait]
impl EngineTransport for MediasoupTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn info(&self) -> TransportInfo {
        match self.transport() {
            Ok(transport) => TransportInfo {
                id: self.id.clone(),
                ice_parameters: to_json(transport.ice_parameters()),
                ice_candidates: to_json(transport.ice_candidates()),
                dtls_parameters: to_json(&transport.dtls_parameters()),
            },
            Err(_) => TransportInfo {
                id: self.id.clone(),
                ice_parameters: Value::Null,
                ice_candidates: Value::Null,
                dtls_parameters: Value::Null,
            },
        }
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> MediaResult<()> {
        self.transport()?
            .set_max_incoming_bitrate(bitrate)
            .await
            .map_err(|e| engine_error("Failed to set max incoming bitrate", e))
    }

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()> {
        let dtls_parameters: DtlsParameters = from_json(dtls_parameters, "dtlsParameters")?;
        self.transport()?
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| engine_error("Failed to connect transport", e))
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Arc<dyn EngineProducer>> {
        let rtp_parameters: RtpParameters = from_json(rtp_parameters, "rtpParameters")?;
        let producer = self
            .transport()?
            .produce(ProducerOptions::new(to_engine_kind(kind), rtp_parameters))
            .await
            .map_err(|e| engine_error("Failed to create producer", e))?;

        Ok(Arc::new(MediasoupProducer {
            id: producer.id().to_string(),
            kind,
            producer: Mutex::new(Some(producer)),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn EngineConsumer>> {
        let producer_id: ProducerId = producer_id
            .parse()
            .map_err(|e| engine_error("invalid producer id", e))?;
        let rtp_capabilities: RtpCapabilities = from_json(rtp_capabilities, "rtpCapabilities")?;

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = paused;

        let consumer = self
            .transport()?
            .consume(options)
            .await
            .map_err(|e| engine_error("Failed to create consumer", e))?;

        Ok(Arc::new(MediasoupConsumer {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: from_engine_kind(consumer.kind()),
            rtp_parameters: to_json(consumer.rtp_parameters()),
            consumer_type: to_json(&consumer.r#type())
                .as_str()
                .unwrap_or("simple")
                .to_string(),
            producer_paused: consumer.producer_paused(),
            consumer: Mutex::new(Some(consumer)),
        }))
    }

    fn close(&self) {
        if self.transport.lock().unwrap_or_else(|e| e.into_inner()).take().is_none() {
            warn!("Transport {} already closed", self.id);
        }
    }
}

struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    producer: Mutex<Option<Producer>>,
}

impl EngineProducer for MediasoupProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.producer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|p| p.paused())
    }

    fn on_transport_close(&self, callback: CloseCallback) -> Subscription {
        match self.producer.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(producer) => Subscription::new(Mutex::new(producer.on_transport_close(callback))),
            None => Subscription::noop(),
        }
    }

    fn close(&self) {
        self.producer.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

struct MediasoupConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    consumer_type: String,
    producer_paused: bool,
    consumer: Mutex<Option<Consumer>>,
}

impl MediasoupConsumer {
    fn consumer(&self) -> MediaResult<Consumer> {
        self.consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Engine(format!("consumer {} closed", self.id)))
    }
}

#[async_trait]
impl EngineConsumer for MediasoupConsumer {
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
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> String {
        self.consumer_type.clone()
    }

    fn paused(&self) -> bool {
        self.consumer().map(|c| c.paused()).unwrap_or(true)
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused
    }

    async fn resume(&self) -> MediaResult<()> {
        self.consumer()?
            .resume()
            .await
            .map_err(|e| engine_error("Failed to resume consumer", e))
    }

    fn on_transport_close(&self, callback: CloseCallback) -> Subscription {
        match self.consumer() {
            Ok(consumer) => Subscription::new(Mutex::new(consumer.on_transport_close(callback))),
            Err(_) => Subscription::noop(),
        }
    }

    fn on_producer_close(&self, callback: CloseCallback) -> Subscription {
        match self.consumer() {
            Ok(consumer) => Subscription::new(Mutex::new(consumer.on_producer_close(callback))),
            Err(_) => Subscription::noop(),
        }
    }

    fn close(&self) {
        self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
