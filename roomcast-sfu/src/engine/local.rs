//! In-process media engine
//!
//! Keeps the full object graph (routers, transports, producers, consumers) and
//! its lifecycle rules without moving any media. Used by the server binary and
//! by tests that need realistic engine behaviour.

use super::{Consumer, EngineEvent, MediaEngine, Producer, Router, WebRtcTransport};
use crate::config::WebRtcTransportOptions;
use crate::media::{
    DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate, IceParameters,
    IceProtocol, MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters,
};
use crate::types::{ConsumerId, ProducerId, RouterId, TransportId};
use anyhow::{bail, Context};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Dynamic payload types handed out to router codecs
const PAYLOAD_TYPES: std::ops::RangeInclusive<u8> = 100..=127;

/// Round-robin port assignment over the configured RTC range
struct PortPool {
    min: u16,
    span: u32,
    next: AtomicU32,
}

impl PortPool {
    fn new(min: u16, max: u16) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            span: u32::from(max - min) + 1,
            next: AtomicU32::new(0),
        }
    }

    fn next_port(&self) -> u16 {
        let offset = self.next.fetch_add(1, Ordering::Relaxed) % self.span;
        u16::try_from(u32::from(self.min) + offset).unwrap_or(self.min)
    }
}

/// State shared by every object the engine creates
struct EngineShared {
    ports: PortPool,
    events: broadcast::Sender<EngineEvent>,
    transports: DashMap<TransportId, Weak<LocalTransport>>,
}

impl EngineShared {
    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

pub struct LocalMediaEngine {
    shared: Arc<EngineShared>,
}

impl LocalMediaEngine {
    #[must_use]
    pub fn new(rtc_min_port: u16, rtc_max_port: u16) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(EngineShared {
                ports: PortPool::new(rtc_min_port, rtc_max_port),
                events,
                transports: DashMap::new(),
            }),
        }
    }

    /// Mark a transport's DTLS session as failed and report it, as a real
    /// engine does when a peer connection breaks. Returns false if unknown.
    pub fn fail_transport(&self, transport_id: &TransportId) -> bool {
        let Some(transport) = self
            .shared
            .transports
            .get(transport_id)
            .and_then(|entry| entry.value().upgrade())
        else {
            return false;
        };

        *transport.dtls_state.lock() = DtlsState::Failed;
        self.shared.emit(EngineEvent::DtlsStateChanged {
            transport_id: transport_id.clone(),
            state: DtlsState::Failed,
        });
        true
    }
}

impl Default for LocalMediaEngine {
    fn default() -> Self {
        Self::new(30000, 31000)
    }
}

#[async_trait]
impl MediaEngine for LocalMediaEngine {
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> anyhow::Result<Arc<dyn Router>> {
        if media_codecs.is_empty() {
            bail!("router needs at least one media codec");
        }
        if media_codecs.len() > PAYLOAD_TYPES.len() {
            bail!(
                "router supports at most {} media codecs, got {}",
                PAYLOAD_TYPES.len(),
                media_codecs.len()
            );
        }

        let router = Arc::new(LocalRouter {
            shared: Arc::new(RouterShared {
                id: RouterId::new(Uuid::new_v4().to_string()),
                capabilities: router_capabilities(media_codecs),
                producers: DashMap::new(),
                transports: DashMap::new(),
            }),
            closed: AtomicBool::new(false),
            engine: Arc::clone(&self.shared),
        });

        info!(router_id = %router.shared.id, "Router created");
        Ok(router)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }
}

/// Assign payload types from 100 upward and default RTCP feedback
fn router_capabilities(media_codecs: Vec<RtpCodecCapability>) -> RtpCapabilities {
    let codecs = media_codecs
        .into_iter()
        .zip(PAYLOAD_TYPES)
        .map(|(mut codec, payload_type)| {
            codec.preferred_payload_type = Some(payload_type);
            if codec.rtcp_feedback.is_empty() {
                codec.rtcp_feedback = default_rtcp_feedback(codec.kind);
            }
            codec
        })
        .collect();

    RtpCapabilities {
        codecs,
        header_extensions: Vec::new(),
    }
}

fn default_rtcp_feedback(kind: MediaKind) -> Vec<RtcpFeedback> {
    let feedback = |kind: &str, parameter: &str| RtcpFeedback {
        kind: kind.to_string(),
        parameter: parameter.to_string(),
    };

    match kind {
        MediaKind::Audio => vec![feedback("transport-cc", "")],
        MediaKind::Video => vec![
            feedback("nack", ""),
            feedback("nack", "pli"),
            feedback("ccm", "fir"),
            feedback("goog-remb", ""),
            feedback("transport-cc", ""),
        ],
    }
}

fn generate_fingerprint() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Remove and return every value; never iterates while removing
fn drain<K, V>(map: &DashMap<K, Arc<V>>) -> Vec<Arc<V>>
where
    K: Eq + Hash + Clone,
{
    let keys: Vec<K> = map.iter().map(|entry| entry.key().clone()).collect();
    keys.iter()
        .filter_map(|key| map.remove(key).map(|(_, value)| value))
        .collect()
}

/// Router data transports need while the router is alive
struct RouterShared {
    id: RouterId,
    capabilities: RtpCapabilities,
    producers: DashMap<ProducerId, Arc<LocalProducer>>,
    transports: DashMap<TransportId, Arc<LocalTransport>>,
}

pub struct LocalRouter {
    shared: Arc<RouterShared>,
    closed: AtomicBool,
    engine: Arc<EngineShared>,
}

#[async_trait]
impl Router for LocalRouter {
    fn id(&self) -> RouterId {
        self.shared.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.shared.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        self.shared.producers.get(producer_id).is_some_and(|producer| {
            producer
                .rtp_parameters
                .codecs
                .iter()
                .any(|codec| rtp_capabilities.supports(&codec.mime_type))
        })
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> anyhow::Result<Arc<dyn WebRtcTransport>> {
        if self.closed.load(Ordering::Acquire) {
            bail!("router {} is closed", self.shared.id);
        }
        if !options.enable_udp && !options.enable_tcp {
            bail!("neither UDP nor TCP is enabled");
        }

        let port = self.engine.ports.next_port();
        let (udp_priority, tcp_priority) = if options.prefer_udp {
            (1_076_302_079, 1_076_276_479)
        } else {
            (1_076_276_479, 1_076_302_079)
        };
        let mut ice_candidates = Vec::new();
        if options.enable_udp {
            ice_candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: udp_priority,
                ip: options.public_ip().to_string(),
                protocol: IceProtocol::Udp,
                port,
                candidate_type: "host".to_string(),
                tcp_type: None,
            });
        }
        if options.enable_tcp {
            ice_candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: tcp_priority,
                ip: options.public_ip().to_string(),
                protocol: IceProtocol::Tcp,
                port,
                candidate_type: "host".to_string(),
                tcp_type: Some("passive".to_string()),
            });
        }

        let transport_id = TransportId::new(Uuid::new_v4().to_string());
        let transport = Arc::new_cyclic(|me| LocalTransport {
            id: transport_id.clone(),
            me: me.clone(),
            router: Arc::clone(&self.shared),
            ice_parameters: IceParameters {
                username_fragment: nanoid::nanoid!(16),
                password: nanoid::nanoid!(32),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Auto),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: generate_fingerprint(),
                }],
            },
            dtls_state: Mutex::new(DtlsState::New),
            producers: DashMap::new(),
            consumers: DashMap::new(),
            closed: AtomicBool::new(false),
            next_mid: AtomicU32::new(0),
            engine: Arc::clone(&self.engine),
        });

        self.shared
            .transports
            .insert(transport_id.clone(), Arc::clone(&transport));
        self.engine
            .transports
            .insert(transport_id.clone(), Arc::downgrade(&transport));

        debug!(
            router_id = %self.shared.id,
            transport_id = %transport_id,
            port,
            bitrate = options.initial_available_outgoing_bitrate,
            "WebRTC transport created"
        );
        Ok(transport)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for transport in drain(&self.shared.transports) {
            transport.close_internal();
        }
        self.shared.producers.clear();
        info!(router_id = %self.shared.id, "Router closed");
    }
}

pub struct LocalTransport {
    id: TransportId,
    me: Weak<LocalTransport>,
    router: Arc<RouterShared>,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    dtls_state: Mutex<DtlsState>,
    producers: DashMap<ProducerId, Arc<LocalProducer>>,
    consumers: DashMap<ConsumerId, Arc<LocalConsumer>>,
    closed: AtomicBool,
    next_mid: AtomicU32,
    engine: Arc<EngineShared>,
}

impl LocalTransport {
    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("transport {} is closed", self.id);
        }
        Ok(())
    }

    /// Close the transport together with everything it carries
    fn close_internal(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.dtls_state.lock() = DtlsState::Closed;
        self.engine.transports.remove(&self.id);
        self.router.transports.remove(&self.id);

        for producer in drain(&self.producers) {
            producer.close_internal();
            self.engine.emit(EngineEvent::ProducerClosed {
                producer_id: producer.id.clone(),
            });
        }
        for consumer in drain(&self.consumers) {
            consumer.close_internal();
        }

        self.engine.emit(EngineEvent::TransportClosed {
            transport_id: self.id.clone(),
        });
        debug!(transport_id = %self.id, "WebRTC transport closed");
    }
}

#[async_trait]
impl WebRtcTransport for LocalTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    fn dtls_state(&self) -> DtlsState {
        *self.dtls_state.lock()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> anyhow::Result<()> {
        self.ensure_open()?;
        if dtls_parameters.fingerprints.is_empty() {
            bail!("DTLS parameters carry no fingerprints");
        }

        {
            let mut state = self.dtls_state.lock();
            if *state != DtlsState::New {
                bail!("transport {} already connected", self.id);
            }
            *state = DtlsState::Connected;
        }

        self.engine.emit(EngineEvent::DtlsStateChanged {
            transport_id: self.id.clone(),
            state: DtlsState::Connected,
        });
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> anyhow::Result<Arc<dyn Producer>> {
        self.ensure_open()?;
        if rtp_parameters.codecs.is_empty() {
            bail!("RTP parameters carry no codecs");
        }
        for codec in &rtp_parameters.codecs {
            let capability = self
                .router
                .capabilities
                .codec(&codec.mime_type)
                .with_context(|| format!("unsupported codec {}", codec.mime_type))?;
            if capability.kind != kind {
                bail!("codec {} cannot carry {kind}", codec.mime_type);
            }
        }

        let producer_id = ProducerId::new(Uuid::new_v4().to_string());
        let producer = Arc::new(LocalProducer {
            id: producer_id.clone(),
            kind,
            rtp_parameters,
            transport: self.me.clone(),
            router: Arc::downgrade(&self.router),
            consumers: DashMap::new(),
            closed: AtomicBool::new(false),
        });

        self.producers
            .insert(producer_id.clone(), Arc::clone(&producer));
        self.router
            .producers
            .insert(producer_id.clone(), Arc::clone(&producer));

        debug!(transport_id = %self.id, producer_id = %producer_id, kind = %kind, "Producer created");
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> anyhow::Result<Arc<dyn Consumer>> {
        self.ensure_open()?;
        let producer = self
            .router
            .producers
            .get(&producer_id)
            .map(|entry| Arc::clone(entry.value()))
            .with_context(|| format!("producer {producer_id} not found"))?;

        let codecs: Vec<RtpCodecParameters> = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter_map(|codec| {
                rtp_capabilities
                    .codec(&codec.mime_type)
                    .map(|capability| RtpCodecParameters {
                        payload_type: capability
                            .preferred_payload_type
                            .unwrap_or(codec.payload_type),
                        ..codec.clone()
                    })
            })
            .collect();
        if codecs.is_empty() {
            bail!("receiver cannot decode any codec of producer {producer_id}");
        }

        let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
        let consumer_id = ConsumerId::new(Uuid::new_v4().to_string());
        let consumer = Arc::new(LocalConsumer {
            id: consumer_id.clone(),
            kind: producer.kind,
            rtp_parameters: RtpParameters {
                mid: Some(mid.to_string()),
                codecs,
                ..RtpParameters::default()
            },
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            transport: self.me.clone(),
            producer: Arc::downgrade(&producer),
        });

        producer
            .consumers
            .insert(consumer_id.clone(), Arc::clone(&consumer));
        if producer.closed.load(Ordering::Acquire) {
            producer.consumers.remove(&consumer_id);
            bail!("producer {producer_id} closed");
        }
        self.consumers
            .insert(consumer_id.clone(), Arc::clone(&consumer));

        debug!(
            transport_id = %self.id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            paused,
            "Consumer created"
        );
        Ok(consumer)
    }

    async fn close(&self) {
        self.close_internal();
    }
}

pub struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    transport: Weak<LocalTransport>,
    router: Weak<RouterShared>,
    consumers: DashMap<ConsumerId, Arc<LocalConsumer>>,
    closed: AtomicBool,
}

impl LocalProducer {
    fn close_internal(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.producers.remove(&self.id);
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.producers.remove(&self.id);
        }

        let consumers = drain(&self.consumers);
        for consumer in &consumers {
            consumer.close_internal();
        }
        debug!(
            producer_id = %self.id,
            closed_consumers = consumers.len(),
            "Producer closed"
        );
    }
}

#[async_trait]
impl Producer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) {
        self.close_internal();
    }
}

pub struct LocalConsumer {
    id: ConsumerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    transport: Weak<LocalTransport>,
    producer: Weak<LocalProducer>,
}

impl LocalConsumer {
    fn close_internal(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.consumers.remove(&self.id);
        }
        if let Some(producer) = self.producer.upgrade() {
            producer.consumers.remove(&self.id);
        }
    }
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn resume(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("consumer {} is closed", self.id);
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        self.close_internal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_media_codecs;
    use std::collections::BTreeMap;

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: Some(DtlsRole::Client),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    fn rtp(mime_type: &str) -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: mime_type.to_string(),
                payload_type: 96,
                clock_rate: if mime_type.starts_with("audio") { 48000 } else { 90000 },
                channels: None,
                parameters: BTreeMap::new(),
                rtcp_feedback: Vec::new(),
            }],
            ..RtpParameters::default()
        }
    }

    async fn router(engine: &LocalMediaEngine) -> Arc<dyn Router> {
        engine.create_router(default_media_codecs()).await.unwrap()
    }

    #[tokio::test]
    async fn test_router_assigns_payload_types() {
        let engine = LocalMediaEngine::default();
        let caps = router(&engine).await.rtp_capabilities();

        assert_eq!(caps.codecs[0].preferred_payload_type, Some(100));
        assert_eq!(caps.codecs[1].preferred_payload_type, Some(101));
        assert!(!caps.codecs[1].rtcp_feedback.is_empty());
    }

    #[tokio::test]
    async fn test_router_rejects_more_codecs_than_payload_types() {
        let engine = LocalMediaEngine::default();
        let codec = default_media_codecs().remove(0);

        let result = engine.create_router(vec![codec; 29]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ports_rotate_within_range() {
        let engine = LocalMediaEngine::new(40000, 40001);
        let router = router(&engine).await;
        let options = WebRtcTransportOptions::default();

        let mut ports = Vec::new();
        for _ in 0..3 {
            let transport = router.create_webrtc_transport(options.clone()).await.unwrap();
            ports.push(transport.ice_candidates()[0].port);
        }
        assert_eq!(ports, vec![40000, 40001, 40000]);
    }

    #[tokio::test]
    async fn test_connect_only_once() {
        let engine = LocalMediaEngine::default();
        let transport = router(&engine)
            .await
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();

        transport.connect(dtls()).await.unwrap();
        assert_eq!(transport.dtls_state(), DtlsState::Connected);

        let err = transport.connect(dtls()).await.unwrap_err();
        assert!(err.to_string().contains("already connected"));
    }

    #[tokio::test]
    async fn test_produce_rejects_unknown_codec() {
        let engine = LocalMediaEngine::default();
        let transport = router(&engine)
            .await
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();

        assert!(transport.produce(MediaKind::Video, rtp("video/VP9")).await.is_err());
        assert!(transport.produce(MediaKind::Video, rtp("audio/opus")).await.is_err());
        assert!(transport.produce(MediaKind::Audio, rtp("audio/opus")).await.is_ok());
    }

    #[tokio::test]
    async fn test_consume_unknown_producer_fails() {
        let engine = LocalMediaEngine::default();
        let router = router(&engine).await;
        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();

        let result = transport
            .consume(ProducerId::from("missing"), router.rtp_capabilities(), true)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_producer_close_closes_consumers() {
        let engine = LocalMediaEngine::default();
        let router = router(&engine).await;
        let options = WebRtcTransportOptions::default();
        let send = router.create_webrtc_transport(options.clone()).await.unwrap();
        let recv = router.create_webrtc_transport(options).await.unwrap();

        let producer = send.produce(MediaKind::Video, rtp("video/H264")).await.unwrap();
        assert!(router.can_consume(&producer.id(), &router.rtp_capabilities()));

        let consumer = recv
            .consume(producer.id(), router.rtp_capabilities(), true)
            .await
            .unwrap();
        assert!(consumer.paused());
        assert_eq!(consumer.rtp_parameters().codecs[0].payload_type, 101);

        producer.close().await;
        assert!(!router.can_consume(&producer.id(), &router.rtp_capabilities()));
        assert!(consumer.resume().await.is_err());
    }

    #[tokio::test]
    async fn test_transport_close_reports_producers() {
        let engine = LocalMediaEngine::default();
        let mut events = engine.subscribe_events();
        let router = router(&engine).await;
        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();
        let producer = transport.produce(MediaKind::Audio, rtp("audio/opus")).await.unwrap();

        transport.close().await;

        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::ProducerClosed { producer_id: producer.id() }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::TransportClosed { transport_id: transport.id() }
        );
        assert_eq!(transport.dtls_state(), DtlsState::Closed);
    }

    #[tokio::test]
    async fn test_fail_transport_emits_dtls_failure() {
        let engine = LocalMediaEngine::default();
        let mut events = engine.subscribe_events();
        let transport = router(&engine)
            .await
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();

        assert!(engine.fail_transport(&transport.id()));
        assert!(!engine.fail_transport(&TransportId::from("unknown")));
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::DtlsStateChanged {
                transport_id: transport.id(),
                state: DtlsState::Failed,
            }
        );
    }
}
