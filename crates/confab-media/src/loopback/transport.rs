use super::{EngineInner, EngineOp, LoopbackRouter, PortRange};
use crate::codec;
use crate::engine::{ConsumeRequest, Consumer, ProduceRequest, Producer, Transport, WebRtcTransportSettings};
use crate::error::EngineError;
use crate::signal::{CloseNotifier, CloseReason, CloseSignal};
use async_trait::async_trait;
use confab_protocol::{
    AppData, ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters,
    MediaKind, ProducerId, Protocol, RtpEncodingParameters, RtpParameters, SctpParameters,
    TransportId, TransportOptions,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

const UDP_PRIORITY: u32 = 1_076_302_079;
const TCP_PRIORITY: u32 = 1_076_276_479;

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn candidates(settings: &WebRtcTransportSettings, ports: &PortRange) -> Vec<IceCandidate> {
    let (udp_priority, tcp_priority) = if settings.prefer_udp {
        (UDP_PRIORITY, TCP_PRIORITY)
    } else {
        (TCP_PRIORITY, UDP_PRIORITY)
    };

    let mut candidates = Vec::new();
    for (index, listen) in settings.listen_ips.iter().enumerate() {
        let ip = listen
            .announced_ip
            .clone()
            .unwrap_or_else(|| listen.ip.clone());
        if settings.enable_udp {
            candidates.push(IceCandidate {
                foundation: format!("udpcandidate{index}"),
                priority: udp_priority,
                ip: ip.clone(),
                protocol: Protocol::Udp,
                port: ports.next(),
                candidate_type: "host".to_string(),
                tcp_type: None,
            });
        }
        if settings.enable_tcp {
            candidates.push(IceCandidate {
                foundation: format!("tcpcandidate{index}"),
                priority: tcp_priority,
                ip,
                protocol: Protocol::Tcp,
                port: ports.next(),
                candidate_type: "host".to_string(),
                tcp_type: Some("passive".to_string()),
            });
        }
    }
    candidates
}

pub struct LoopbackTransport {
    id: TransportId,
    options: TransportOptions,
    router: Weak<LoopbackRouter>,
    engine: Weak<EngineInner>,
    me: Weak<LoopbackTransport>,
    connected: AtomicBool,
    next_mid: AtomicU32,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
    notifier: CloseNotifier,
}

impl LoopbackTransport {
    pub(super) fn new(
        router: Weak<LoopbackRouter>,
        engine: Weak<EngineInner>,
        settings: &WebRtcTransportSettings,
        ports: &PortRange,
    ) -> Arc<Self> {
        let id = TransportId::new();
        let options = TransportOptions {
            id,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: candidates(settings, ports),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
            sctp_parameters: settings.enable_sctp.then_some(SctpParameters {
                port: 5000,
                os: 1024,
                mis: 1024,
                max_message_size: settings.max_sctp_message_size,
            }),
        };

        Arc::new_cyclic(|me| Self {
            id,
            options,
            router,
            engine,
            me: me.clone(),
            connected: AtomicBool::new(false),
            next_mid: AtomicU32::new(0),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            notifier: CloseNotifier::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Simulate the remote end tearing down the DTLS session
    pub async fn close_dtls(&self) {
        self.shutdown(CloseReason::DtlsClosed).await;
    }

    pub async fn producer_count(&self) -> usize {
        self.producers.lock().await.len()
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.lock().await.len()
    }

    pub(super) async fn shutdown(&self, reason: CloseReason) {
        if !self.notifier.close(reason) {
            return;
        }
        let producers = std::mem::take(&mut *self.producers.lock().await);
        for producer in producers {
            producer.shutdown(CloseReason::TransportClosed).await;
        }
        let consumers = std::mem::take(&mut *self.consumers.lock().await);
        for consumer in consumers {
            consumer.shutdown(CloseReason::TransportClosed).await;
        }
        if let Some(router) = self.router.upgrade() {
            router.forget_transport(self.id).await;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.transports.lock().await.remove(&self.id);
        }
    }

    async fn check(&self, op: EngineOp) -> Result<(), EngineError> {
        if let Some(engine) = self.engine.upgrade() {
            engine.faults.check(op).await?;
        }
        if self.is_closed() {
            return Err(EngineError::TransportClosed);
        }
        Ok(())
    }

    async fn forget_producer(&self, id: ProducerId) {
        self.producers.lock().await.retain(|p| p.id != id);
    }

    async fn forget_consumer(&self, id: ConsumerId) {
        self.consumers.lock().await.retain(|c| c.id != id);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn options(&self) -> TransportOptions {
        self.options.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        self.check(EngineOp::Connect).await?;
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Rejected("no DTLS fingerprint given".to_string()));
        }
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyConnected);
        }
        Ok(())
    }

    async fn produce(&self, request: ProduceRequest) -> Result<Arc<dyn Producer>, EngineError> {
        self.check(EngineOp::Produce).await?;
        let router = self.router.upgrade().ok_or(EngineError::RouterClosed)?;

        let Some(first) = request.rtp_parameters.codecs.first() else {
            return Err(EngineError::Rejected("rtp parameters carry no codec".to_string()));
        };
        let prefix = request.kind.mime_prefix();
        let kind_matches = first
            .mime_type
            .get(..prefix.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(prefix));
        if !kind_matches {
            return Err(EngineError::KindMismatch {
                kind: request.kind,
                mime_type: first.mime_type.clone(),
            });
        }
        if !codec::supports(router.codecs(), first) {
            return Err(EngineError::Unsupported(format!(
                "codec {} is not enabled on this router",
                first.mime_type
            )));
        }

        let producer = Arc::new(LoopbackProducer {
            id: ProducerId::new(),
            kind: request.kind,
            rtp_parameters: request.rtp_parameters,
            app_data: request.app_data,
            router: self.router.clone(),
            transport: self.me.clone(),
            consumers: Mutex::new(Vec::new()),
            notifier: CloseNotifier::new(),
        });
        router.register_producer(&producer).await;
        self.producers.lock().await.push(producer.clone());
        Ok(producer)
    }

    async fn consume(&self, request: ConsumeRequest) -> Result<Arc<dyn Consumer>, EngineError> {
        let router = self.router.upgrade().ok_or(EngineError::RouterClosed)?;
        let producer = router
            .live_producer(request.producer_id)
            .await
            .ok_or(EngineError::UnknownProducer(request.producer_id))?;
        self.check(EngineOp::Consume).await?;

        let codecs: Vec<_> = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter(|c| {
                codec::supports(&request.rtp_capabilities.codecs, c)
                    && codec::supports(router.codecs(), c)
            })
            .cloned()
            .collect();
        if codecs.is_empty() {
            return Err(EngineError::Unsupported(
                "no common codec with the consuming device".to_string(),
            ));
        }

        let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
        let consumer = Arc::new(LoopbackConsumer {
            id: ConsumerId::new(),
            producer_id: producer.id,
            kind: producer.kind,
            rtp_parameters: RtpParameters {
                mid: Some(mid.to_string()),
                codecs,
                encodings: vec![RtpEncodingParameters {
                    ssrc: Some(rand::random()),
                    ..Default::default()
                }],
            },
            paused: AtomicBool::new(request.paused),
            engine: self.engine.clone(),
            transport: self.me.clone(),
            notifier: CloseNotifier::new(),
        });
        {
            let mut consumers = producer.consumers.lock().await;
            consumers.retain(|c| c.upgrade().is_some_and(|c| !c.is_closed()));
            consumers.push(Arc::downgrade(&consumer));
        }
        self.consumers.lock().await.push(consumer.clone());

        // The producer may have gone away while we were wiring the consumer up
        if producer.is_closed() {
            consumer.shutdown(CloseReason::ProducerClosed).await;
        }
        Ok(consumer)
    }

    async fn close(&self) {
        self.shutdown(CloseReason::Closed).await;
    }

    fn is_closed(&self) -> bool {
        self.notifier.is_closed()
    }

    fn closed(&self) -> CloseSignal {
        self.notifier.subscribe()
    }
}

pub struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    app_data: AppData,
    router: Weak<LoopbackRouter>,
    transport: Weak<LoopbackTransport>,
    consumers: Mutex<Vec<Weak<LoopbackConsumer>>>,
    notifier: CloseNotifier,
}

impl LoopbackProducer {
    pub(super) fn rtp_parameters_ref(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    pub fn app_data(&self) -> &AppData {
        &self.app_data
    }

    async fn shutdown(&self, reason: CloseReason) {
        if !self.notifier.close(reason) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.forget_producer(self.id).await;
        }
        if reason != CloseReason::TransportClosed {
            if let Some(transport) = self.transport.upgrade() {
                transport.forget_producer(self.id).await;
            }
        }
        let consumers = std::mem::take(&mut *self.consumers.lock().await);
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.shutdown(CloseReason::ProducerClosed).await;
        }
    }
}

#[async_trait]
impl Producer for LoopbackProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn close(&self) {
        self.shutdown(CloseReason::Closed).await;
    }

    fn is_closed(&self) -> bool {
        self.notifier.is_closed()
    }

    fn closed(&self) -> CloseSignal {
        self.notifier.subscribe()
    }
}

pub struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    engine: Weak<EngineInner>,
    transport: Weak<LoopbackTransport>,
    notifier: CloseNotifier,
}

impl LoopbackConsumer {
    async fn shutdown(&self, reason: CloseReason) {
        if !self.notifier.close(reason) {
            return;
        }
        self.paused.store(true, Ordering::Release);
        if reason != CloseReason::TransportClosed {
            if let Some(transport) = self.transport.upgrade() {
                transport.forget_consumer(self.id).await;
            }
        }
    }
}

#[async_trait]
impl Consumer for LoopbackConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if let Some(engine) = self.engine.upgrade() {
            engine.faults.check(EngineOp::Resume).await?;
        }
        if self.is_closed() {
            return Err(EngineError::ConsumerClosed);
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        self.shutdown(CloseReason::Closed).await;
    }

    fn is_closed(&self) -> bool {
        self.notifier.is_closed()
    }

    fn closed(&self) -> CloseSignal {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MediaEngine, Router, Worker, WorkerSettings};
    use crate::loopback::LoopbackEngine;
    use confab_protocol::{RtpCapabilities, RtpCodecParameters};
    use serde_json::Map;

    fn opus() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: Map::new(),
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1111),
                ..Default::default()
            }],
        }
    }

    async fn setup() -> (LoopbackEngine, Arc<dyn Worker>, Arc<dyn Router>) {
        let engine = LoopbackEngine::new();
        let worker = engine.create_worker(&WorkerSettings::default()).await.unwrap();
        let router = worker.create_router(&codec::router_codecs()).await.unwrap();
        (engine, worker, router)
    }

    async fn transport(router: &Arc<dyn Router>) -> Arc<dyn Transport> {
        router
            .create_webrtc_transport(&WebRtcTransportSettings::default())
            .await
            .unwrap()
    }

    fn produce_audio() -> ProduceRequest {
        ProduceRequest {
            kind: MediaKind::Audio,
            rtp_parameters: opus(),
            app_data: AppData::default(),
        }
    }

    #[tokio::test]
    async fn transport_options_follow_settings() {
        let (_engine, _worker, router) = setup().await;
        let mut settings = WebRtcTransportSettings::default();
        settings.listen_ips[0].announced_ip = Some("203.0.113.7".to_string());
        settings.enable_sctp = false;

        let options = router.create_webrtc_transport(&settings).await.unwrap().options();

        assert_eq!(options.ice_candidates.len(), 2);
        assert!(options.ice_candidates.iter().all(|c| c.ip == "203.0.113.7"));
        assert!(options.ice_candidates[0].priority > options.ice_candidates[1].priority);
        assert_eq!(options.ice_candidates[0].protocol, Protocol::Udp);
        assert!(options.sctp_parameters.is_none());
    }

    #[tokio::test]
    async fn connect_needs_fingerprint_and_happens_once() {
        let (_engine, _worker, router) = setup().await;
        let transport = transport(&router).await;
        let client_dtls = transport.options().dtls_parameters;

        let empty = DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![],
        };
        assert!(transport.connect(empty).await.is_err());
        assert!(transport.connect(client_dtls.clone()).await.is_ok());
        assert_eq!(
            transport.connect(client_dtls).await,
            Err(EngineError::AlreadyConnected)
        );
    }

    #[tokio::test]
    async fn produce_rejects_kind_mismatch() {
        let (_engine, _worker, router) = setup().await;
        let transport = transport(&router).await;

        let mut request = produce_audio();
        request.kind = MediaKind::Video;
        assert!(matches!(
            transport.produce(request).await.err(),
            Some(EngineError::KindMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn consumer_starts_paused_and_follows_producer() {
        let (_engine, _worker, router) = setup().await;
        let send = transport(&router).await;
        let recv = transport(&router).await;

        let producer = send.produce(produce_audio()).await.unwrap();
        let caps = router.rtp_capabilities();
        assert!(router.can_consume(producer.id(), &caps).await);

        let consumer = recv
            .consume(ConsumeRequest {
                producer_id: producer.id(),
                rtp_capabilities: caps,
                paused: true,
            })
            .await
            .unwrap();
        assert!(consumer.is_paused());
        consumer.resume().await.unwrap();
        assert!(!consumer.is_paused());

        let signal = consumer.closed();
        producer.close().await;
        assert_eq!(signal.wait().await, CloseReason::ProducerClosed);
        assert!(!router.can_consume(producer.id(), &router.rtp_capabilities()).await);
    }

    #[tokio::test]
    async fn closed_consumers_are_pruned_from_their_producer() {
        let (engine, _worker, router) = setup().await;
        let send = transport(&router).await;
        let recv = transport(&router).await;
        let producer = send.produce(produce_audio()).await.unwrap();
        let request = || ConsumeRequest {
            producer_id: producer.id(),
            rtp_capabilities: router.rtp_capabilities(),
            paused: true,
        };

        for _ in 0..3 {
            recv.consume(request()).await.unwrap().close().await;
        }
        let live = recv.consume(request()).await.unwrap();

        let loopback = engine.transport(send.id()).await.unwrap();
        let tracked = loopback.producers.lock().await[0].consumers.lock().await.len();
        assert_eq!(tracked, 1);
        assert!(!live.is_closed());
        assert_eq!(engine.transport(recv.id()).await.unwrap().consumer_count().await, 1);
    }

    #[tokio::test]
    async fn can_consume_requires_common_codec() {
        let (_engine, _worker, router) = setup().await;
        let send = transport(&router).await;
        let producer = send.produce(produce_audio()).await.unwrap();

        let video_only = RtpCapabilities {
            codecs: router
                .rtp_capabilities()
                .codecs
                .into_iter()
                .filter(|c| c.kind == MediaKind::Video)
                .collect(),
        };
        assert!(!router.can_consume(producer.id(), &video_only).await);
    }

    #[tokio::test]
    async fn dtls_close_cascades_to_children() {
        let (engine, _worker, router) = setup().await;
        let send = transport(&router).await;
        let recv = transport(&router).await;
        let producer = send.produce(produce_audio()).await.unwrap();
        let consumer = recv
            .consume(ConsumeRequest {
                producer_id: producer.id(),
                rtp_capabilities: router.rtp_capabilities(),
                paused: true,
            })
            .await
            .unwrap();

        let loopback = engine.transport(send.id()).await.unwrap();
        loopback.close_dtls().await;

        assert_eq!(send.closed().wait().await, CloseReason::DtlsClosed);
        assert_eq!(producer.closed().wait().await, CloseReason::TransportClosed);
        assert_eq!(consumer.closed().wait().await, CloseReason::ProducerClosed);
        assert!(engine.transport(send.id()).await.is_none());
        assert_eq!(engine.transport(recv.id()).await.unwrap().consumer_count().await, 0);
    }
}
