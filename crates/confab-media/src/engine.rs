//! Media engine boundary
//!
//! The engine does the actual RTP/SRTP forwarding and the ICE/DTLS handshakes.
//! The SFU only drives it through these handles.

use crate::error::EngineError;
use crate::signal::CloseSignal;
use async_trait::async_trait;
use confab_protocol::{
    AppData, ConsumerId, DtlsParameters, MediaKind, ProducerId, RouterId, RtpCapabilities,
    RtpCodecCapability, RtpParameters, TransportId, TransportOptions,
};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of an engine worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Settings passed to every worker the engine spawns
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub log_level: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

/// Local address a transport listens on, with the address announced to clients
#[derive(Debug, Clone)]
pub struct ListenIp {
    pub ip: String,
    pub announced_ip: Option<String>,
}

/// Fixed network parameters for WebRTC transports
#[derive(Debug, Clone)]
pub struct WebRtcTransportSettings {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub enable_sctp: bool,
    pub max_sctp_message_size: u32,
    pub initial_available_outgoing_bitrate: u32,
    pub min_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
}

impl Default for WebRtcTransportSettings {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp {
                ip: "0.0.0.0".to_string(),
                announced_ip: None,
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            enable_sctp: true,
            max_sctp_message_size: 262_144,
            initial_available_outgoing_bitrate: 1_000_000,
            min_outgoing_bitrate: 600_000,
            max_incoming_bitrate: 1_500_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: AppData,
}

#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
}

/// Entry point: spawns workers
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: &WorkerSettings) -> Result<Arc<dyn Worker>, EngineError>;
}

/// One media processing unit
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> WorkerId;

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn Router>, EngineError>;

    /// Close the worker and everything it owns
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Fires with [`crate::CloseReason::WorkerDied`] on unexpected termination
    fn closed(&self) -> CloseSignal;
}

/// Per-room routing context
#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> RouterId;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a device with `capabilities` can receive `producer_id`
    async fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        settings: &WebRtcTransportSettings,
    ) -> Result<Arc<dyn Transport>, EngineError>;

    async fn close(&self);

    fn is_closed(&self) -> bool;

    fn closed(&self) -> CloseSignal;
}

/// Network endpoint for one participant in one direction
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    /// ICE/DTLS/SCTP parameters to relay to the client
    fn options(&self) -> TransportOptions;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(&self, request: ProduceRequest) -> Result<Arc<dyn Producer>, EngineError>;

    async fn consume(&self, request: ConsumeRequest) -> Result<Arc<dyn Consumer>, EngineError>;

    /// Close the transport; its producers and consumers close with it
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Fires on explicit close, router/worker close, or DTLS closure
    fn closed(&self) -> CloseSignal;
}

/// Inbound media stream
#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    /// Close the producer; its consumers close with `producerclose`
    async fn close(&self);

    fn is_closed(&self) -> bool;

    fn closed(&self) -> CloseSignal;
}

/// Outbound forwarded copy of a producer
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    /// No media is forwarded while paused
    fn is_paused(&self) -> bool;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn close(&self);

    fn is_closed(&self) -> bool;

    fn closed(&self) -> CloseSignal;
}
