//! Shared fixtures for the orchestration tests

use super::{
    ConsumerRegistry, Notifier, ProducerRegistry, RegistryEvent, RegistrySet, RouterRegistry,
    SessionCoordinator, TransportRegistry, WorkerPool, WorkerPoolConfig,
};
use crate::shadow::{MemoryShadowStore, ShadowMirror};
use async_trait::async_trait;
use confab_media::{LoopbackEngine, WebRtcTransportSettings, WorkerSettings};
use confab_protocol::{ParticipantId, RtpCodecParameters, RtpEncodingParameters, RtpParameters, ServerMessage};
use serde_json::Map;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// Poll a condition until it holds, failing the test after a few seconds
macro_rules! eventually {
    ($cond:expr) => {{
        let mut reached = false;
        for _ in 0..300 {
            if $cond {
                reached = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(reached, "condition never held: {}", stringify!($cond));
    }};
}
pub(crate) use eventually;

pub(crate) fn pool_config(num_workers: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        num_workers,
        restart_delay: Duration::from_millis(20),
        call_timeout: Duration::from_millis(200),
        settings: WorkerSettings::default(),
    }
}

pub(crate) fn opus_parameters() -> RtpParameters {
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

pub(crate) fn vp8_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("1".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
        }],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(2222),
            ..Default::default()
        }],
    }
}

/// Registries on a loopback engine, with the event stream exposed
pub(crate) struct Registries {
    pub engine: LoopbackEngine,
    pub store: Arc<MemoryShadowStore>,
    pub shadow: ShadowMirror,
    pub pool: Arc<WorkerPool>,
    pub routers: Arc<RouterRegistry>,
    pub transports: Arc<TransportRegistry>,
    pub producers: Arc<ProducerRegistry>,
    pub consumers: Arc<ConsumerRegistry>,
    pub events: mpsc::UnboundedReceiver<RegistryEvent>,
}

impl Registries {
    pub async fn start(workers: usize) -> Self {
        let engine = LoopbackEngine::new();
        let store = Arc::new(MemoryShadowStore::new());
        let shadow = ShadowMirror::new(store.clone());
        let pool = WorkerPool::start(Arc::new(engine.clone()), pool_config(workers))
            .await
            .unwrap();
        let (set, events) = RegistrySet::new(&pool, WebRtcTransportSettings::default(), shadow.clone());

        Self {
            engine,
            store,
            shadow,
            pool,
            routers: set.routers,
            transports: set.transports,
            producers: set.producers,
            consumers: set.consumers,
            events,
        }
    }
}

/// Collects every notification instead of sending it anywhere
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    messages: Mutex<Vec<(ParticipantId, ServerMessage)>>,
    online: Mutex<HashSet<ParticipantId>>,
}

impl RecordingNotifier {
    pub async fn set_online(&self, participant_id: &ParticipantId, online: bool) {
        let mut participants = self.online.lock().await;
        if online {
            participants.insert(participant_id.clone());
        } else {
            participants.remove(participant_id);
        }
    }

    pub async fn for_participant(&self, participant_id: &ParticipantId) -> Vec<ServerMessage> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|(to, _)| to == participant_id)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, participant_id: &ParticipantId, message: ServerMessage) {
        self.messages.lock().await.push((participant_id.clone(), message));
    }

    async fn is_reachable(&self, participant_id: &ParticipantId) -> bool {
        self.online.lock().await.contains(participant_id)
    }
}

pub(crate) struct Harness {
    pub engine: LoopbackEngine,
    pub store: Arc<MemoryShadowStore>,
    pub pool: Arc<WorkerPool>,
    pub coordinator: Arc<SessionCoordinator>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub async fn start(workers: usize, idle_timeout: Option<Duration>) -> Self {
        let engine = LoopbackEngine::new();
        let store = Arc::new(MemoryShadowStore::new());
        let pool = WorkerPool::start(Arc::new(engine.clone()), pool_config(workers))
            .await
            .unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let coordinator = SessionCoordinator::new(
            pool.clone(),
            ShadowMirror::new(store.clone()),
            WebRtcTransportSettings::default(),
            idle_timeout,
            notifier.clone(),
        );

        Self {
            engine,
            store,
            pool,
            coordinator,
            notifier,
        }
    }
}
