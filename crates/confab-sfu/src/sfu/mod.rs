//! SFU (Selective Forwarding Unit) session orchestration
//!
//! The media engine does the forwarding. This module decides which worker a
//! room lives on, which transports, producers and consumers exist, who owns
//! them, and tears them down in order when participants leave.

mod consumers;
mod coordinator;
mod producers;
mod routers;
mod transports;
mod workers;

#[cfg(test)]
pub(crate) mod test_support;

pub use consumers::{ConsumerEntry, ConsumerRegistry};
pub use coordinator::{JoinedRoom, Notifier, SessionCoordinator, SessionPhase, SfuStats};
pub use producers::{ProducerEntry, ProducerRegistry};
pub use routers::{RouterEntry, RouterRegistry};
pub use transports::{TransportEntry, TransportRegistry};
pub use workers::{WorkerPool, WorkerPoolConfig, WorkerSlot};

use crate::shadow::ShadowMirror;
use confab_media::{CloseReason, WebRtcTransportSettings, codec};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Published once per entity when it leaves its registry
#[derive(Clone)]
pub enum RegistryEvent {
    TransportClosed {
        entry: Arc<TransportEntry>,
        reason: CloseReason,
    },
    ProducerClosed {
        entry: Arc<ProducerEntry>,
        reason: CloseReason,
    },
    ConsumerClosed {
        entry: Arc<ConsumerEntry>,
        reason: CloseReason,
    },
}

pub(crate) type EventSender = mpsc::UnboundedSender<RegistryEvent>;

/// The four registries, wired to one worker pool and one event channel
pub struct RegistrySet {
    pub routers: Arc<RouterRegistry>,
    pub transports: Arc<TransportRegistry>,
    pub producers: Arc<ProducerRegistry>,
    pub consumers: Arc<ConsumerRegistry>,
}

impl RegistrySet {
    pub fn new(
        pool: &Arc<WorkerPool>,
        transport_settings: WebRtcTransportSettings,
        shadow: ShadowMirror,
    ) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();

        let routers = Arc::new(RouterRegistry::new(
            pool.clone(),
            codec::router_codecs(),
            shadow.clone(),
        ));
        let transports = TransportRegistry::new(
            pool.clone(),
            routers.clone(),
            transport_settings,
            events.clone(),
            shadow.clone(),
        );
        let producers = ProducerRegistry::new(pool.clone(), transports.clone(), events.clone(), shadow.clone());
        let consumers = ConsumerRegistry::new(
            pool.clone(),
            transports.clone(),
            producers.clone(),
            events,
            shadow,
        );

        let set = Self {
            routers,
            transports,
            producers,
            consumers,
        };
        (set, rx)
    }
}
