//! Producer registry
//!
//! Producers are keyed by engine id and indexed by the transport they were
//! published on. Consumers of a producer are not tracked here.

use super::transports::TransportRegistry;
use super::workers::{WorkerPool, WorkerSlot};
use super::{EventSender, RegistryEvent};
use crate::error::{EntityKind, Result, SfuError};
use crate::shadow::{ProducerRecord, ShadowMirror, PRODUCERS};
use chrono::Utc;
use confab_media::{CloseReason, EngineError, ProduceRequest, Producer};
use confab_protocol::{
    AppData, MediaKind, ParticipantId, ProducerId, ProducerSummary, RoomId, RtpParameters,
    TransportId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::info;

pub struct ProducerEntry {
    pub id: ProducerId,
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub app_data: AppData,
    pub producer: Arc<dyn Producer>,
    pub slot: WorkerSlot,
}

impl ProducerEntry {
    pub fn summary(&self) -> ProducerSummary {
        ProducerSummary {
            producer_id: self.id,
            participant_id: self.participant_id.clone(),
            kind: self.kind,
            app_data: self.app_data.clone(),
        }
    }
}

#[derive(Default)]
struct Index {
    by_id: HashMap<ProducerId, Arc<ProducerEntry>>,
    by_transport: HashMap<TransportId, HashSet<ProducerId>>,
}

pub struct ProducerRegistry {
    pool: Arc<WorkerPool>,
    transports: Arc<TransportRegistry>,
    index: RwLock<Index>,
    events: EventSender,
    shadow: ShadowMirror,
    me: Weak<ProducerRegistry>,
}

impl ProducerRegistry {
    pub fn new(
        pool: Arc<WorkerPool>,
        transports: Arc<TransportRegistry>,
        events: EventSender,
        shadow: ShadowMirror,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            pool,
            transports,
            index: RwLock::new(Index::default()),
            events,
            shadow,
            me: me.clone(),
        })
    }

    pub async fn produce(
        &self,
        participant_id: &ParticipantId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppData,
    ) -> Result<Arc<ProducerEntry>> {
        let transport = self
            .transports
            .get(transport_id)
            .await
            .ok_or_else(|| SfuError::not_found(EntityKind::Transport, transport_id))?;

        let slot = transport.router.slot;
        let request = ProduceRequest {
            kind,
            rtp_parameters,
            app_data: app_data.clone(),
        };
        let producer = match self
            .pool
            .call(slot, "produce", transport.transport.produce(request))
            .await
        {
            Ok(producer) => producer,
            Err(SfuError::Engine {
                source: EngineError::TransportClosed,
                ..
            }) => return Err(SfuError::not_found(EntityKind::Transport, transport_id)),
            Err(e) => return Err(e),
        };

        // The transport may have gone away while the engine was busy
        if producer.is_closed() || self.transports.get(transport_id).await.is_none() {
            producer.close().await;
            return Err(SfuError::not_found(EntityKind::Transport, transport_id));
        }

        let entry = Arc::new(ProducerEntry {
            id: producer.id(),
            participant_id: participant_id.clone(),
            room_id: transport.room_id.clone(),
            transport_id,
            kind,
            app_data,
            producer,
            slot,
        });
        {
            let mut index = self.index.write().await;
            index.by_id.insert(entry.id, entry.clone());
            index
                .by_transport
                .entry(transport_id)
                .or_default()
                .insert(entry.id);
        }
        self.watch(&entry);

        self.shadow
            .put(
                PRODUCERS,
                &entry.id.to_string(),
                &ProducerRecord {
                    producer_id: entry.id,
                    participant_id: participant_id.clone(),
                    room_id: entry.room_id.clone(),
                    transport_id,
                    kind,
                    source: entry.app_data.source,
                    created_at: Utc::now(),
                },
            )
            .await;
        info!(
            participant_id = %participant_id,
            room_id = %entry.room_id,
            producer_id = %entry.id,
            %kind,
            source = ?entry.app_data.source,
            "Producer created"
        );

        Ok(entry)
    }

    /// Close and deregister a producer. No-op if it is already gone.
    pub async fn close(&self, producer_id: ProducerId, reason: CloseReason) -> Option<Arc<ProducerEntry>> {
        let entry = self.deregister(producer_id, reason).await?;
        entry.producer.close().await;
        Some(entry)
    }

    pub async fn get(&self, producer_id: ProducerId) -> Option<Arc<ProducerEntry>> {
        self.index.read().await.by_id.get(&producer_id).cloned()
    }

    pub async fn contains(&self, producer_id: ProducerId) -> bool {
        self.index.read().await.by_id.contains_key(&producer_id)
    }

    pub async fn on_transport(&self, transport_id: TransportId) -> Vec<ProducerId> {
        self.index
            .read()
            .await
            .by_transport
            .get(&transport_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn for_participant(&self, participant_id: &ParticipantId) -> Vec<Arc<ProducerEntry>> {
        self.index
            .read()
            .await
            .by_id
            .values()
            .filter(|e| &e.participant_id == participant_id)
            .cloned()
            .collect()
    }

    pub async fn in_room(&self, room_id: &RoomId) -> Vec<Arc<ProducerEntry>> {
        self.index
            .read()
            .await
            .by_id
            .values()
            .filter(|e| &e.room_id == room_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.by_id.len()
    }

    async fn deregister(&self, producer_id: ProducerId, reason: CloseReason) -> Option<Arc<ProducerEntry>> {
        let entry = {
            let mut index = self.index.write().await;
            let entry = index.by_id.remove(&producer_id)?;
            if let Some(ids) = index.by_transport.get_mut(&entry.transport_id) {
                ids.remove(&producer_id);
                if ids.is_empty() {
                    index.by_transport.remove(&entry.transport_id);
                }
            }
            entry
        };

        self.shadow.remove(PRODUCERS, &producer_id.to_string()).await;
        info!(
            participant_id = %entry.participant_id,
            producer_id = %producer_id,
            %reason,
            "Producer closed"
        );
        let _ = self.events.send(RegistryEvent::ProducerClosed {
            entry: entry.clone(),
            reason,
        });
        Some(entry)
    }

    fn watch(&self, entry: &Arc<ProducerEntry>) {
        let registry = self.me.clone();
        let signal = entry.producer.closed();
        let producer_id = entry.id;
        tokio::spawn(async move {
            let reason = signal.wait().await;
            if let Some(registry) = registry.upgrade() {
                registry.deregister(producer_id, reason).await;
            }
        });
    }
}
