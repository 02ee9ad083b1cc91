//! Consumer registry
//!
//! Consumers are indexed both by the recv transport they live on and by the
//! producer they forward, so either parent can find its children.

use super::producers::ProducerRegistry;
use super::transports::TransportRegistry;
use super::workers::{WorkerPool, WorkerSlot};
use super::{EventSender, RegistryEvent};
use crate::error::{EntityKind, Result, SfuError};
use crate::shadow::{ConsumerRecord, ShadowMirror, CONSUMERS};
use chrono::Utc;
use confab_media::{CloseReason, ConsumeRequest, Consumer, EngineError};
use confab_protocol::{
    AppData, ConsumerId, ConsumerOptions, MediaKind, ParticipantId, ProducerId, RoomId,
    RtpCapabilities, RtpParameters, TransportId,
};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct ConsumerEntry {
    pub id: ConsumerId,
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: AppData,
    pub consumer: Arc<dyn Consumer>,
    pub slot: WorkerSlot,
}

impl ConsumerEntry {
    /// What the receiving client needs to set up its decoder
    pub fn options(&self) -> ConsumerOptions {
        ConsumerOptions {
            id: self.id,
            producer_id: self.producer_id,
            kind: self.kind,
            rtp_parameters: self.rtp_parameters.clone(),
            app_data: self.app_data.clone(),
        }
    }
}

#[derive(Default)]
struct Index {
    by_id: HashMap<ConsumerId, Arc<ConsumerEntry>>,
    by_transport: HashMap<TransportId, HashSet<ConsumerId>>,
    by_producer: HashMap<ProducerId, HashSet<ConsumerId>>,
}

fn unlink<K: Hash + Eq>(map: &mut HashMap<K, HashSet<ConsumerId>>, key: &K, id: ConsumerId) {
    if let Some(ids) = map.get_mut(key) {
        ids.remove(&id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

pub struct ConsumerRegistry {
    pool: Arc<WorkerPool>,
    transports: Arc<TransportRegistry>,
    producers: Arc<ProducerRegistry>,
    index: RwLock<Index>,
    events: EventSender,
    shadow: ShadowMirror,
    me: Weak<ConsumerRegistry>,
}

impl ConsumerRegistry {
    pub fn new(
        pool: Arc<WorkerPool>,
        transports: Arc<TransportRegistry>,
        producers: Arc<ProducerRegistry>,
        events: EventSender,
        shadow: ShadowMirror,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            pool,
            transports,
            producers,
            index: RwLock::new(Index::default()),
            events,
            shadow,
            me: me.clone(),
        })
    }

    /// Create a paused consumer of `producer_id` on `transport_id`.
    /// Nothing is allocated when the receiver cannot decode the producer.
    pub async fn consume(
        &self,
        participant_id: &ParticipantId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Arc<ConsumerEntry>> {
        let transport = self
            .transports
            .get(transport_id)
            .await
            .ok_or_else(|| SfuError::not_found(EntityKind::Transport, transport_id))?;
        let producer = self
            .producers
            .get(producer_id)
            .await
            .filter(|p| p.room_id == transport.room_id)
            .ok_or_else(|| SfuError::not_found(EntityKind::Producer, producer_id))?;

        let slot = transport.router.slot;
        let router = transport.router.router.clone();
        let compatible = self
            .pool
            .call(slot, "can_consume", async {
                Ok::<_, EngineError>(router.can_consume(producer_id, &rtp_capabilities).await)
            })
            .await?;
        if !compatible {
            debug!(
                participant_id = %participant_id,
                producer_id = %producer_id,
                "Receiver capabilities do not cover the producer"
            );
            return Err(SfuError::Incompatible(producer_id.to_string()));
        }

        let request = ConsumeRequest {
            producer_id,
            rtp_capabilities,
            paused: true,
        };
        let consumer = match self
            .pool
            .call(slot, "consume", transport.transport.consume(request))
            .await
        {
            Ok(consumer) => consumer,
            Err(SfuError::Engine {
                source: EngineError::UnknownProducer(_),
                ..
            }) => return Err(SfuError::not_found(EntityKind::Producer, producer_id)),
            Err(SfuError::Engine {
                source: EngineError::TransportClosed,
                ..
            }) => return Err(SfuError::not_found(EntityKind::Transport, transport_id)),
            Err(e) => return Err(e),
        };

        // The producer (or the transport) may have closed while the engine was busy
        if consumer.is_closed() || !self.producers.contains(producer_id).await {
            Self::discard(consumer.as_ref(), producer_id).await;
            return Err(SfuError::not_found(EntityKind::Producer, producer_id));
        }
        if self.transports.get(transport_id).await.is_none() {
            Self::discard(consumer.as_ref(), producer_id).await;
            return Err(SfuError::not_found(EntityKind::Transport, transport_id));
        }

        let entry = Arc::new(ConsumerEntry {
            id: consumer.id(),
            participant_id: participant_id.clone(),
            room_id: transport.room_id.clone(),
            transport_id,
            producer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            app_data: producer.app_data.clone(),
            consumer,
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
            index
                .by_producer
                .entry(producer_id)
                .or_default()
                .insert(entry.id);
        }
        // A close from here on reaches the consumer through the watcher
        self.watch(&entry);

        self.shadow
            .put(
                CONSUMERS,
                &entry.id.to_string(),
                &ConsumerRecord {
                    consumer_id: entry.id,
                    participant_id: participant_id.clone(),
                    room_id: entry.room_id.clone(),
                    transport_id,
                    producer_id,
                    kind: entry.kind,
                    created_at: Utc::now(),
                },
            )
            .await;
        info!(
            participant_id = %participant_id,
            consumer_id = %entry.id,
            producer_id = %producer_id,
            kind = %entry.kind,
            "Consumer created (paused)"
        );

        Ok(entry)
    }

    /// Start forwarding media to the receiver
    pub async fn resume(&self, consumer_id: ConsumerId) -> Result<()> {
        let entry = self
            .get(consumer_id)
            .await
            .ok_or_else(|| SfuError::not_found(EntityKind::Consumer, consumer_id))?;
        self.pool
            .call(entry.slot, "resume_consumer", entry.consumer.resume())
            .await?;
        debug!(consumer_id = %consumer_id, "Consumer resumed");
        Ok(())
    }

    /// Close and deregister a consumer. No-op if it is already gone.
    pub async fn close(&self, consumer_id: ConsumerId, reason: CloseReason) -> Option<Arc<ConsumerEntry>> {
        let entry = self.deregister(consumer_id, reason).await?;
        entry.consumer.close().await;
        Some(entry)
    }

    pub async fn get(&self, consumer_id: ConsumerId) -> Option<Arc<ConsumerEntry>> {
        self.index.read().await.by_id.get(&consumer_id).cloned()
    }

    pub async fn of_producer(&self, producer_id: ProducerId) -> Vec<ConsumerId> {
        self.ids(|index| index.by_producer.get(&producer_id)).await
    }

    pub async fn on_transport(&self, transport_id: TransportId) -> Vec<ConsumerId> {
        self.ids(|index| index.by_transport.get(&transport_id)).await
    }

    pub async fn for_participant(&self, participant_id: &ParticipantId) -> Vec<Arc<ConsumerEntry>> {
        self.index
            .read()
            .await
            .by_id
            .values()
            .filter(|e| &e.participant_id == participant_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.by_id.len()
    }

    async fn ids(&self, select: impl FnOnce(&Index) -> Option<&HashSet<ConsumerId>>) -> Vec<ConsumerId> {
        let index = self.index.read().await;
        select(&index)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn remove_from_index(index: &mut Index, consumer_id: ConsumerId) -> Option<Arc<ConsumerEntry>> {
        let entry = index.by_id.remove(&consumer_id)?;
        unlink(&mut index.by_transport, &entry.transport_id, consumer_id);
        unlink(&mut index.by_producer, &entry.producer_id, consumer_id);
        Some(entry)
    }

    /// Drop a consumer that was never registered. No event is published.
    async fn discard(consumer: &dyn Consumer, producer_id: ProducerId) {
        consumer.close().await;
        debug!(consumer_id = %consumer.id(), producer_id = %producer_id, "Discarded consumer created during a close");
    }

    async fn deregister(&self, consumer_id: ConsumerId, reason: CloseReason) -> Option<Arc<ConsumerEntry>> {
        let entry = Self::remove_from_index(&mut *self.index.write().await, consumer_id)?;

        self.shadow.remove(CONSUMERS, &consumer_id.to_string()).await;
        info!(
            participant_id = %entry.participant_id,
            consumer_id = %consumer_id,
            %reason,
            "Consumer closed"
        );
        let _ = self.events.send(RegistryEvent::ConsumerClosed {
            entry: entry.clone(),
            reason,
        });
        Some(entry)
    }

    fn watch(&self, entry: &Arc<ConsumerEntry>) {
        let registry = self.me.clone();
        let signal = entry.consumer.closed();
        let consumer_id = entry.id;
        tokio::spawn(async move {
            let reason = signal.wait().await;
            if let Some(registry) = registry.upgrade() {
                registry.deregister(consumer_id, reason).await;
            }
        });
    }
}
