//! (participant, direction) → transport registry

use super::routers::{RouterEntry, RouterRegistry};
use super::workers::WorkerPool;
use super::{EventSender, RegistryEvent};
use crate::error::{EntityKind, Result, SfuError};
use crate::shadow::{ShadowMirror, TransportRecord, TRANSPORTS};
use chrono::Utc;
use confab_media::{CloseReason, Transport, WebRtcTransportSettings};
use confab_protocol::{DtlsParameters, ParticipantId, RoomId, TransportDirection, TransportId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct TransportEntry {
    pub id: TransportId,
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
    pub direction: TransportDirection,
    pub transport: Arc<dyn Transport>,
    pub router: Arc<RouterEntry>,
}

#[derive(Default)]
struct Index {
    by_id: HashMap<TransportId, Arc<TransportEntry>>,
    by_owner: HashMap<(ParticipantId, TransportDirection), TransportId>,
}

pub struct TransportRegistry {
    pool: Arc<WorkerPool>,
    routers: Arc<RouterRegistry>,
    settings: WebRtcTransportSettings,
    index: RwLock<Index>,
    events: EventSender,
    shadow: ShadowMirror,
    me: Weak<TransportRegistry>,
}

impl TransportRegistry {
    pub fn new(
        pool: Arc<WorkerPool>,
        routers: Arc<RouterRegistry>,
        settings: WebRtcTransportSettings,
        events: EventSender,
        shadow: ShadowMirror,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            pool,
            routers,
            settings,
            index: RwLock::new(Index::default()),
            events,
            shadow,
            me: me.clone(),
        })
    }

    /// Create the transport of `participant_id` for `direction` on the room's router.
    /// An older transport for the same direction is closed.
    pub async fn create(
        &self,
        participant_id: &ParticipantId,
        room_id: &RoomId,
        direction: TransportDirection,
    ) -> Result<Arc<TransportEntry>> {
        let router = self.routers.get_or_create(room_id).await?;
        let transport = self
            .pool
            .call(
                router.slot,
                "create_transport",
                router.router.create_webrtc_transport(&self.settings),
            )
            .await?;

        let entry = Arc::new(TransportEntry {
            id: transport.id(),
            participant_id: participant_id.clone(),
            room_id: room_id.clone(),
            direction,
            transport,
            router,
        });

        let displaced = {
            let mut index = self.index.write().await;
            let displaced = index
                .by_owner
                .insert((participant_id.clone(), direction), entry.id)
                .and_then(|old| index.by_id.remove(&old));
            index.by_id.insert(entry.id, entry.clone());
            displaced
        };
        self.watch(&entry);

        self.shadow
            .put(
                TRANSPORTS,
                &entry.id.to_string(),
                &TransportRecord {
                    transport_id: entry.id,
                    participant_id: participant_id.clone(),
                    room_id: room_id.clone(),
                    direction,
                    created_at: Utc::now(),
                },
            )
            .await;
        info!(
            participant_id = %participant_id,
            room_id = %room_id,
            transport_id = %entry.id,
            %direction,
            "Transport created"
        );

        if let Some(old) = displaced {
            self.finish_close(old, CloseReason::Closed).await;
        }
        Ok(entry)
    }

    /// Complete the DTLS handshake with the client's parameters
    pub async fn connect(&self, transport_id: TransportId, dtls_parameters: DtlsParameters) -> Result<()> {
        let entry = self
            .get(transport_id)
            .await
            .ok_or_else(|| SfuError::not_found(EntityKind::Transport, transport_id))?;
        self.pool
            .call(
                entry.router.slot,
                "connect_transport",
                entry.transport.connect(dtls_parameters),
            )
            .await?;
        debug!(transport_id = %transport_id, "Transport connected");
        Ok(())
    }

    /// Close the transport of `participant_id` for `direction`. No-op if there is none.
    pub async fn close(
        &self,
        participant_id: &ParticipantId,
        direction: TransportDirection,
        reason: CloseReason,
    ) -> Option<Arc<TransportEntry>> {
        let id = self.get_for(participant_id, direction).await?.id;
        self.close_by_id(id, reason).await
    }

    pub async fn close_by_id(&self, transport_id: TransportId, reason: CloseReason) -> Option<Arc<TransportEntry>> {
        let entry = self.deregister(transport_id, reason).await?;
        entry.transport.close().await;
        Some(entry)
    }

    pub async fn get(&self, transport_id: TransportId) -> Option<Arc<TransportEntry>> {
        self.index.read().await.by_id.get(&transport_id).cloned()
    }

    pub async fn get_for(
        &self,
        participant_id: &ParticipantId,
        direction: TransportDirection,
    ) -> Option<Arc<TransportEntry>> {
        let index = self.index.read().await;
        let id = index.by_owner.get(&(participant_id.clone(), direction))?;
        index.by_id.get(id).cloned()
    }

    pub async fn for_participant(&self, participant_id: &ParticipantId) -> Vec<Arc<TransportEntry>> {
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

    async fn finish_close(&self, entry: Arc<TransportEntry>, reason: CloseReason) {
        self.released(&entry, reason).await;
        entry.transport.close().await;
    }

    /// Remove from every index. Only the first caller for an id gets the entry back.
    async fn deregister(&self, transport_id: TransportId, reason: CloseReason) -> Option<Arc<TransportEntry>> {
        let entry = {
            let mut index = self.index.write().await;
            let entry = index.by_id.remove(&transport_id)?;
            let key = (entry.participant_id.clone(), entry.direction);
            if index.by_owner.get(&key) == Some(&transport_id) {
                index.by_owner.remove(&key);
            }
            entry
        };
        self.released(&entry, reason).await;
        Some(entry)
    }

    async fn released(&self, entry: &Arc<TransportEntry>, reason: CloseReason) {
        self.shadow.remove(TRANSPORTS, &entry.id.to_string()).await;
        info!(
            participant_id = %entry.participant_id,
            transport_id = %entry.id,
            direction = %entry.direction,
            %reason,
            "Transport closed"
        );
        let _ = self.events.send(RegistryEvent::TransportClosed {
            entry: entry.clone(),
            reason,
        });
    }

    fn watch(&self, entry: &Arc<TransportEntry>) {
        let registry = self.me.clone();
        let signal = entry.transport.closed();
        let transport_id = entry.id;
        tokio::spawn(async move {
            let reason = signal.wait().await;
            if let Some(registry) = registry.upgrade() {
                registry.deregister(transport_id, reason).await;
            }
        });
    }
}
