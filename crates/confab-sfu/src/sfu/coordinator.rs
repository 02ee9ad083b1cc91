//! Session coordinator
//!
//! Entry point for the signaling layer. Each participant moves through
//! `Idle → Joined → Publishing → Leaving → Idle`; requests of one participant
//! are serialized on that participant's session lock, requests of different
//! participants run concurrently.
//!
//! Teardown is explicit and ordered: consumers, then producers (with the
//! consumers forwarding them), then transports. Engine close notifications
//! arrive as registry events and clean up whatever the explicit path did not
//! reach (DTLS loss, worker death).

use super::{RegistryEvent, RegistrySet, WorkerPool};
use crate::error::{EntityKind, Result, SfuError};
use crate::shadow::ShadowMirror;
use async_trait::async_trait;
use confab_media::{CloseReason, Router, Transport, WebRtcTransportSettings};
use confab_protocol::{
    AppData, ConsumerId, ConsumerOptions, DtlsParameters, MediaKind, ParticipantId, ProducerId,
    ProducerSummary, RoomId, RtpCapabilities, RtpParameters, ServerMessage, TransportDirection,
    TransportId, TransportOptions,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Delivery of server-initiated messages to a participant
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, participant_id: &ParticipantId, message: ServerMessage);

    /// Whether the participant has a live connection
    async fn is_reachable(&self, participant_id: &ParticipantId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Joined,
    Publishing,
    Leaving,
}

#[derive(Default)]
struct Session {
    room_id: Arc<Mutex<Option<RoomId>>>,
    leaving: AtomicBool,
    /// Set once the session is torn down; requests queued on it start over
    retired: AtomicBool,
}

type SessionGuard = OwnedMutexGuard<Option<RoomId>>;

#[derive(Default)]
struct Room {
    members: HashSet<ParticipantId>,
    /// Set while the room has no members
    empty_since: Option<Instant>,
}

/// Result of a successful join
#[derive(Debug, Clone)]
pub struct JoinedRoom {
    pub room_id: RoomId,
    pub rtp_capabilities: RtpCapabilities,
    /// Producers already live in the room, excluding the joiner's own
    pub producers: Vec<ProducerSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SfuStats {
    pub workers_alive: usize,
    pub workers_total: usize,
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub participants: usize,
}

pub struct SessionCoordinator {
    pool: Arc<WorkerPool>,
    registries: RegistrySet,
    notifier: Arc<dyn Notifier>,
    sessions: Mutex<HashMap<ParticipantId, Arc<Session>>>,
    rooms: Mutex<HashMap<RoomId, Room>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SessionCoordinator {
    /// Build the registries and start the background tasks (event handling,
    /// idle router eviction when `router_idle_timeout` is set).
    pub fn new(
        pool: Arc<WorkerPool>,
        shadow: ShadowMirror,
        transport_settings: WebRtcTransportSettings,
        router_idle_timeout: Option<Duration>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let (registries, events) = RegistrySet::new(&pool, transport_settings, shadow);
        let coordinator = Arc::new(Self {
            pool,
            registries,
            notifier,
            sessions: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let mut tasks = vec![tokio::spawn(forward_events(Arc::downgrade(&coordinator), events))];
        if let Some(timeout) = router_idle_timeout {
            tasks.push(tokio::spawn(evict_idle_routers(Arc::downgrade(&coordinator), timeout)));
        }
        if let Ok(mut slot) = coordinator.tasks.lock() {
            *slot = tasks;
        }

        coordinator
    }

    pub fn registries(&self) -> &RegistrySet {
        &self.registries
    }

    /// Join `room_id`, leaving the current room first. Joining the current room again is a no-op.
    pub async fn join(&self, participant_id: &ParticipantId, room_id: RoomId) -> Result<JoinedRoom> {
        let (session, mut current) = self.lock_session(participant_id).await;

        let switching = current.as_ref() != Some(&room_id);
        if switching {
            if let Some(previous) = current.take() {
                info!(participant_id = %participant_id, from = %previous, to = %room_id, "Switching rooms");
                self.leave_room(participant_id, &session, previous).await;
            }
            self.add_member(&room_id, participant_id).await;
        }

        let router = match self.registries.routers.get_or_create(&room_id).await {
            Ok(router) => router,
            Err(e) => {
                if switching {
                    self.remove_member(&room_id, participant_id).await;
                }
                return Err(e);
            }
        };

        if switching {
            *current = Some(room_id.clone());
            info!(participant_id = %participant_id, room_id = %room_id, "Participant joined room");
        }

        let producers = self
            .registries
            .producers
            .in_room(&room_id)
            .await
            .iter()
            .filter(|p| &p.participant_id != participant_id)
            .map(|p| p.summary())
            .collect();

        Ok(JoinedRoom {
            room_id,
            rtp_capabilities: router.router.rtp_capabilities(),
            producers,
        })
    }

    pub async fn router_rtp_capabilities(&self, participant_id: &ParticipantId) -> Result<RtpCapabilities> {
        let (_session, current) = self.lock_session(participant_id).await;
        let room_id = current.as_ref().ok_or(SfuError::NotJoined)?;
        let router = self.registries.routers.get_or_create(room_id).await?;
        Ok(router.router.rtp_capabilities())
    }

    /// Create the participant's transport for `direction`, replacing an existing one
    pub async fn create_transport(
        &self,
        participant_id: &ParticipantId,
        direction: TransportDirection,
    ) -> Result<TransportOptions> {
        let (_session, current) = self.lock_session(participant_id).await;
        let room_id = current.as_ref().ok_or(SfuError::NotJoined)?;

        if let Some(existing) = self.registries.transports.get_for(participant_id, direction).await {
            debug!(participant_id = %participant_id, transport_id = %existing.id, "Replacing transport");
            self.close_transport(existing.id, CloseReason::Closed).await;
        }

        let entry = self
            .registries
            .transports
            .create(participant_id, room_id, direction)
            .await?;
        Ok(entry.transport.options())
    }

    pub async fn connect_transport(
        &self,
        participant_id: &ParticipantId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let _guard = self.lock_session(participant_id).await;
        self.owned_transport(participant_id, transport_id).await?;
        self.registries
            .transports
            .connect(transport_id, dtls_parameters)
            .await
    }

    /// Publish a stream. Everyone else in the room hears about it.
    pub async fn produce(
        &self,
        participant_id: &ParticipantId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppData,
    ) -> Result<ProducerId> {
        let (_session, current) = self.lock_session(participant_id).await;
        let room_id = current.as_ref().ok_or(SfuError::NotJoined)?;

        let transport = self.owned_transport(participant_id, transport_id).await?;
        if transport.direction != TransportDirection::Send {
            return Err(SfuError::InvalidState(
                "produce requires a send transport".to_string(),
            ));
        }

        let entry = self
            .registries
            .producers
            .produce(participant_id, transport_id, kind, rtp_parameters, app_data)
            .await?;

        let announcement = ServerMessage::NewProducer {
            room_id: room_id.clone(),
            producer: entry.summary(),
        };
        for member in self.members(room_id).await {
            if &member != participant_id {
                self.notifier.notify(&member, announcement.clone()).await;
            }
        }

        Ok(entry.id)
    }

    pub async fn close_producer(&self, participant_id: &ParticipantId, producer_id: ProducerId) -> Result<()> {
        let _guard = self.lock_session(participant_id).await;
        self.registries
            .producers
            .get(producer_id)
            .await
            .filter(|p| &p.participant_id == participant_id)
            .ok_or_else(|| SfuError::not_found(EntityKind::Producer, producer_id))?;
        self.close_producer_cascade(producer_id, CloseReason::Closed).await;
        Ok(())
    }

    /// Subscribe to a producer in the participant's room. The consumer starts paused.
    pub async fn consume(
        &self,
        participant_id: &ParticipantId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerOptions> {
        let (_session, current) = self.lock_session(participant_id).await;
        current.as_ref().ok_or(SfuError::NotJoined)?;

        let transport = self.owned_transport(participant_id, transport_id).await?;
        if transport.direction != TransportDirection::Recv {
            return Err(SfuError::InvalidState(
                "consume requires a recv transport".to_string(),
            ));
        }

        let entry = self
            .registries
            .consumers
            .consume(participant_id, transport_id, producer_id, rtp_capabilities)
            .await?;
        Ok(entry.options())
    }

    pub async fn resume_consumer(&self, participant_id: &ParticipantId, consumer_id: ConsumerId) -> Result<()> {
        let _guard = self.lock_session(participant_id).await;
        self.owned_consumer(participant_id, consumer_id).await?;
        self.registries.consumers.resume(consumer_id).await
    }

    pub async fn close_consumer(&self, participant_id: &ParticipantId, consumer_id: ConsumerId) -> Result<()> {
        let _guard = self.lock_session(participant_id).await;
        self.owned_consumer(participant_id, consumer_id).await?;
        self.registries
            .consumers
            .close(consumer_id, CloseReason::Closed)
            .await;
        Ok(())
    }

    /// Leave the current room. Leaving while in no room is a no-op.
    pub async fn leave(&self, participant_id: &ParticipantId) {
        let (session, mut current) = self.lock_session(participant_id).await;
        if let Some(room_id) = current.take() {
            self.leave_room(participant_id, &session, room_id).await;
        }
    }

    /// The participant's connection is gone: leave and forget the session
    pub async fn disconnect(&self, participant_id: &ParticipantId) {
        let (session, current) = self.lock_session(participant_id).await;
        self.retire(participant_id, &session, current).await;
    }

    /// Disconnect unless the participant is reachable again. Liveness is read
    /// under the session lock, so a connection that identified before any of
    /// its requests ran keeps the session. Returns whether it was torn down.
    pub async fn disconnect_if_unreachable(&self, participant_id: &ParticipantId) -> bool {
        let (session, current) = self.lock_session(participant_id).await;
        if self.notifier.is_reachable(participant_id).await {
            debug!(participant_id = %participant_id, "Participant reconnected, keeping session");
            return false;
        }
        self.retire(participant_id, &session, current).await;
        true
    }

    pub async fn phase(&self, participant_id: &ParticipantId) -> SessionPhase {
        let Some(session) = self.sessions.lock().await.get(participant_id).cloned() else {
            return SessionPhase::Idle;
        };
        if session.leaving.load(Ordering::Acquire) {
            return SessionPhase::Leaving;
        }
        if session.room_id.lock().await.is_none() {
            return SessionPhase::Idle;
        }
        if self
            .registries
            .producers
            .for_participant(participant_id)
            .await
            .is_empty()
        {
            SessionPhase::Joined
        } else {
            SessionPhase::Publishing
        }
    }

    pub async fn members(&self, room_id: &RoomId) -> Vec<ParticipantId> {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .map(|room| room.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> SfuStats {
        let participants = self
            .rooms
            .lock()
            .await
            .values()
            .map(|room| room.members.len())
            .sum();
        SfuStats {
            workers_alive: self.pool.live_workers().await,
            workers_total: self.pool.size(),
            routers: self.registries.routers.len().await,
            transports: self.registries.transports.len().await,
            producers: self.registries.producers.len().await,
            consumers: self.registries.consumers.len().await,
            participants,
        }
    }

    /// Disconnect everyone, close every router and stop the worker pool
    pub async fn shutdown(&self) {
        let tasks = self
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }

        let participants: Vec<ParticipantId> = self.sessions.lock().await.keys().cloned().collect();
        for participant_id in &participants {
            self.disconnect(participant_id).await;
        }
        self.registries.routers.close_all().await;
        self.pool.shutdown().await;
        info!(participants = participants.len(), "Session coordinator shut down");
    }

    async fn session(&self, participant_id: &ParticipantId) -> Arc<Session> {
        self.sessions
            .lock()
            .await
            .entry(participant_id.clone())
            .or_default()
            .clone()
    }

    /// Take the participant's session lock, skipping sessions retired while we waited
    async fn lock_session(&self, participant_id: &ParticipantId) -> (Arc<Session>, SessionGuard) {
        loop {
            let session = self.session(participant_id).await;
            let guard = session.room_id.clone().lock_owned().await;
            if !session.retired.load(Ordering::Acquire) {
                return (session, guard);
            }
        }
    }

    async fn retire(&self, participant_id: &ParticipantId, session: &Arc<Session>, mut current: SessionGuard) {
        if let Some(room_id) = current.take() {
            self.leave_room(participant_id, session, room_id).await;
        }
        session.retired.store(true, Ordering::Release);

        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(participant_id)
            .is_some_and(|s| Arc::ptr_eq(s, session))
        {
            sessions.remove(participant_id);
        }
        debug!(participant_id = %participant_id, "Participant disconnected");
    }

    async fn leave_room(&self, participant_id: &ParticipantId, session: &Session, room_id: RoomId) {
        session.leaving.store(true, Ordering::Release);
        info!(participant_id = %participant_id, room_id = %room_id, "Participant leaving room");

        for consumer in self.registries.consumers.for_participant(participant_id).await {
            self.registries
                .consumers
                .close(consumer.id, CloseReason::Closed)
                .await;
        }
        for producer in self.registries.producers.for_participant(participant_id).await {
            self.close_producer_cascade(producer.id, CloseReason::Closed).await;
        }
        for transport in self.registries.transports.for_participant(participant_id).await {
            self.close_transport(transport.id, CloseReason::Closed).await;
        }

        let remaining = self.remove_member(&room_id, participant_id).await;
        for member in remaining {
            self.notifier
                .notify(
                    &member,
                    ServerMessage::ParticipantLeft {
                        room_id: room_id.clone(),
                        participant_id: participant_id.clone(),
                    },
                )
                .await;
        }

        session.leaving.store(false, Ordering::Release);
    }

    /// Close a producer after the consumers forwarding it
    async fn close_producer_cascade(&self, producer_id: ProducerId, reason: CloseReason) {
        for consumer_id in self.registries.consumers.of_producer(producer_id).await {
            self.registries
                .consumers
                .close(consumer_id, CloseReason::ProducerClosed)
                .await;
        }
        self.registries.producers.close(producer_id, reason).await;
    }

    /// Close a transport after everything attached to it
    async fn close_transport(&self, transport_id: TransportId, reason: CloseReason) {
        self.release_children(transport_id).await;
        self.registries
            .transports
            .close_by_id(transport_id, reason)
            .await;
    }

    async fn release_children(&self, transport_id: TransportId) {
        for consumer_id in self.registries.consumers.on_transport(transport_id).await {
            self.registries
                .consumers
                .close(consumer_id, CloseReason::TransportClosed)
                .await;
        }
        for producer_id in self.registries.producers.on_transport(transport_id).await {
            self.close_producer_cascade(producer_id, CloseReason::TransportClosed)
                .await;
        }
    }

    async fn owned_transport(
        &self,
        participant_id: &ParticipantId,
        transport_id: TransportId,
    ) -> Result<Arc<super::TransportEntry>> {
        self.registries
            .transports
            .get(transport_id)
            .await
            .filter(|t| &t.participant_id == participant_id)
            .ok_or_else(|| SfuError::not_found(EntityKind::Transport, transport_id))
    }

    async fn owned_consumer(
        &self,
        participant_id: &ParticipantId,
        consumer_id: ConsumerId,
    ) -> Result<Arc<super::ConsumerEntry>> {
        self.registries
            .consumers
            .get(consumer_id)
            .await
            .filter(|c| &c.participant_id == participant_id)
            .ok_or_else(|| SfuError::not_found(EntityKind::Consumer, consumer_id))
    }

    async fn add_member(&self, room_id: &RoomId, participant_id: &ParticipantId) {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(room_id.clone()).or_default();
        room.members.insert(participant_id.clone());
        room.empty_since = None;
    }

    /// Returns the members still in the room
    async fn remove_member(&self, room_id: &RoomId, participant_id: &ParticipantId) -> Vec<ParticipantId> {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return Vec::new();
        };
        room.members.remove(participant_id);
        if room.members.is_empty() {
            room.empty_since = Some(Instant::now());
            debug!(room_id = %room_id, "Room is empty");
        }
        room.members.iter().cloned().collect()
    }

    async fn handle_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::ConsumerClosed { entry, reason } => {
                if reason != CloseReason::Closed {
                    self.notifier
                        .notify(
                            &entry.participant_id,
                            ServerMessage::ConsumerClosed {
                                consumer_id: entry.id,
                            },
                        )
                        .await;
                }
            }
            RegistryEvent::ProducerClosed { entry, reason } => {
                for consumer_id in self.registries.consumers.of_producer(entry.id).await {
                    self.registries
                        .consumers
                        .close(consumer_id, CloseReason::ProducerClosed)
                        .await;
                }
                if reason != CloseReason::Closed {
                    self.notifier
                        .notify(
                            &entry.participant_id,
                            ServerMessage::ProducerClosed {
                                producer_id: entry.id,
                            },
                        )
                        .await;
                }
            }
            RegistryEvent::TransportClosed { entry, .. } => {
                self.release_children(entry.id).await;
            }
        }
    }

    async fn evict_expired_rooms(&self, timeout: Duration) {
        let mut rooms = self.rooms.lock().await;
        let expired: Vec<RoomId> = rooms
            .iter()
            .filter(|(_, room)| {
                room.members.is_empty() && room.empty_since.is_some_and(|since| since.elapsed() >= timeout)
            })
            .map(|(room_id, _)| room_id.clone())
            .collect();

        // Held across the removal so a concurrent join waits for it
        for room_id in expired {
            rooms.remove(&room_id);
            if self.registries.routers.remove(&room_id).await {
                info!(room_id = %room_id, idle_secs = timeout.as_secs(), "Evicted idle router");
            }
        }
    }
}

async fn forward_events(coordinator: Weak<SessionCoordinator>, mut events: mpsc::UnboundedReceiver<RegistryEvent>) {
    while let Some(event) = events.recv().await {
        let Some(coordinator) = coordinator.upgrade() else {
            return;
        };
        coordinator.handle_event(event).await;
    }
}

async fn evict_idle_routers(coordinator: Weak<SessionCoordinator>, timeout: Duration) {
    let period = (timeout / 2).clamp(Duration::from_millis(10), Duration::from_secs(5));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let Some(coordinator) = coordinator.upgrade() else {
            return;
        };
        coordinator.evict_expired_rooms(timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::{CONSUMERS, PRODUCERS, TRANSPORTS};
    use crate::sfu::test_support::{eventually, opus_parameters, vp8_parameters, Harness};
    use confab_media::{Consumer, EngineOp};
    use confab_protocol::{DtlsFingerprint, DtlsRole, MediaSource};

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "12:34".to_string(),
            }],
        }
    }

    fn alice() -> ParticipantId {
        ParticipantId::new("alice")
    }

    fn bob() -> ParticipantId {
        ParticipantId::new("bob")
    }

    fn r1() -> RoomId {
        RoomId::new("r1")
    }

    /// Join, create and connect a send transport, publish audio
    async fn publish_audio(h: &Harness, who: &ParticipantId) -> (TransportId, ProducerId) {
        h.coordinator.join(who, r1()).await.unwrap();
        let send = h.coordinator.create_transport(who, TransportDirection::Send).await.unwrap();
        h.coordinator.connect_transport(who, send.id, dtls()).await.unwrap();
        let producer = h
            .coordinator
            .produce(
                who,
                send.id,
                MediaKind::Audio,
                opus_parameters(),
                AppData::with_source(MediaSource::Microphone),
            )
            .await
            .unwrap();
        (send.id, producer)
    }

    #[tokio::test]
    async fn end_to_end_call() {
        let h = Harness::start(2, None).await;
        let c = &h.coordinator;

        // A joins: router on worker 0
        let joined = c.join(&alice(), r1()).await.unwrap();
        assert!(!joined.rtp_capabilities.codecs.is_empty());
        let router = c.registries().routers.get(&r1()).await.unwrap();
        assert_eq!(router.slot.index, 0);

        // B joins the same room: same router, no second worker used
        c.join(&bob(), r1()).await.unwrap();
        assert_eq!(c.registries().routers.get(&r1()).await.unwrap().router.id(), router.router.id());
        assert_eq!(c.registries().routers.len().await, 1);

        // A publishes audio
        let send = c.create_transport(&alice(), TransportDirection::Send).await.unwrap();
        c.connect_transport(&alice(), send.id, dtls()).await.unwrap();
        let p1 = c
            .produce(&alice(), send.id, MediaKind::Audio, opus_parameters(), AppData::default())
            .await
            .unwrap();
        assert_eq!(c.phase(&alice()).await, SessionPhase::Publishing);
        assert_eq!(c.phase(&bob()).await, SessionPhase::Joined);
        assert!(h
            .notifier
            .for_participant(&bob())
            .await
            .iter()
            .any(|m| matches!(m, ServerMessage::NewProducer { producer, .. } if producer.producer_id == p1)));

        // B subscribes: paused until resumed
        let recv = c.create_transport(&bob(), TransportDirection::Recv).await.unwrap();
        c.connect_transport(&bob(), recv.id, dtls()).await.unwrap();
        let c1 = c
            .consume(&bob(), recv.id, p1, joined.rtp_capabilities.clone())
            .await
            .unwrap();
        let c1_entry = c.registries().consumers.get(c1.id).await.unwrap();
        assert!(c1_entry.consumer.is_paused());
        c.resume_consumer(&bob(), c1.id).await.unwrap();
        assert!(!c1_entry.consumer.is_paused());

        // A disconnects: p1, then c1, then A's transports close
        c.disconnect(&alice()).await;
        assert!(c.registries().producers.get(p1).await.is_none());
        assert!(c.registries().consumers.get(c1.id).await.is_none());
        assert!(c1_entry.consumer.is_closed());
        assert!(c.registries().transports.for_participant(&alice()).await.is_empty());
        assert_eq!(c.phase(&alice()).await, SessionPhase::Idle);

        // B is told, and the room keeps its router
        eventually!(h
            .notifier
            .for_participant(&bob())
            .await
            .iter()
            .any(|m| matches!(m, ServerMessage::ConsumerClosed { consumer_id } if *consumer_id == c1.id)));
        assert!(h
            .notifier
            .for_participant(&bob())
            .await
            .iter()
            .any(|m| matches!(m, ServerMessage::ParticipantLeft { participant_id, .. } if participant_id == &alice())));
        assert_eq!(c.registries().routers.get(&r1()).await.unwrap().router.id(), router.router.id());
        assert_eq!(c.members(&r1()).await, vec![bob()]);
    }

    #[tokio::test]
    async fn late_joiner_sees_existing_producers() {
        let h = Harness::start(1, None).await;
        let (_, producer) = publish_audio(&h, &alice()).await;

        let joined = h.coordinator.join(&bob(), r1()).await.unwrap();
        assert_eq!(joined.producers.len(), 1);
        assert_eq!(joined.producers[0].producer_id, producer);
        assert_eq!(joined.producers[0].app_data.source, Some(MediaSource::Microphone));

        // Rejoining is idempotent
        let again = h.coordinator.join(&bob(), r1()).await.unwrap();
        assert_eq!(again.producers.len(), 1);
        assert_eq!(h.coordinator.members(&r1()).await.len(), 2);
    }

    #[tokio::test]
    async fn disconnect_while_publishing_leaks_nothing() {
        let h = Harness::start(1, None).await;
        let c = &h.coordinator;
        let (send, _) = publish_audio(&h, &alice()).await;
        c.produce(&alice(), send, MediaKind::Video, vp8_parameters(), AppData::with_source(MediaSource::Camera))
            .await
            .unwrap();
        let (_, bob_producer) = publish_audio(&h, &bob()).await;
        let recv = c.create_transport(&alice(), TransportDirection::Recv).await.unwrap();
        c.consume(&alice(), recv.id, bob_producer, c.router_rtp_capabilities(&alice()).await.unwrap())
            .await
            .unwrap();

        c.disconnect(&alice()).await;

        let r = c.registries();
        assert!(r.transports.for_participant(&alice()).await.is_empty());
        assert!(r.producers.for_participant(&alice()).await.is_empty());
        assert!(r.consumers.for_participant(&alice()).await.is_empty());
        // Bob's own resources are untouched
        assert_eq!(r.producers.len().await, 1);
        assert_eq!(r.transports.len().await, 1);
        assert_eq!(r.consumers.len().await, 0);
        assert_eq!(h.store.len(TRANSPORTS).await, 1);
        assert_eq!(h.store.len(PRODUCERS).await, 1);
        assert_eq!(h.store.len(CONSUMERS).await, 0);
    }

    #[tokio::test]
    async fn requests_before_join_are_rejected() {
        let h = Harness::start(1, None).await;
        let err = h
            .coordinator
            .create_transport(&alice(), TransportDirection::Send)
            .await
            .err();
        assert!(matches!(err, Some(SfuError::NotJoined)));
        assert!(matches!(
            h.coordinator.router_rtp_capabilities(&alice()).await,
            Err(SfuError::NotJoined)
        ));
        h.coordinator.leave(&alice()).await;
        assert_eq!(h.coordinator.phase(&alice()).await, SessionPhase::Idle);
    }

    #[tokio::test]
    async fn foreign_and_wrong_direction_transports_are_refused() {
        let h = Harness::start(1, None).await;
        let c = &h.coordinator;
        let (send, producer) = publish_audio(&h, &alice()).await;
        c.join(&bob(), r1()).await.unwrap();
        let caps = c.router_rtp_capabilities(&bob()).await.unwrap();

        // Bob cannot use Alice's transport or close her producer
        let err = c.connect_transport(&bob(), send, dtls()).await.err();
        assert!(matches!(err, Some(SfuError::NotFound { kind: EntityKind::Transport, .. })));
        let err = c.close_producer(&bob(), producer).await.err();
        assert!(matches!(err, Some(SfuError::NotFound { kind: EntityKind::Producer, .. })));

        // Consuming needs a recv transport
        let bob_send = c.create_transport(&bob(), TransportDirection::Send).await.unwrap();
        let err = c.consume(&bob(), bob_send.id, producer, caps).await.err();
        assert!(matches!(err, Some(SfuError::InvalidState(_))));

        // Producing needs a send transport
        let bob_recv = c.create_transport(&bob(), TransportDirection::Recv).await.unwrap();
        let err = c
            .produce(&bob(), bob_recv.id, MediaKind::Audio, opus_parameters(), AppData::default())
            .await
            .err();
        assert!(matches!(err, Some(SfuError::InvalidState(_))));
    }

    #[tokio::test]
    async fn closing_a_producer_notifies_subscribers() {
        let h = Harness::start(1, None).await;
        let c = &h.coordinator;
        let (_, producer) = publish_audio(&h, &alice()).await;
        c.join(&bob(), r1()).await.unwrap();
        let recv = c.create_transport(&bob(), TransportDirection::Recv).await.unwrap();
        let consumer = c
            .consume(&bob(), recv.id, producer, c.router_rtp_capabilities(&bob()).await.unwrap())
            .await
            .unwrap();

        c.close_producer(&alice(), producer).await.unwrap();

        assert!(c.registries().consumers.get(consumer.id).await.is_none());
        assert_eq!(c.phase(&alice()).await, SessionPhase::Joined);
        eventually!(h
            .notifier
            .for_participant(&bob())
            .await
            .iter()
            .any(|m| matches!(m, ServerMessage::ConsumerClosed { .. })));
        // The owner closed it, so the owner is not notified
        assert!(!h
            .notifier
            .for_participant(&alice())
            .await
            .iter()
            .any(|m| matches!(m, ServerMessage::ProducerClosed { .. })));
    }

    #[tokio::test]
    async fn recreating_a_transport_releases_the_old_one() {
        let h = Harness::start(1, None).await;
        let c = &h.coordinator;
        let (send, producer) = publish_audio(&h, &alice()).await;

        let fresh = c.create_transport(&alice(), TransportDirection::Send).await.unwrap();

        assert_ne!(fresh.id, send);
        assert!(c.registries().transports.get(send).await.is_none());
        assert!(c.registries().producers.get(producer).await.is_none());
        eventually!(h
            .notifier
            .for_participant(&alice())
            .await
            .iter()
            .any(|m| matches!(m, ServerMessage::ProducerClosed { producer_id } if *producer_id == producer)));
    }

    #[tokio::test]
    async fn dtls_loss_cleans_up_and_notifies() {
        let h = Harness::start(1, None).await;
        let c = &h.coordinator;
        let (send, producer) = publish_audio(&h, &alice()).await;

        h.engine.transport(send).await.unwrap().close_dtls().await;

        eventually!(c.registries().transports.get(send).await.is_none());
        eventually!(c.registries().producers.get(producer).await.is_none());
        eventually!(h
            .notifier
            .for_participant(&alice())
            .await
            .iter()
            .any(|m| matches!(m, ServerMessage::ProducerClosed { .. })));
    }

    #[tokio::test]
    async fn switching_rooms_leaves_the_old_one() {
        let h = Harness::start(2, None).await;
        let c = &h.coordinator;
        let (_, producer) = publish_audio(&h, &alice()).await;

        c.join(&alice(), RoomId::new("r2")).await.unwrap();

        assert!(c.registries().producers.get(producer).await.is_none());
        assert!(c.registries().transports.for_participant(&alice()).await.is_empty());
        assert!(c.members(&r1()).await.is_empty());
        assert_eq!(c.members(&RoomId::new("r2")).await, vec![alice()]);
    }

    #[tokio::test]
    async fn idle_router_is_evicted_and_recreated_on_join() {
        let h = Harness::start(1, Some(Duration::from_millis(30))).await;
        let c = &h.coordinator;
        c.join(&alice(), r1()).await.unwrap();
        let first = c.registries().routers.get(&r1()).await.unwrap();

        c.leave(&alice()).await;
        eventually!(c.registries().routers.len().await == 0);
        assert!(first.router.is_closed());

        c.join(&alice(), r1()).await.unwrap();
        let second = c.registries().routers.get(&r1()).await.unwrap();
        assert_ne!(second.router.id(), first.router.id());
    }

    #[tokio::test]
    async fn occupied_room_keeps_its_router() {
        let h = Harness::start(1, Some(Duration::from_millis(20))).await;
        let c = &h.coordinator;
        c.join(&alice(), r1()).await.unwrap();
        let router = c.registries().routers.get(&r1()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!router.router.is_closed());
        assert_eq!(c.registries().routers.len().await, 1);
    }

    #[tokio::test]
    async fn engine_timeout_marks_the_worker_hung() {
        let h = Harness::start(1, None).await;
        let c = &h.coordinator;
        c.join(&alice(), r1()).await.unwrap();
        let router = c.registries().routers.get(&r1()).await.unwrap();
        h.engine.hang(EngineOp::CreateTransport).await;

        let err = c.create_transport(&alice(), TransportDirection::Send).await.err();
        assert!(matches!(err, Some(SfuError::EngineTimeout { op: "create_transport" })));

        h.engine.clear_faults().await;
        eventually!(h.pool.live_workers().await == 1 && router.router.is_closed());

        // The room gets a router on the replacement worker
        let send = c.create_transport(&alice(), TransportDirection::Send).await.unwrap();
        let fresh = c.registries().routers.get(&r1()).await.unwrap();
        assert_ne!(fresh.router.id(), router.router.id());
        assert_eq!(fresh.slot.generation, 1);
        assert_eq!(c.registries().transports.get(send.id).await.unwrap().router.router.id(), fresh.router.id());
    }

    #[tokio::test]
    async fn worker_crash_recreates_router_on_next_access() {
        let h = Harness::start(2, None).await;
        let c = &h.coordinator;
        let (_, producer) = publish_audio(&h, &alice()).await;
        let router = c.registries().routers.get(&r1()).await.unwrap();

        h.engine.workers().await[router.slot.index].kill().await;

        eventually!(c.registries().producers.get(producer).await.is_none());
        assert!(c.registries().transports.for_participant(&alice()).await.is_empty());
        assert!(c.registries().routers.get(&r1()).await.is_none());

        // Still joined; the next request rebuilds the room on a live worker
        let caps = c.router_rtp_capabilities(&alice()).await.unwrap();
        assert!(!caps.codecs.is_empty());
        let fresh = c.registries().routers.get(&r1()).await.unwrap();
        assert_ne!(fresh.router.id(), router.router.id());
    }

    #[tokio::test]
    async fn reachable_participant_keeps_its_session() {
        let h = Harness::start(1, None).await;
        let c = &h.coordinator;
        let (_, producer) = publish_audio(&h, &alice()).await;

        h.notifier.set_online(&alice(), true).await;
        assert!(!c.disconnect_if_unreachable(&alice()).await);
        assert!(c.registries().producers.get(producer).await.is_some());
        assert_eq!(c.phase(&alice()).await, SessionPhase::Publishing);

        h.notifier.set_online(&alice(), false).await;
        assert!(c.disconnect_if_unreachable(&alice()).await);
        assert!(c.registries().producers.get(producer).await.is_none());
        assert_eq!(c.phase(&alice()).await, SessionPhase::Idle);
    }

    #[tokio::test]
    async fn join_queued_behind_a_disconnect_starts_a_fresh_session() {
        let h = Harness::start(1, None).await;
        let c = h.coordinator.clone();
        c.join(&alice(), r1()).await.unwrap();

        // Keep alice's session busy so the next two requests queue in order
        let mut gate = h.engine.hold_next(EngineOp::CreateTransport).await;
        let busy = tokio::spawn({
            let c = c.clone();
            async move { c.create_transport(&alice(), TransportDirection::Send).await.is_ok() }
        });
        gate.entered().await;
        let disconnect = tokio::spawn({
            let c = c.clone();
            async move { c.disconnect(&alice()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let rejoin = tokio::spawn({
            let c = c.clone();
            async move { c.join(&alice(), r1()).await.is_ok() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.release();

        assert!(busy.await.unwrap());
        disconnect.await.unwrap();
        assert!(rejoin.await.unwrap());

        assert_eq!(c.phase(&alice()).await, SessionPhase::Joined);
        assert_eq!(c.members(&r1()).await, vec![alice()]);
        assert!(c.create_transport(&alice(), TransportDirection::Send).await.is_ok());
    }

    #[tokio::test]
    async fn consume_racing_a_producer_close_is_never_announced() {
        let h = Harness::start(1, None).await;
        let c = h.coordinator.clone();
        let (_, producer) = publish_audio(&h, &alice()).await;
        c.join(&bob(), r1()).await.unwrap();
        let recv = c.create_transport(&bob(), TransportDirection::Recv).await.unwrap();
        let caps = c.router_rtp_capabilities(&bob()).await.unwrap();

        let mut gate = h.engine.hold_next(EngineOp::Consume).await;
        let pending = tokio::spawn({
            let c = c.clone();
            async move { c.consume(&bob(), recv.id, producer, caps).await.map(|o| o.id) }
        });
        gate.entered().await;
        c.close_producer(&alice(), producer).await.unwrap();
        gate.release();

        let err = pending.await.unwrap().err();
        assert!(matches!(err, Some(SfuError::NotFound { kind: EntityKind::Producer, .. })));
        assert_eq!(c.registries().consumers.len().await, 0);
        assert_eq!(h.store.len(CONSUMERS).await, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!h
            .notifier
            .for_participant(&bob())
            .await
            .iter()
            .any(|m| matches!(m, ServerMessage::ConsumerClosed { .. })));
    }

    #[tokio::test]
    async fn failed_produce_is_not_announced() {
        let h = Harness::start(1, None).await;
        let c = &h.coordinator;
        c.join(&alice(), r1()).await.unwrap();
        c.join(&bob(), r1()).await.unwrap();
        let send = c.create_transport(&alice(), TransportDirection::Send).await.unwrap();
        h.engine.fail_next(EngineOp::Produce, 1).await;

        let err = c
            .produce(&alice(), send.id, MediaKind::Audio, opus_parameters(), AppData::default())
            .await
            .err();

        assert_eq!(err.map(|e| e.code()), Some(confab_protocol::ErrorCode::EngineFailure));
        assert_eq!(c.phase(&alice()).await, SessionPhase::Joined);
        assert_eq!(h.store.len(PRODUCERS).await, 0);
        assert!(!h
            .notifier
            .for_participant(&bob())
            .await
            .iter()
            .any(|m| matches!(m, ServerMessage::NewProducer { .. })));
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let h = Harness::start(2, Some(Duration::from_secs(60))).await;
        let c = &h.coordinator;
        publish_audio(&h, &alice()).await;
        publish_audio(&h, &bob()).await;

        c.shutdown().await;
        c.shutdown().await;

        let stats = c.stats().await;
        assert_eq!(stats.transports, 0);
        assert_eq!(stats.producers, 0);
        assert_eq!(stats.routers, 0);
        assert_eq!(stats.participants, 0);
        assert_eq!(stats.workers_alive, 0);
        assert_eq!(h.engine.live_workers().await, 0);
    }
}
