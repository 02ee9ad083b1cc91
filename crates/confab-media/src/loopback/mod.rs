//! In-process media engine
//!
//! Implements the engine contract (ownership, close cascades, paused consumers,
//! capability checks) without moving any media. Used by the test suites and by
//! the server binary until a native engine binding is plugged in.
//!
//! Faults can be injected per operation: fail the next call, hold the next call
//! until released, hang forever, kill a worker, or end a transport's DTLS session.

mod transport;

pub use transport::{LoopbackConsumer, LoopbackProducer, LoopbackTransport};

use crate::codec;
use crate::engine::{
    MediaEngine, Producer, Router, Transport, WebRtcTransportSettings, Worker, WorkerId,
    WorkerSettings,
};
use crate::error::EngineError;
use crate::signal::{CloseNotifier, CloseReason, CloseSignal};
use async_trait::async_trait;
use confab_protocol::{ProducerId, RouterId, RtpCapabilities, RtpCodecCapability, TransportId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, Mutex};

/// Engine operations that can be made to fail or hang
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreateWorker,
    CreateRouter,
    CreateTransport,
    Connect,
    Produce,
    Consume,
    Resume,
}

/// Holds the next call of an operation in flight until released.
/// Dropping the gate releases the call too.
#[derive(Debug)]
pub struct EngineGate {
    entered: Option<oneshot::Receiver<()>>,
    release: oneshot::Sender<()>,
}

impl EngineGate {
    /// Wait until the held call has reached the engine
    pub async fn entered(&mut self) {
        if let Some(entered) = self.entered.take() {
            let _ = entered.await;
        }
    }

    pub fn release(self) {
        let _ = self.release.send(());
    }
}

#[derive(Debug)]
struct HeldCall {
    entered: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_next: Mutex<HashMap<EngineOp, usize>>,
    hang: Mutex<Vec<EngineOp>>,
    held: Mutex<HashMap<EngineOp, HeldCall>>,
}

impl Faults {
    async fn check(&self, op: EngineOp) -> Result<(), EngineError> {
        let held = self.held.lock().await.remove(&op);
        if let Some(held) = held {
            tracing::debug!(?op, "loopback engine holding call");
            let _ = held.entered.send(());
            let _ = held.release.await;
        }

        let hang = self.hang.lock().await.contains(&op);
        if hang {
            tracing::debug!(?op, "loopback engine hanging call");
            std::future::pending::<()>().await;
        }

        let mut fail_next = self.fail_next.lock().await;
        if let Some(remaining) = fail_next.get_mut(&op) {
            *remaining -= 1;
            if *remaining == 0 {
                fail_next.remove(&op);
            }
            return Err(match op {
                EngineOp::CreateWorker => {
                    EngineError::WorkerCreation("injected allocation failure".to_string())
                }
                _ => EngineError::Rejected(format!("injected failure in {op:?}")),
            });
        }

        Ok(())
    }
}

#[derive(Default)]
struct EngineInner {
    faults: Faults,
    workers: Mutex<Vec<Arc<LoopbackWorker>>>,
    transports: Mutex<HashMap<TransportId, Weak<LoopbackTransport>>>,
}

/// In-process engine. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct LoopbackEngine {
    inner: Arc<EngineInner>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls of `op` fail
    pub async fn fail_next(&self, op: EngineOp, count: usize) {
        if count == 0 {
            return;
        }
        *self.inner.faults.fail_next.lock().await.entry(op).or_insert(0) += count;
    }

    /// Hold the next call of `op` until the returned gate is released
    pub async fn hold_next(&self, op: EngineOp) -> EngineGate {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        self.inner.faults.held.lock().await.insert(
            op,
            HeldCall {
                entered: entered_tx,
                release: release_rx,
            },
        );
        EngineGate {
            entered: Some(entered_rx),
            release: release_tx,
        }
    }

    /// Make every future call of `op` hang forever
    pub async fn hang(&self, op: EngineOp) {
        self.inner.faults.hang.lock().await.push(op);
    }

    pub async fn clear_faults(&self) {
        self.inner.faults.fail_next.lock().await.clear();
        self.inner.faults.hang.lock().await.clear();
        self.inner.faults.held.lock().await.clear();
    }

    /// Spawned workers in creation order. Closed workers are dropped once the next one starts.
    pub async fn workers(&self) -> Vec<Arc<LoopbackWorker>> {
        self.inner.workers.lock().await.clone()
    }

    pub async fn live_workers(&self) -> usize {
        self.inner
            .workers
            .lock()
            .await
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }

    pub async fn worker(&self, id: WorkerId) -> Option<Arc<LoopbackWorker>> {
        self.inner
            .workers
            .lock()
            .await
            .iter()
            .find(|w| w.id == id)
            .cloned()
    }

    pub async fn transport(&self, id: TransportId) -> Option<Arc<LoopbackTransport>> {
        self.inner.transports.lock().await.get(&id)?.upgrade()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_worker(&self, settings: &WorkerSettings) -> Result<Arc<dyn Worker>, EngineError> {
        self.inner.faults.check(EngineOp::CreateWorker).await?;

        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::WorkerCreation(format!(
                "empty RTC port range {}-{}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let worker = Arc::new_cyclic(|me| LoopbackWorker {
            id: WorkerId::new(),
            me: me.clone(),
            engine: Arc::downgrade(&self.inner),
            ports: Arc::new(PortRange::new(settings.rtc_min_port, settings.rtc_max_port)),
            routers: Mutex::new(Vec::new()),
            notifier: CloseNotifier::new(),
        });
        {
            let mut workers = self.inner.workers.lock().await;
            workers.retain(|w| !w.is_closed());
            workers.push(worker.clone());
        }

        tracing::debug!(worker_id = %worker.id, "loopback worker started");
        Ok(worker)
    }
}

/// Hands out RTC ports round the configured range
#[derive(Debug)]
pub(crate) struct PortRange {
    min: u16,
    span: u32,
    next: AtomicU32,
}

impl PortRange {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            span: u32::from(max - min) + 1,
            next: AtomicU32::new(0),
        }
    }

    pub(crate) fn next(&self) -> u16 {
        let offset = self.next.fetch_add(1, Ordering::Relaxed) % self.span;
        // offset < span <= u16 range, so the sum fits
        self.min.saturating_add(offset as u16)
    }
}

pub struct LoopbackWorker {
    id: WorkerId,
    me: Weak<LoopbackWorker>,
    engine: Weak<EngineInner>,
    ports: Arc<PortRange>,
    routers: Mutex<Vec<Arc<LoopbackRouter>>>,
    notifier: CloseNotifier,
}

impl LoopbackWorker {
    /// Simulate an unexpected termination of the worker process
    pub async fn kill(&self) {
        tracing::debug!(worker_id = %self.id, "loopback worker killed");
        self.shutdown(CloseReason::WorkerDied).await;
    }

    pub async fn router_count(&self) -> usize {
        self.routers.lock().await.len()
    }

    async fn shutdown(&self, reason: CloseReason) {
        if !self.notifier.close(reason) {
            return;
        }
        let router_reason = match reason {
            CloseReason::WorkerDied => CloseReason::WorkerDied,
            _ => CloseReason::WorkerClosed,
        };
        let routers = std::mem::take(&mut *self.routers.lock().await);
        for router in routers {
            router.shutdown(router_reason).await;
        }
    }

    async fn forget_router(&self, id: RouterId) {
        self.routers.lock().await.retain(|r| r.id != id);
    }
}

#[async_trait]
impl Worker for LoopbackWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn Router>, EngineError> {
        let engine = self.engine.upgrade().ok_or(EngineError::WorkerClosed)?;
        engine.faults.check(EngineOp::CreateRouter).await?;
        if self.is_closed() {
            return Err(EngineError::WorkerClosed);
        }
        if codecs.is_empty() {
            return Err(EngineError::Unsupported("router needs at least one codec".to_string()));
        }

        let router = Arc::new_cyclic(|me| LoopbackRouter {
            id: RouterId::new(),
            me: me.clone(),
            worker: self.me.clone(),
            engine: self.engine.clone(),
            ports: self.ports.clone(),
            codecs: codecs.to_vec(),
            transports: Mutex::new(Vec::new()),
            producers: Mutex::new(HashMap::new()),
            notifier: CloseNotifier::new(),
        });
        self.routers.lock().await.push(router.clone());
        Ok(router)
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

pub struct LoopbackRouter {
    id: RouterId,
    me: Weak<LoopbackRouter>,
    worker: Weak<LoopbackWorker>,
    engine: Weak<EngineInner>,
    ports: Arc<PortRange>,
    codecs: Vec<RtpCodecCapability>,
    transports: Mutex<Vec<Arc<LoopbackTransport>>>,
    producers: Mutex<HashMap<ProducerId, Weak<LoopbackProducer>>>,
    notifier: CloseNotifier,
}

impl LoopbackRouter {
    async fn shutdown(&self, reason: CloseReason) {
        if !self.notifier.close(reason) {
            return;
        }
        let transports = std::mem::take(&mut *self.transports.lock().await);
        for transport in transports {
            transport.shutdown(CloseReason::RouterClosed).await;
        }
        self.producers.lock().await.clear();
        if let Some(worker) = self.worker.upgrade() {
            worker.forget_router(self.id).await;
        }
    }

    pub(crate) fn codecs(&self) -> &[RtpCodecCapability] {
        &self.codecs
    }

    pub(crate) async fn live_producer(&self, id: ProducerId) -> Option<Arc<LoopbackProducer>> {
        self.producers
            .lock()
            .await
            .get(&id)?
            .upgrade()
            .filter(|p| !p.is_closed())
    }

    pub(crate) async fn register_producer(&self, producer: &Arc<LoopbackProducer>) {
        self.producers
            .lock()
            .await
            .insert(producer.id(), Arc::downgrade(producer));
    }

    pub(crate) async fn forget_producer(&self, id: ProducerId) {
        self.producers.lock().await.remove(&id);
    }

    pub(crate) async fn forget_transport(&self, id: TransportId) {
        self.transports.lock().await.retain(|t| t.id() != id);
    }
}

#[async_trait]
impl Router for LoopbackRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        codec::capabilities_of(&self.codecs)
    }

    async fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.live_producer(producer_id).await else {
            return false;
        };
        producer
            .rtp_parameters_ref()
            .codecs
            .iter()
            .any(|c| codec::supports(&capabilities.codecs, c) && codec::supports(&self.codecs, c))
    }

    async fn create_webrtc_transport(
        &self,
        settings: &WebRtcTransportSettings,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        let engine = self.engine.upgrade().ok_or(EngineError::RouterClosed)?;
        engine.faults.check(EngineOp::CreateTransport).await?;
        if self.is_closed() {
            return Err(EngineError::RouterClosed);
        }
        if settings.listen_ips.is_empty() || !(settings.enable_udp || settings.enable_tcp) {
            return Err(EngineError::Rejected(
                "transport needs a listen ip and at least one of udp/tcp".to_string(),
            ));
        }

        let transport = LoopbackTransport::new(
            self.me.clone(),
            self.engine.clone(),
            settings,
            &self.ports,
        );
        self.transports.lock().await.push(transport.clone());
        engine
            .transports
            .lock()
            .await
            .insert(transport.id(), Arc::downgrade(&transport));
        Ok(transport)
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
