//! Worker pool
//!
//! A fixed number of slots, one engine worker each. Routers are spread over
//! the slots round-robin. A worker that dies (or hangs on an engine call) is
//! replaced in its own slot after a delay; the slot generation is bumped so
//! routers bound to the old worker can be recognised as stale.

use crate::error::{Result, SfuError};
use confab_media::{CloseReason, EngineError, MediaEngine, Worker, WorkerId, WorkerSettings};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Position of a worker in the pool, plus which incarnation of that slot it was
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerSlot {
    pub index: usize,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    pub restart_delay: Duration,
    pub call_timeout: Duration,
    pub settings: WorkerSettings,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            restart_delay: Duration::from_millis(2000),
            call_timeout: Duration::from_millis(10_000),
            settings: WorkerSettings::default(),
        }
    }
}

struct Slot {
    /// `None` while the slot waits for a replacement
    worker: Option<Arc<dyn Worker>>,
    generation: u64,
}

pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    config: WorkerPoolConfig,
    slots: RwLock<Vec<Slot>>,
    next: AtomicUsize,
    closed: AtomicBool,
    me: Weak<WorkerPool>,
}

/// Run an engine call under a deadline
pub(crate) async fn timed<T>(
    limit: Duration,
    op: &'static str,
    call: impl Future<Output = std::result::Result<T, EngineError>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(SfuError::Engine { op, source }),
        Err(_) => Err(SfuError::EngineTimeout { op }),
    }
}

impl WorkerPool {
    /// Create every worker up front. Any allocation failure is fatal.
    pub async fn start(engine: Arc<dyn MediaEngine>, config: WorkerPoolConfig) -> Result<Arc<Self>> {
        if config.num_workers == 0 {
            return Err(SfuError::WorkerUnavailable);
        }

        let mut workers: Vec<Arc<dyn Worker>> = Vec::with_capacity(config.num_workers);
        for index in 0..config.num_workers {
            let created = timed(
                config.call_timeout,
                "create_worker",
                engine.create_worker(&config.settings),
            )
            .await;
            match created {
                Ok(worker) => {
                    info!(worker_index = index, worker_id = %worker.id(), "Media worker started");
                    workers.push(worker);
                }
                Err(e) => {
                    error!(worker_index = index, error = %e, "Failed to create media worker");
                    for worker in workers {
                        worker.close().await;
                    }
                    return Err(e);
                }
            }
        }

        let slots = workers
            .iter()
            .map(|worker| Slot {
                worker: Some(worker.clone()),
                generation: 0,
            })
            .collect();
        let pool = Arc::new_cyclic(|me| Self {
            engine,
            config,
            slots: RwLock::new(slots),
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            me: me.clone(),
        });
        for (index, worker) in workers.iter().enumerate() {
            pool.watch(WorkerSlot { index, generation: 0 }, worker);
        }

        Ok(pool)
    }

    /// Next live worker, round-robin over the slots. Dead slots are skipped.
    pub async fn next(&self) -> Result<(WorkerSlot, Arc<dyn Worker>)> {
        if self.is_closed() {
            return Err(SfuError::WorkerUnavailable);
        }

        let slots = self.slots.read().await;
        let size = slots.len();
        for _ in 0..size {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % size;
            let slot = &slots[index];
            if let Some(worker) = slot.worker.as_ref().filter(|w| !w.is_closed()) {
                let slot_ref = WorkerSlot {
                    index,
                    generation: slot.generation,
                };
                return Ok((slot_ref, worker.clone()));
            }
        }

        Err(SfuError::WorkerUnavailable)
    }

    /// Run an engine call on behalf of the worker in `slot`. A timeout marks the worker hung.
    pub async fn call<T>(
        &self,
        slot: WorkerSlot,
        op: &'static str,
        call: impl Future<Output = std::result::Result<T, EngineError>>,
    ) -> Result<T> {
        let result = timed(self.config.call_timeout, op, call).await;
        if let Err(SfuError::EngineTimeout { .. }) = &result {
            warn!(
                op,
                worker_index = slot.index,
                timeout_ms = self.config.call_timeout.as_millis() as u64,
                "Engine call timed out"
            );
            self.report_hung(slot).await;
        }
        result
    }

    /// Whether `slot` still refers to the live worker it was handed out for
    pub async fn is_current(&self, slot: WorkerSlot) -> bool {
        self.slots
            .read()
            .await
            .get(slot.index)
            .filter(|s| s.generation == slot.generation)
            .and_then(|s| s.worker.as_ref())
            .is_some_and(|w| !w.is_closed())
    }

    /// Close a worker that stopped answering and put a fresh one in its slot
    pub async fn report_hung(&self, slot: WorkerSlot) {
        let Some(worker) = self.take(slot).await else {
            return;
        };
        error!(worker_index = slot.index, worker_id = %worker.id(), "Media worker hung, replacing it");
        self.schedule_replacement(slot.index);
        tokio::spawn(async move {
            worker.close().await;
        });
    }

    pub async fn live_workers(&self) -> usize {
        self.slots
            .read()
            .await
            .iter()
            .filter(|s| s.worker.as_ref().is_some_and(|w| !w.is_closed()))
            .count()
    }

    pub fn size(&self) -> usize {
        self.config.num_workers
    }

    /// Worker currently in `index`, if it is alive
    pub async fn worker_id(&self, index: usize) -> Option<WorkerId> {
        self.slots
            .read()
            .await
            .get(index)
            .and_then(|s| s.worker.as_ref())
            .filter(|w| !w.is_closed())
            .map(|w| w.id())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every worker. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers: Vec<_> = self
            .slots
            .write()
            .await
            .iter_mut()
            .filter_map(|s| s.worker.take())
            .collect();
        for worker in workers {
            worker.close().await;
        }
        info!("Worker pool shut down");
    }

    /// Remove the worker from its slot if the slot still holds that incarnation
    async fn take(&self, slot: WorkerSlot) -> Option<Arc<dyn Worker>> {
        let mut slots = self.slots.write().await;
        match slots.get_mut(slot.index) {
            Some(s) if s.generation == slot.generation => s.worker.take(),
            _ => None,
        }
    }

    fn watch(&self, slot: WorkerSlot, worker: &Arc<dyn Worker>) {
        let pool = self.me.clone();
        let signal = worker.closed();
        let worker_id = worker.id();
        tokio::spawn(async move {
            let reason = signal.wait().await;
            if let Some(pool) = pool.upgrade() {
                pool.on_worker_closed(slot, worker_id, reason).await;
            }
        });
    }

    async fn on_worker_closed(&self, slot: WorkerSlot, worker_id: WorkerId, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        // Already handled (hung report) or already replaced
        if self.take(slot).await.is_none() {
            return;
        }
        error!(
            worker_index = slot.index,
            worker_id = %worker_id,
            %reason,
            restart_delay_ms = self.config.restart_delay.as_millis() as u64,
            "Media worker terminated, scheduling replacement"
        );
        self.schedule_replacement(slot.index);
    }

    fn schedule_replacement(&self, index: usize) {
        let engine = self.engine.clone();
        let config = self.config.clone();
        let pool = self.me.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(config.restart_delay).await;
                if pool.upgrade().is_none_or(|p| p.is_closed()) {
                    return;
                }
                let created = timed(
                    config.call_timeout,
                    "create_worker",
                    engine.create_worker(&config.settings),
                )
                .await;
                match created {
                    Ok(worker) => {
                        match pool.upgrade() {
                            Some(pool) => pool.install(index, worker).await,
                            None => worker.close().await,
                        }
                        return;
                    }
                    Err(e) => {
                        error!(worker_index = index, error = %e, "Failed to replace media worker, retrying");
                    }
                }
            }
        });
    }

    async fn install(&self, index: usize, worker: Arc<dyn Worker>) {
        let installed = {
            let mut slots = self.slots.write().await;
            match slots.get_mut(index) {
                Some(slot) if !self.is_closed() && slot.worker.is_none() => {
                    slot.generation += 1;
                    slot.worker = Some(worker.clone());
                    Some(WorkerSlot {
                        index,
                        generation: slot.generation,
                    })
                }
                _ => None,
            }
        };

        match installed {
            Some(slot) => {
                info!(
                    worker_index = index,
                    worker_id = %worker.id(),
                    generation = slot.generation,
                    "Media worker replaced"
                );
                self.watch(slot, &worker);
            }
            None => worker.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::test_support::{eventually, pool_config};
    use confab_media::{codec, EngineOp, LoopbackEngine};

    #[tokio::test]
    async fn round_robin_starts_at_slot_zero() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::start(Arc::new(engine.clone()), pool_config(2)).await.unwrap();

        let first = pool.next().await.unwrap().0;
        let second = pool.next().await.unwrap().0;
        let third = pool.next().await.unwrap().0;
        assert_eq!((first.index, second.index, third.index), (0, 1, 0));
        assert_eq!(engine.live_workers().await, 2);
    }

    #[tokio::test]
    async fn allocation_failure_at_startup_is_fatal() {
        let engine = LoopbackEngine::new();
        engine.fail_next(EngineOp::CreateWorker, 1).await;

        let result = WorkerPool::start(Arc::new(engine.clone()), pool_config(2)).await;
        assert!(matches!(result.err(), Some(SfuError::Engine { op: "create_worker", .. })));
        assert_eq!(engine.live_workers().await, 0);
    }

    #[tokio::test]
    async fn empty_pool_is_refused() {
        let engine = LoopbackEngine::new();
        let result = WorkerPool::start(Arc::new(engine), pool_config(0)).await;
        assert!(matches!(result.err(), Some(SfuError::WorkerUnavailable)));
    }

    #[tokio::test]
    async fn dead_worker_is_skipped_then_replaced_in_place() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::start(Arc::new(engine.clone()), pool_config(2)).await.unwrap();
        let (slot, worker) = pool.next().await.unwrap();
        assert_eq!(slot.index, 0);

        engine.worker(worker.id()).await.unwrap().kill().await;
        assert!(!pool.is_current(slot).await);

        eventually!(pool.live_workers().await == 2);
        let replacement = pool.worker_id(0).await.unwrap();
        assert_ne!(replacement, worker.id());

        // Round-robin continues over both slots
        let a = pool.next().await.unwrap().0;
        let b = pool.next().await.unwrap().0;
        assert_ne!(a.index, b.index);
        let fresh = if a.index == 0 { a } else { b };
        assert_eq!(fresh.generation, 1);
    }

    #[tokio::test]
    async fn timed_out_call_replaces_the_worker() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::start(Arc::new(engine.clone()), pool_config(1)).await.unwrap();
        let (slot, worker) = pool.next().await.unwrap();
        engine.hang(EngineOp::CreateRouter).await;

        let result = pool
            .call(slot, "create_router", worker.create_router(&codec::router_codecs()))
            .await;
        assert!(matches!(result, Err(SfuError::EngineTimeout { op: "create_router" })));
        assert!(!pool.is_current(slot).await);

        engine.clear_faults().await;
        eventually!(pool.live_workers().await == 1 && worker.is_closed());
        assert_eq!(pool.next().await.unwrap().0.generation, 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::start(Arc::new(engine.clone()), pool_config(3)).await.unwrap();

        pool.shutdown().await;
        pool.shutdown().await;

        assert_eq!(engine.live_workers().await, 0);
        assert!(matches!(pool.next().await, Err(SfuError::WorkerUnavailable)));
    }
}
