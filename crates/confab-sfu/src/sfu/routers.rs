//! Room → router registry
//!
//! Each room maps to a creation cell. Concurrent `get_or_create` calls for a
//! room that has no router yet all await the same in-flight creation, so a
//! room never ends up with two routers.

use super::workers::{WorkerPool, WorkerSlot};
use crate::error::{Result, SfuError};
use crate::shadow::{RouterRecord, ShadowMirror, ROUTERS};
use chrono::Utc;
use confab_media::Router;
use confab_protocol::{RoomId, RtpCodecCapability};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

/// Attempts at replacing a stale router before giving up
const MAX_CREATE_ATTEMPTS: usize = 3;

pub struct RouterEntry {
    pub room_id: RoomId,
    pub router: Arc<dyn Router>,
    pub slot: WorkerSlot,
}

type RouterCell = Arc<OnceCell<Arc<RouterEntry>>>;

pub struct RouterRegistry {
    pool: Arc<WorkerPool>,
    codecs: Vec<RtpCodecCapability>,
    rooms: Mutex<HashMap<RoomId, RouterCell>>,
    shadow: ShadowMirror,
}

impl RouterRegistry {
    pub fn new(pool: Arc<WorkerPool>, codecs: Vec<RtpCodecCapability>, shadow: ShadowMirror) -> Self {
        Self {
            pool,
            codecs,
            rooms: Mutex::new(HashMap::new()),
            shadow,
        }
    }

    /// Router of `room_id`, created on a pool worker if the room has none
    /// (or only a stale one bound to a dead worker).
    pub async fn get_or_create(&self, room_id: &RoomId) -> Result<Arc<RouterEntry>> {
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let cell = self.cell(room_id).await;
            match cell.get_or_try_init(|| self.create(room_id)).await {
                Ok(entry) => {
                    if self.is_live(entry).await {
                        return Ok(entry.clone());
                    }
                    warn!(
                        room_id = %room_id,
                        router_id = %entry.router.id(),
                        worker_index = entry.slot.index,
                        "Router bound to a dead worker, recreating it"
                    );
                    self.evict(room_id, &cell).await;
                }
                Err(e) => {
                    self.forget_failed(room_id, &cell).await;
                    return Err(e);
                }
            }
        }
        Err(SfuError::WorkerUnavailable)
    }

    /// Router of `room_id`, without creating one. Stale routers are not returned.
    pub async fn get(&self, room_id: &RoomId) -> Option<Arc<RouterEntry>> {
        let entry = self.rooms.lock().await.get(room_id)?.get()?.clone();
        self.is_live(&entry).await.then_some(entry)
    }

    /// Close and deregister the router of `room_id`
    pub async fn remove(&self, room_id: &RoomId) -> bool {
        let Some(cell) = self.rooms.lock().await.remove(room_id) else {
            return false;
        };
        let Some(entry) = cell.get() else {
            return false;
        };
        entry.router.close().await;
        self.shadow.remove(ROUTERS, room_id.as_str()).await;
        info!(room_id = %room_id, router_id = %entry.router.id(), "Router closed");
        true
    }

    pub async fn room_ids(&self) -> Vec<RoomId> {
        self.rooms
            .lock()
            .await
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(room_id, _)| room_id.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.room_ids().await.len()
    }

    /// Close every router
    pub async fn close_all(&self) {
        for room_id in self.room_ids().await {
            self.remove(&room_id).await;
        }
    }

    async fn cell(&self, room_id: &RoomId) -> RouterCell {
        self.rooms
            .lock()
            .await
            .entry(room_id.clone())
            .or_default()
            .clone()
    }

    async fn create(&self, room_id: &RoomId) -> Result<Arc<RouterEntry>> {
        let (slot, worker) = self.pool.next().await?;
        let router = self
            .pool
            .call(slot, "create_router", worker.create_router(&self.codecs))
            .await?;

        self.shadow
            .put(
                ROUTERS,
                room_id.as_str(),
                &RouterRecord {
                    room_id: room_id.clone(),
                    worker_index: slot.index,
                    router_id: router.id(),
                    created_at: Utc::now(),
                },
            )
            .await;
        info!(
            room_id = %room_id,
            router_id = %router.id(),
            worker_index = slot.index,
            "Router created"
        );

        Ok(Arc::new(RouterEntry {
            room_id: room_id.clone(),
            router,
            slot,
        }))
    }

    async fn is_live(&self, entry: &RouterEntry) -> bool {
        !entry.router.is_closed() && self.pool.is_current(entry.slot).await
    }

    /// Drop a stale cell, unless someone already replaced it
    async fn evict(&self, room_id: &RoomId, cell: &RouterCell) {
        let removed = {
            let mut rooms = self.rooms.lock().await;
            match rooms.get(room_id) {
                Some(current) if Arc::ptr_eq(current, cell) => rooms.remove(room_id),
                _ => None,
            }
        };
        if let Some(entry) = removed.as_ref().and_then(|cell| cell.get()) {
            entry.router.close().await;
            self.shadow.remove(ROUTERS, room_id.as_str()).await;
        }
    }

    /// A failed creation leaves no entry behind
    async fn forget_failed(&self, room_id: &RoomId, cell: &RouterCell) {
        let mut rooms = self.rooms.lock().await;
        if let Some(current) = rooms.get(room_id) {
            if Arc::ptr_eq(current, cell) && !current.initialized() {
                rooms.remove(room_id);
            }
        }
    }
}
