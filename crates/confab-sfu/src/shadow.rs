//! Shadow state
//!
//! A secondary, non-authoritative copy of router/transport/producer/consumer
//! metadata kept in an external key-value store for operational visibility.
//! The in-process registries stay the source of truth; nothing here is read
//! back to make decisions while the process is running.
//!
//! Each collection is one Redis hash (`HSET sfu:producers <id> <json>`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use confab_protocol::{
    ConsumerId, MediaKind, MediaSource, ParticipantId, ProducerId, RoomId, RouterId,
    TransportDirection, TransportId,
};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, warn};

pub const ROUTERS: &str = "sfu:routers";
pub const TRANSPORTS: &str = "sfu:transports";
pub const PRODUCERS: &str = "sfu:producers";
pub const CONSUMERS: &str = "sfu:consumers";

pub const COLLECTIONS: [&str; 4] = [ROUTERS, TRANSPORTS, PRODUCERS, CONSUMERS];

#[derive(Error, Debug)]
pub enum ShadowError {
    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait ShadowStateStore: Send + Sync {
    async fn set_field(&self, collection: &str, key: &str, value: &str) -> Result<(), ShadowError>;

    async fn get_field(&self, collection: &str, key: &str) -> Result<Option<String>, ShadowError>;

    async fn delete_field(&self, collection: &str, key: &str) -> Result<(), ShadowError>;

    /// Drop a whole collection
    async fn clear(&self, collection: &str) -> Result<(), ShadowError>;
}

/// Redis-backed store. Cheap to clone; the multiplexed connection is shared.
#[derive(Clone)]
pub struct RedisShadowStore {
    connection: MultiplexedConnection,
}

impl RedisShadowStore {
    pub async fn connect(redis_url: &str) -> Result<Self, ShadowError> {
        // The URL may carry credentials, keep it out of the logs
        let client = Client::open(redis_url).map_err(|e| {
            error!(target: "sfu.shadow", error = %e, "Failed to open Redis client");
            ShadowError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "sfu.shadow", error = %e, "Failed to connect to Redis");
                ShadowError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self { connection })
    }
}

#[async_trait]
impl ShadowStateStore for RedisShadowStore {
    async fn set_field(&self, collection: &str, key: &str, value: &str) -> Result<(), ShadowError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .hset(collection, key, value)
            .await
            .map_err(|e| ShadowError::Redis(format!("HSET {collection} failed: {e}")))?;
        Ok(())
    }

    async fn get_field(&self, collection: &str, key: &str) -> Result<Option<String>, ShadowError> {
        let mut conn = self.connection.clone();
        conn.hget(collection, key)
            .await
            .map_err(|e| ShadowError::Redis(format!("HGET {collection} failed: {e}")))
    }

    async fn delete_field(&self, collection: &str, key: &str) -> Result<(), ShadowError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .hdel(collection, key)
            .await
            .map_err(|e| ShadowError::Redis(format!("HDEL {collection} failed: {e}")))?;
        Ok(())
    }

    async fn clear(&self, collection: &str) -> Result<(), ShadowError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(collection)
            .await
            .map_err(|e| ShadowError::Redis(format!("DEL {collection} failed: {e}")))?;
        Ok(())
    }
}

/// In-process store, used when no Redis URL is configured and in tests
#[derive(Default)]
pub struct MemoryShadowStore {
    collections: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryShadowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ShadowStateStore for MemoryShadowStore {
    async fn set_field(&self, collection: &str, key: &str, value: &str) -> Result<(), ShadowError> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_field(&self, collection: &str, key: &str) -> Result<Option<String>, ShadowError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|fields| fields.get(key).cloned()))
    }

    async fn delete_field(&self, collection: &str, key: &str) -> Result<(), ShadowError> {
        if let Some(fields) = self.collections.write().await.get_mut(collection) {
            fields.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, collection: &str) -> Result<(), ShadowError> {
        self.collections.write().await.remove(collection);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterRecord {
    pub room_id: RoomId,
    pub worker_index: usize,
    pub router_id: RouterId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportRecord {
    pub transport_id: TransportId,
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
    pub direction: TransportDirection,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerRecord {
    pub producer_id: ProducerId,
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub source: Option<MediaSource>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerRecord {
    pub consumer_id: ConsumerId,
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub created_at: DateTime<Utc>,
}

/// Write-behind helper used by the registries. Failures are logged, never returned.
#[derive(Clone)]
pub struct ShadowMirror {
    store: Arc<dyn ShadowStateStore>,
}

impl ShadowMirror {
    pub fn new(store: Arc<dyn ShadowStateStore>) -> Self {
        Self { store }
    }

    pub async fn put<T: Serialize>(&self, collection: &str, key: &str, record: &T) {
        let value = match serde_json::to_string(record) {
            Ok(value) => value,
            Err(e) => {
                warn!(target: "sfu.shadow", collection, key, error = %e, "Failed to encode shadow record");
                return;
            }
        };
        if let Err(e) = self.store.set_field(collection, key, &value).await {
            warn!(target: "sfu.shadow", collection, key, error = %e, "Failed to mirror record");
        }
    }

    pub async fn remove(&self, collection: &str, key: &str) {
        if let Err(e) = self.store.delete_field(collection, key).await {
            warn!(target: "sfu.shadow", collection, key, error = %e, "Failed to drop mirrored record");
        }
    }

    /// Read a record back. Only for inspection; never used for decisions.
    pub async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<T>, ShadowError> {
        match self.store.get_field(collection, key).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Engine state does not survive a restart, so neither may its shadow
    pub async fn reset(&self) -> Result<(), ShadowError> {
        for collection in COLLECTIONS {
            self.store.clear(collection).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mirror_round_trips_records() {
        let store = Arc::new(MemoryShadowStore::new());
        let mirror = ShadowMirror::new(store.clone());
        let router_id = RouterId::new();

        mirror
            .put(
                ROUTERS,
                "r1",
                &RouterRecord {
                    room_id: RoomId::new("r1"),
                    worker_index: 2,
                    router_id,
                    created_at: Utc::now(),
                },
            )
            .await;

        let record: RouterRecord = mirror.get(ROUTERS, "r1").await.unwrap().unwrap();
        assert_eq!(record.worker_index, 2);
        assert_eq!(record.router_id, router_id);

        mirror.remove(ROUTERS, "r1").await;
        assert_eq!(store.len(ROUTERS).await, 0);
    }

    #[tokio::test]
    async fn reset_clears_every_collection() {
        let store = Arc::new(MemoryShadowStore::new());
        for collection in COLLECTIONS {
            store.set_field(collection, "k", "{}").await.unwrap();
        }

        ShadowMirror::new(store.clone()).reset().await.unwrap();

        for collection in COLLECTIONS {
            assert_eq!(store.len(collection).await, 0);
        }
    }
}
