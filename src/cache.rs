//! Optional write-through room cache.
//!
//! The in-memory store is authoritative for the process; the cache exists
//! for cross-process visibility and post-restart inspection. Writes go
//! through on every committed room mutation, reads never fall back to it,
//! and any cache failure degrades to in-memory behavior.

use async_trait::async_trait;
use tracing::warn;

use crate::room::{Room, RoomId};

/// Abstract put/get/delete keyed by room id.
#[async_trait]
pub trait RoomCache: Send + Sync {
    async fn put(&self, room: &Room) -> Result<(), CacheError>;
    async fn delete(&self, id: &RoomId) -> Result<(), CacheError>;
    /// For diagnostics only; the store never repopulates from the cache.
    async fn get(&self, id: &RoomId) -> Result<Option<Room>, CacheError>;
    /// Whether the backend is reachable, for health reporting.
    async fn healthy(&self) -> bool;
    fn name(&self) -> &'static str;
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Default backend: no external cache configured.
pub struct NullCache;

#[async_trait]
impl RoomCache for NullCache {
    async fn put(&self, _room: &Room) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _id: &RoomId) -> Result<(), CacheError> {
        Ok(())
    }

    async fn get(&self, _id: &RoomId) -> Result<Option<Room>, CacheError> {
        Ok(None)
    }

    async fn healthy(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

/// Redis write-through backend.
pub struct RedisCache {
    manager: redis::aio::ConnectionManager,
}

impl RedisCache {
    const KEY_PREFIX: &'static str = "room:";

    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::Backend(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(Self { manager })
    }

    fn key(id: &RoomId) -> String {
        format!("{}{}", Self::KEY_PREFIX, id)
    }
}

#[async_trait]
impl RoomCache for RedisCache {
    async fn put(&self, room: &Room) -> Result<(), CacheError> {
        let payload = serde_json::to_string(room)?;
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(Self::key(&room.id))
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn delete(&self, id: &RoomId) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(Self::key(id))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn get(&self, id: &RoomId) -> Result<Option<Room>, CacheError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn healthy(&self) -> bool {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Log-and-continue wrapper for advisory cache writes.
pub async fn write_through(cache: &dyn RoomCache, room: &Room) {
    if let Err(err) = cache.put(room).await {
        warn!(room = %room.id, "cache write-through failed: {err}");
    }
}

/// Log-and-continue wrapper for advisory cache deletes.
pub async fn evict(cache: &dyn RoomCache, id: &RoomId) {
    if let Err(err) = cache.delete(id).await {
        warn!(room = %id, "cache eviction failed: {err}");
    }
}
