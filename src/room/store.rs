//! Room Store
//!
//! Owns the set of active rooms. Each room sits behind its own lock; taking
//! the write guard is the per-room critical section every mutation runs in.
//! Reads of a single room return a coherent snapshot. An optional cache
//! receives write-through copies of committed mutations.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::cache::{self, RoomCache};
use crate::room::{Room, RoomId};

/// Shared handle to one room.
pub type RoomHandle = Arc<RwLock<Room>>;

pub struct RoomStore {
    rooms: RwLock<BTreeMap<RoomId, RoomHandle>>,
    cache: Arc<dyn RoomCache>,
}

impl RoomStore {
    pub fn new(cache: Arc<dyn RoomCache>) -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
            cache,
        }
    }

    /// Allocate an unused room id.
    pub async fn allocate_id(&self) -> RoomId {
        let rooms = self.rooms.read().await;
        loop {
            let id = RoomId::generate();
            if !rooms.contains_key(&id) {
                return id;
            }
        }
    }

    /// Insert a freshly created room and write it through to the cache.
    pub async fn insert(&self, room: Room) -> RoomHandle {
        let id = room.id.clone();
        cache::write_through(self.cache.as_ref(), &room).await;
        let handle = Arc::new(RwLock::new(room));
        self.rooms.write().await.insert(id, handle.clone());
        handle
    }

    pub async fn get(&self, id: &RoomId) -> Option<RoomHandle> {
        self.rooms.read().await.get(id).cloned()
    }

    /// Drop a room and evict its cache entry.
    pub async fn remove(&self, id: &RoomId) -> Option<RoomHandle> {
        let removed = self.rooms.write().await.remove(id);
        if removed.is_some() {
            cache::evict(self.cache.as_ref(), id).await;
        }
        removed
    }

    /// Snapshot of all room handles, for sweeps and the catalog.
    pub async fn enumerate(&self) -> Vec<RoomHandle> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Write a committed room snapshot through to the cache.
    ///
    /// Callers take the snapshot inside the room's critical section and
    /// persist after releasing it; the cache is advisory and must not
    /// extend the section.
    pub async fn persist(&self, snapshot: &Room) {
        cache::write_through(self.cache.as_ref(), snapshot).await;
    }

    pub async fn cache_healthy(&self) -> bool {
        self.cache.healthy().await
    }

    pub fn cache_name(&self) -> &'static str {
        self.cache.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NullCache;
    use crate::identity::Identity;
    use crate::room::RoomSettings;

    fn store() -> RoomStore {
        RoomStore::new(Arc::new(NullCache))
    }

    fn sample_room(id: RoomId) -> Room {
        Room::new(
            id,
            Identity::Guest("host".into()),
            "Anna".into(),
            RoomSettings::default(),
            0,
        )
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let store = store();
        let id = store.allocate_id().await;
        store.insert(sample_room(id.clone())).await;
        assert_eq!(store.count().await, 1);

        let handle = store.get(&id).await.expect("room present");
        assert_eq!(handle.read().await.id, id);

        assert!(store.remove(&id).await.is_some());
        assert!(store.get(&id).await.is_none());
        assert!(store.remove(&id).await.is_none());
    }

    #[tokio::test]
    async fn enumerate_returns_all_rooms() {
        let store = store();
        for _ in 0..3 {
            let id = store.allocate_id().await;
            store.insert(sample_room(id)).await;
        }
        assert_eq!(store.enumerate().await.len(), 3);
    }

    #[tokio::test]
    async fn mutation_through_handle_is_visible() {
        let store = store();
        let id = store.allocate_id().await;
        store.insert(sample_room(id.clone())).await;

        {
            let handle = store.get(&id).await.unwrap();
            let mut room = handle.write().await;
            room.touch(42);
        }

        let handle = store.get(&id).await.unwrap();
        assert_eq!(handle.read().await.last_activity, 42);
    }
}
