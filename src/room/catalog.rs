//! Public Catalog
//!
//! Filtered, sorted projection of rooms for browsers. Private rooms and
//! rooms that refuse joins are never listed; passwords and spectator
//! identities never appear in a listing.

use serde::{Deserialize, Serialize};

use crate::room::store::RoomStore;
use crate::room::{Room, RoomState, TimeControl};

/// One catalog entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub room_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    pub host_name: String,
    pub state: RoomState,
    pub player_count: usize,
    pub spectator_count: usize,
    pub time_control: Option<TimeControl>,
    pub created_at: i64,
    pub last_activity: i64,
}

impl From<&Room> for Listing {
    fn from(room: &Room) -> Self {
        Self {
            room_id: room.id.to_string(),
            room_name: room.settings.room_name.clone(),
            host_name: room.host_name.clone(),
            state: room.state,
            player_count: room.player_count(),
            spectator_count: room.spectators.len(),
            time_control: room.settings.time_control,
            created_at: room.created_at,
            last_activity: room.last_activity,
        }
    }
}

/// Browser-supplied filters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingFilters {
    pub state: Option<RoomState>,
    pub has_time_control: Option<bool>,
}

/// Build the catalog: public joinable rooms, most recently active first.
pub async fn listings(store: &RoomStore, filters: &ListingFilters) -> Vec<Listing> {
    let mut entries = Vec::new();
    for handle in store.enumerate().await {
        let room = handle.read().await;
        if !room.is_listable() {
            continue;
        }
        if let Some(state) = filters.state {
            if room.state != state {
                continue;
            }
        }
        if let Some(wants_clock) = filters.has_time_control {
            if room.settings.time_control.is_some() != wants_clock {
                continue;
            }
        }
        entries.push(Listing::from(&*room));
    }
    entries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NullCache;
    use crate::identity::Identity;
    use crate::room::{RoomId, RoomSettings};
    use std::sync::Arc;

    async fn seed_room(store: &RoomStore, private: bool, timed: bool, activity: i64) -> RoomId {
        let id = store.allocate_id().await;
        let mut settings = RoomSettings {
            is_private: private,
            ..Default::default()
        };
        if timed {
            settings.time_control = Some(TimeControl {
                initial: 180,
                increment: 2,
            });
        }
        let mut room = Room::new(
            id.clone(),
            Identity::Guest(format!("host-{id}")),
            "Anna".into(),
            settings,
            0,
        );
        room.last_activity = activity;
        store.insert(room).await;
        id
    }

    #[tokio::test]
    async fn private_rooms_never_listed() {
        let store = RoomStore::new(Arc::new(NullCache));
        seed_room(&store, true, false, 0).await;
        let visible = seed_room(&store, false, false, 0).await;

        let entries = listings(&store, &ListingFilters::default()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].room_id, visible.to_string());
    }

    #[tokio::test]
    async fn sorted_by_recent_activity() {
        let store = RoomStore::new(Arc::new(NullCache));
        let older = seed_room(&store, false, false, 100).await;
        let newer = seed_room(&store, false, false, 200).await;

        let entries = listings(&store, &ListingFilters::default()).await;
        assert_eq!(entries[0].room_id, newer.to_string());
        assert_eq!(entries[1].room_id, older.to_string());
    }

    #[tokio::test]
    async fn time_control_filter() {
        let store = RoomStore::new(Arc::new(NullCache));
        let timed = seed_room(&store, false, true, 0).await;
        seed_room(&store, false, false, 0).await;

        let filters = ListingFilters {
            has_time_control: Some(true),
            ..Default::default()
        };
        let entries = listings(&store, &filters).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].room_id, timed.to_string());
    }

    #[tokio::test]
    async fn unjoinable_rooms_drop_out() {
        let store = RoomStore::new(Arc::new(NullCache));
        let id = seed_room(&store, false, false, 0).await;
        {
            let handle = store.get(&id).await.unwrap();
            handle.write().await.settings.allow_join = false;
        }
        assert!(listings(&store, &ListingFilters::default()).await.is_empty());
    }
}
