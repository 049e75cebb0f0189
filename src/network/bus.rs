//! Event Bus
//!
//! Fans server events out to subscribed connections. Every connection owns
//! an unbounded channel drained by its writer task, so publishing is a
//! non-blocking queue push: the room critical section can publish at commit
//! point without ever spanning socket I/O, which is what preserves per-room
//! total order.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::{mpsc, RwLock};
use tracing::trace;

use crate::identity::ConnectionId;
use crate::network::protocol::{ServerEvent, ServerFrame};
use crate::room::RoomId;

pub type FrameSender = mpsc::UnboundedSender<ServerFrame>;

#[derive(Default)]
struct HubInner {
    connections: BTreeMap<ConnectionId, FrameSender>,
    rooms: BTreeMap<RoomId, BTreeSet<ConnectionId>>,
}

/// Connection and subscription registry.
pub struct Hub {
    inner: RwLock<HubInner>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HubInner::default()),
        }
    }

    pub async fn register(&self, conn: ConnectionId, sender: FrameSender) {
        let mut inner = self.inner.write().await;
        inner.connections.insert(conn, sender);
    }

    /// Drop a connection and all of its room subscriptions.
    pub async fn unregister(&self, conn: ConnectionId) {
        let mut inner = self.inner.write().await;
        inner.connections.remove(&conn);
        for members in inner.rooms.values_mut() {
            members.remove(&conn);
        }
        inner.rooms.retain(|_, members| !members.is_empty());
    }

    pub async fn subscribe(&self, room: &RoomId, conn: ConnectionId) {
        let mut inner = self.inner.write().await;
        inner.rooms.entry(room.clone()).or_default().insert(conn);
    }

    pub async fn unsubscribe(&self, room: &RoomId, conn: ConnectionId) {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.rooms.get_mut(room) {
            members.remove(&conn);
            if members.is_empty() {
                inner.rooms.remove(room);
            }
        }
    }

    /// Drop a room topic entirely (room deleted).
    pub async fn drop_room(&self, room: &RoomId) {
        self.inner.write().await.rooms.remove(room);
    }

    /// Deliver an event to every connection subscribed to a room.
    pub async fn publish_room(&self, room: &RoomId, event: ServerEvent) {
        let inner = self.inner.read().await;
        let Some(members) = inner.rooms.get(room) else {
            return;
        };
        trace!(room = %room, subscribers = members.len(), "publishing room event");
        for conn in members {
            if let Some(sender) = inner.connections.get(conn) {
                let _ = sender.send(ServerFrame::Event(event.clone()));
            }
        }
    }

    /// Deliver an event to every connected client. Best-effort.
    pub async fn publish_all(&self, event: ServerEvent) {
        let inner = self.inner.read().await;
        for sender in inner.connections.values() {
            let _ = sender.send(ServerFrame::Event(event.clone()));
        }
    }

    /// Deliver an event to one specific connection.
    pub async fn publish_to(&self, conn: ConnectionId, event: ServerEvent) {
        let inner = self.inner.read().await;
        if let Some(sender) = inner.connections.get(&conn) {
            let _ = sender.send(ServerFrame::Event(event));
        }
    }

    /// Deliver an acknowledgement frame to one connection.
    pub async fn send_frame(&self, conn: ConnectionId, frame: ServerFrame) {
        let inner = self.inner.read().await;
        if let Some(sender) = inner.connections.get(&conn) {
            let _ = sender.send(frame);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn subscriber(hub: &Hub) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>) {
        let conn = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register(conn, tx).await;
        (conn, rx)
    }

    fn room() -> RoomId {
        RoomId::parse("abc123xy").unwrap()
    }

    fn event_name(frame: &ServerFrame) -> String {
        let json = serde_json::to_value(frame).unwrap();
        json["event"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn room_events_reach_only_subscribers() {
        let hub = Hub::new();
        let (in_room, mut in_rx) = subscriber(&hub).await;
        let (_outside, mut out_rx) = subscriber(&hub).await;
        hub.subscribe(&room(), in_room).await;

        hub.publish_room(&room(), ServerEvent::RoomListUpdated).await;

        let frame = in_rx.try_recv().unwrap();
        assert_eq!(event_name(&frame), "room:list-updated");
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_preserve_publication_order() {
        let hub = Hub::new();
        let (conn, mut rx) = subscriber(&hub).await;
        hub.subscribe(&room(), conn).await;

        hub.publish_room(
            &room(),
            ServerEvent::RoomClosed {
                room_id: room().to_string(),
                reason: "first".into(),
            },
        )
        .await;
        hub.publish_room(
            &room(),
            ServerEvent::RoomClosed {
                room_id: room().to_string(),
                reason: "second".into(),
            },
        )
        .await;

        let first = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
        let second = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["reason"], "first");
        assert_eq!(second["reason"], "second");
    }

    #[tokio::test]
    async fn publish_all_reaches_every_connection() {
        let hub = Hub::new();
        let (_a, mut rx_a) = subscriber(&hub).await;
        let (_b, mut rx_b) = subscriber(&hub).await;

        hub.publish_all(ServerEvent::RoomListUpdated).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unregister_removes_subscriptions() {
        let hub = Hub::new();
        let (conn, mut rx) = subscriber(&hub).await;
        hub.subscribe(&room(), conn).await;
        hub.unregister(conn).await;

        hub.publish_room(&room(), ServerEvent::RoomListUpdated).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn direct_delivery_targets_one_connection() {
        let hub = Hub::new();
        let (target, mut target_rx) = subscriber(&hub).await;
        let (_other, mut other_rx) = subscriber(&hub).await;

        hub.publish_to(
            target,
            ServerEvent::RoomKicked {
                room_id: room().to_string(),
            },
        )
        .await;

        assert_eq!(event_name(&target_rx.try_recv().unwrap()), "room:kicked");
        assert!(other_rx.try_recv().is_err());
    }
}
