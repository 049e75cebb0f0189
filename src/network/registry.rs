//! Session Registry
//!
//! Maps stable identity → (room, role, color, current connection). Survives
//! connection churn for user and guest identities: a reconnect rebinds the
//! entry to the new connection instead of creating a second one.

use std::collections::BTreeMap;

use tokio::sync::RwLock;

use crate::identity::{ConnectionId, Identity};
use crate::room::{Color, PlayerRole, RoomId};

/// The server-side binding of an identity to a room.
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub display_name: String,
    pub room_id: RoomId,
    pub role: PlayerRole,
    pub color: Option<Color>,
    pub connection_id: ConnectionId,
    pub is_connected: bool,
    pub disconnected_at: Option<i64>,
}

pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<Identity, Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Bind an identity to a room. Replaces any previous entry: at most one
    /// session per identity.
    pub async fn register(
        &self,
        identity: Identity,
        display_name: String,
        room_id: RoomId,
        role: PlayerRole,
        color: Option<Color>,
        connection_id: ConnectionId,
    ) {
        let session = Session {
            identity: identity.clone(),
            display_name,
            room_id,
            role,
            color,
            connection_id,
            is_connected: true,
            disconnected_at: None,
        };
        self.sessions.write().await.insert(identity, session);
    }

    pub async fn lookup(&self, identity: &Identity) -> Option<Session> {
        self.sessions.read().await.get(identity).cloned()
    }

    /// Point an existing session at a new connection and mark it live.
    /// Returns the rebound session.
    pub async fn rebind(
        &self,
        identity: &Identity,
        connection_id: ConnectionId,
    ) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(identity)?;
        session.connection_id = connection_id;
        session.is_connected = true;
        session.disconnected_at = None;
        Some(session.clone())
    }

    /// Flag a session as disconnected, preserving the entry.
    pub async fn mark_disconnected(&self, identity: &Identity, now: i64) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(identity)?;
        session.is_connected = false;
        session.disconnected_at = Some(now);
        Some(session.clone())
    }

    pub async fn discard(&self, identity: &Identity) -> Option<Session> {
        self.sessions.write().await.remove(identity)
    }

    /// Drop every session bound to a room; returns the dropped entries.
    pub async fn discard_room(&self, room_id: &RoomId) -> Vec<Session> {
        let mut sessions = self.sessions.write().await;
        let victims: Vec<Identity> = sessions
            .values()
            .filter(|s| &s.room_id == room_id)
            .map(|s| s.identity.clone())
            .collect();
        victims
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .collect()
    }

    /// Disconnected player sessions whose grace period has expired.
    pub async fn expired_players(&self, now: i64, grace_ms: i64) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| {
                s.role.is_player()
                    && !s.is_connected
                    && s.disconnected_at
                        .map_or(false, |at| now - at >= grace_ms)
            })
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest(tag: &str) -> Identity {
        Identity::Guest(tag.into())
    }

    fn room() -> RoomId {
        RoomId::parse("abc123xy").unwrap()
    }

    async fn registered(registry: &SessionRegistry, tag: &str, role: PlayerRole) -> Identity {
        let identity = guest(tag);
        registry
            .register(
                identity.clone(),
                tag.to_uppercase(),
                room(),
                role,
                role.is_player().then_some(Color::White),
                ConnectionId::generate(),
            )
            .await;
        identity
    }

    #[tokio::test]
    async fn one_session_per_identity() {
        let registry = SessionRegistry::new();
        let id = registered(&registry, "g1", PlayerRole::Host).await;
        registered(&registry, "g1", PlayerRole::Spectator).await;

        assert_eq!(registry.count().await, 1);
        let session = registry.lookup(&id).await.unwrap();
        assert_eq!(session.role, PlayerRole::Spectator);
    }

    #[tokio::test]
    async fn rebind_clears_disconnect_state() {
        let registry = SessionRegistry::new();
        let id = registered(&registry, "g1", PlayerRole::Host).await;

        registry.mark_disconnected(&id, 1_000).await.unwrap();
        let stale = registry.lookup(&id).await.unwrap();
        assert!(!stale.is_connected);
        assert_eq!(stale.disconnected_at, Some(1_000));

        let fresh_conn = ConnectionId::generate();
        let rebound = registry.rebind(&id, fresh_conn).await.unwrap();
        assert!(rebound.is_connected);
        assert_eq!(rebound.disconnected_at, None);
        assert_eq!(rebound.connection_id, fresh_conn);
    }

    #[tokio::test]
    async fn expired_players_honors_grace() {
        let registry = SessionRegistry::new();
        let player = registered(&registry, "p1", PlayerRole::Opponent).await;
        let watcher = registered(&registry, "s1", PlayerRole::Spectator).await;

        registry.mark_disconnected(&player, 0).await;
        registry.mark_disconnected(&watcher, 0).await;

        // Before the deadline nobody has expired.
        assert!(registry.expired_players(59_999, 60_000).await.is_empty());

        // After it, only the player shows up; spectators have no grace.
        let expired = registry.expired_players(60_000, 60_000).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].identity, player);
    }

    #[tokio::test]
    async fn discard_room_sweeps_all_members() {
        let registry = SessionRegistry::new();
        registered(&registry, "h", PlayerRole::Host).await;
        registered(&registry, "o", PlayerRole::Opponent).await;
        registered(&registry, "s", PlayerRole::Spectator).await;

        let dropped = registry.discard_room(&room()).await;
        assert_eq!(dropped.len(), 3);
        assert_eq!(registry.count().await, 0);
    }
}
