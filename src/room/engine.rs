//! Room State Machine
//!
//! The protocol core. Every operation takes the caller's identity, runs
//! inside the target room's critical section, and publishes its events at
//! commit point so each room's event stream is totally ordered. Rejections
//! are returned as [`ErrorCode`]s on the acknowledgement path; they mutate
//! nothing and emit nothing.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::chess::{Board, RulesError, TerminalKind};
use crate::identity::{ConnectionId, Identity};
use crate::network::bus::Hub;
use crate::network::protocol::{ChatType, ErrorCode, ServerEvent, SessionInfo};
use crate::network::registry::SessionRegistry;
use crate::room::store::RoomStore;
use crate::room::{
    hash_password, verify_password, Color, Game, GameStatus, GameView, MoveRecord, PlayerRole,
    PromotionPiece, Room, RoomId, RoomSettings, RoomState, RoomView, SettingsPatch,
};

/// Why a participant left, as reported in `player:left` / `room:closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Voluntary departure.
    Left,
    /// Grace period expired without a reconnect.
    Disconnected,
    /// Idle room reclaimed by garbage collection.
    Expired,
}

impl LeaveReason {
    fn as_str(self) -> &'static str {
        match self {
            LeaveReason::Left => "left",
            LeaveReason::Disconnected => "disconnected",
            LeaveReason::Expired => "expired",
        }
    }
}

/// Knobs the engine enforces; defaults mirror the deployment defaults.
#[derive(Debug, Clone)]
pub struct EngineLimits {
    /// Server-wide soft cap on spectators per room.
    pub spectator_cap: usize,
    /// Disconnect grace for players, milliseconds.
    pub grace_period_ms: i64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            spectator_cap: 50,
            grace_period_ms: 60_000,
        }
    }
}

/// The authoritative room/game state machine.
pub struct Engine {
    store: Arc<RoomStore>,
    registry: Arc<SessionRegistry>,
    hub: Arc<Hub>,
    limits: EngineLimits,
}

impl Engine {
    pub fn new(
        store: Arc<RoomStore>,
        registry: Arc<SessionRegistry>,
        hub: Arc<Hub>,
        limits: EngineLimits,
    ) -> Self {
        Self {
            store,
            registry,
            hub,
            limits,
        }
    }

    pub fn store(&self) -> &Arc<RoomStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn grace_period_ms(&self) -> i64 {
        self.limits.grace_period_ms
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Create a room; the creator becomes host and plays white.
    pub async fn create_room(
        &self,
        identity: &Identity,
        conn: ConnectionId,
        player_name: &str,
        patch: &SettingsPatch,
        password: Option<&str>,
        now: i64,
    ) -> Result<RoomView, ErrorCode> {
        self.ensure_no_active_session(identity).await?;

        let mut settings = RoomSettings::default();
        settings.apply(patch);
        if let Some(password) = password {
            settings.password_hash = Some(hash_password(password));
            settings.is_locked = true;
        }

        let id = self.store.allocate_id().await;
        let room = Room::new(
            id.clone(),
            identity.clone(),
            player_name.trim().to_string(),
            settings,
            now,
        );
        let listable = room.is_listable();
        let view = RoomView::from(&room);
        self.store.insert(room).await;

        self.registry
            .register(
                identity.clone(),
                player_name.trim().to_string(),
                id.clone(),
                PlayerRole::Host,
                Some(Color::White),
                conn,
            )
            .await;
        self.hub.subscribe(&id, conn).await;

        if listable {
            self.hub.publish_all(ServerEvent::RoomListUpdated).await;
        }
        info!(room = %id, host = %identity, "room created");
        Ok(view)
    }

    /// Admit an opponent; creates the game and starts the clocks.
    pub async fn join_room(
        &self,
        identity: &Identity,
        conn: ConnectionId,
        player_name: &str,
        room_id: &RoomId,
        password: Option<&str>,
        now: i64,
    ) -> Result<RoomView, ErrorCode> {
        self.ensure_no_active_session(identity).await?;

        let handle = self.store.get(room_id).await.ok_or(ErrorCode::NotFound)?;
        let snapshot = {
            let mut room = handle.write().await;
            if room.state != RoomState::WaitingForPlayer {
                return Err(ErrorCode::RoomFull);
            }
            if !room.settings.allow_join {
                return Err(ErrorCode::JoinNotAllowed);
            }
            check_access(&room.settings, password)?;
            if *identity == room.host_id {
                return Err(ErrorCode::AlreadyInRoom);
            }

            let name = player_name.trim().to_string();
            room.opponent_id = Some(identity.clone());
            room.opponent_name = Some(name.clone());
            room.spectators.remove(identity);
            room.state = RoomState::InProgress;
            room.game = Some(Game::new(room.settings.time_control, now));
            room.touch(now);

            self.registry
                .register(
                    identity.clone(),
                    name.clone(),
                    room_id.clone(),
                    PlayerRole::Opponent,
                    Some(Color::Black),
                    conn,
                )
                .await;
            self.hub.subscribe(room_id, conn).await;

            let game_view = room.game.as_ref().map(GameView::from);
            self.hub.publish_room(
                room_id,
                ServerEvent::PlayerJoined {
                    room_id: room_id.to_string(),
                    player_id: identity.to_string(),
                    player_name: name,
                    color: Color::Black,
                },
            ).await;
            if let Some(game) = game_view {
                self.hub.publish_room(
                    room_id,
                    ServerEvent::GameStarted {
                        room_id: room_id.to_string(),
                        game,
                    },
                ).await;
            }
            self.hub.publish_room(
                room_id,
                ServerEvent::RoomUpdated {
                    room: RoomView::from(&*room),
                },
            ).await;
            room.clone()
        };

        self.store.persist(&snapshot).await;
        self.hub.publish_all(ServerEvent::RoomListUpdated).await;
        info!(room = %room_id, opponent = %identity, "opponent joined, game started");
        Ok(RoomView::from(&snapshot))
    }

    /// Admit a spectator. Idempotent for an identity already watching.
    pub async fn spectate_room(
        &self,
        identity: &Identity,
        conn: ConnectionId,
        spectator_name: Option<&str>,
        room_id: &RoomId,
        password: Option<&str>,
        now: i64,
    ) -> Result<RoomView, ErrorCode> {
        if let Some(existing) = self.registry.lookup(identity).await {
            if existing.room_id == *room_id && existing.role == PlayerRole::Spectator {
                self.registry.rebind(identity, conn).await;
                self.hub.subscribe(room_id, conn).await;
                let handle = self.store.get(room_id).await.ok_or(ErrorCode::NotFound)?;
                let room = handle.read().await;
                self.sync_game(&room, conn).await;
                return Ok(RoomView::from(&*room));
            }
            self.ensure_no_active_session(identity).await?;
        }

        let handle = self.store.get(room_id).await.ok_or(ErrorCode::NotFound)?;
        let snapshot = {
            let mut room = handle.write().await;
            if !room.settings.allow_spectators {
                return Err(ErrorCode::SpectateNotAllowed);
            }
            check_access(&room.settings, password)?;
            if room.player_color(identity).is_some() {
                return Err(ErrorCode::AlreadyInRoom);
            }
            if room.spectators.len() >= self.limits.spectator_cap {
                return Err(ErrorCode::RoomFull);
            }

            let name = spectator_name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .unwrap_or("Spectator")
                .to_string();
            room.spectators.insert(identity.clone(), name.clone());
            room.touch(now);

            self.registry
                .register(
                    identity.clone(),
                    name.clone(),
                    room_id.clone(),
                    PlayerRole::Spectator,
                    None,
                    conn,
                )
                .await;
            self.hub.subscribe(room_id, conn).await;

            self.hub.publish_room(
                room_id,
                ServerEvent::SpectatorJoined {
                    room_id: room_id.to_string(),
                    spectator_id: identity.to_string(),
                    spectator_name: name,
                },
            ).await;
            self.sync_game(&room, conn).await;
            room.clone()
        };

        self.store.persist(&snapshot).await;
        Ok(RoomView::from(&snapshot))
    }

    // -----------------------------------------------------------------------
    // Departure
    // -----------------------------------------------------------------------

    /// Voluntary leave. Immediate; grace applies only to disconnects.
    pub async fn leave(&self, identity: &Identity, now: i64) -> Result<(), ErrorCode> {
        self.leave_with_reason(identity, LeaveReason::Left, now).await
    }

    pub async fn leave_with_reason(
        &self,
        identity: &Identity,
        reason: LeaveReason,
        now: i64,
    ) -> Result<(), ErrorCode> {
        let session = self
            .registry
            .lookup(identity)
            .await
            .ok_or(ErrorCode::NotConnected)?;
        let room_id = session.room_id.clone();

        let Some(handle) = self.store.get(&room_id).await else {
            self.registry.discard(identity).await;
            return Ok(());
        };

        enum Outcome {
            SpectatorGone(Room),
            RoomDeleted { listable: bool },
            GameAbandoned(Room),
            PlayerGone(Room),
        }

        let outcome = {
            let mut room = handle.write().await;
            match session.role {
                PlayerRole::Spectator => {
                    room.spectators.remove(identity);
                    room.touch(now);
                    self.hub.publish_room(
                        &room_id,
                        ServerEvent::SpectatorLeft {
                            room_id: room_id.to_string(),
                            spectator_id: identity.to_string(),
                        },
                    ).await;
                    self.registry.discard(identity).await;
                    self.hub.unsubscribe(&room_id, session.connection_id).await;
                    Outcome::SpectatorGone(room.clone())
                }
                PlayerRole::Host | PlayerRole::Opponent => match room.state {
                    RoomState::WaitingForPlayer => {
                        self.hub.publish_room(
                            &room_id,
                            ServerEvent::RoomClosed {
                                room_id: room_id.to_string(),
                                reason: format!("host {}", reason.as_str()),
                            },
                        ).await;
                        self.hub.drop_room(&room_id).await;
                        self.registry.discard_room(&room_id).await;
                        Outcome::RoomDeleted {
                            listable: room.is_listable(),
                        }
                    }
                    RoomState::InProgress => {
                        let color = room.player_color(identity).ok_or_else(|| {
                            internal_invariant(&room_id, "player session without a color")
                        })?;
                        room.draw_offerer = None;
                        let game_view = {
                            let game = room.game.as_mut().ok_or_else(|| {
                                internal_invariant(&room_id, "in-progress room without a game")
                            })?;
                            game.status = GameStatus::Abandoned;
                            game.winner = Some(color.other());
                            GameView::from(&*game)
                        };
                        room.state = RoomState::Finished;
                        room.touch(now);

                        self.hub.publish_room(
                            &room_id,
                            ServerEvent::PlayerLeft {
                                room_id: room_id.to_string(),
                                player_id: identity.to_string(),
                                reason: reason.as_str().to_string(),
                            },
                        ).await;
                        self.hub.publish_room(
                            &room_id,
                            ServerEvent::GameEnded {
                                room_id: room_id.to_string(),
                                status: GameStatus::Abandoned,
                                winner: Some(color.other()),
                                game: game_view,
                            },
                        ).await;
                        self.hub.publish_room(
                            &room_id,
                            ServerEvent::RoomUpdated {
                                room: RoomView::from(&*room),
                            },
                        ).await;
                        self.registry.discard(identity).await;
                        self.hub.unsubscribe(&room_id, session.connection_id).await;
                        Outcome::GameAbandoned(room.clone())
                    }
                    RoomState::Finished => {
                        self.hub.publish_room(
                            &room_id,
                            ServerEvent::PlayerLeft {
                                room_id: room_id.to_string(),
                                player_id: identity.to_string(),
                                reason: reason.as_str().to_string(),
                            },
                        ).await;
                        self.registry.discard(identity).await;
                        self.hub.unsubscribe(&room_id, session.connection_id).await;
                        Outcome::PlayerGone(room.clone())
                    }
                },
            }
        };

        match outcome {
            Outcome::RoomDeleted { listable } => {
                self.store.remove(&room_id).await;
                if listable {
                    self.hub.publish_all(ServerEvent::RoomListUpdated).await;
                }
                info!(room = %room_id, "room deleted, host {}", reason.as_str());
            }
            Outcome::GameAbandoned(snapshot) => {
                self.store.persist(&snapshot).await;
                self.hub.publish_all(ServerEvent::RoomListUpdated).await;
                info!(room = %room_id, player = %identity, "game abandoned");
            }
            Outcome::SpectatorGone(snapshot) | Outcome::PlayerGone(snapshot) => {
                self.store.persist(&snapshot).await;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Game play
    // -----------------------------------------------------------------------

    /// Validate and apply a move, charging the mover's clock.
    pub async fn play_move(
        &self,
        identity: &Identity,
        room_id: &RoomId,
        from: &str,
        to: &str,
        promotion: Option<PromotionPiece>,
        now: i64,
    ) -> Result<(MoveRecord, GameView), ErrorCode> {
        let handle = self.store.get(room_id).await.ok_or(ErrorCode::NotFound)?;
        let (record, game_view, snapshot, ended) = {
            let mut room = handle.write().await;
            let color = room.player_color(identity).ok_or(ErrorCode::NotAPlayer)?;
            if room.state != RoomState::InProgress {
                return Err(ErrorCode::GameNotInProgress);
            }
            let increment_ms = room
                .settings
                .time_control
                .map(|tc| tc.increment_ms())
                .unwrap_or(0);
            let game = room
                .game
                .as_mut()
                .ok_or_else(|| internal_invariant(room_id, "in-progress room without a game"))?;
            if game.status != GameStatus::Active {
                return Err(ErrorCode::GameNotInProgress);
            }
            if game.turn != color {
                return Err(ErrorCode::NotYourTurn);
            }

            let mut board = Board::from_fen(&game.position)
                .map_err(|_| internal_invariant(room_id, "unreadable stored position"))?;
            let applied = board.apply(from, to, promotion).map_err(|e| match e {
                RulesError::PromotionRequired => ErrorCode::PromotionRequired,
                _ => ErrorCode::InvalidMove,
            })?;

            // Clock runs against the player on move; expiration detected at
            // charge time is canonical even though the move is recorded.
            // A side's first move is free: its clock starts on the second.
            let mut timed_out = false;
            if game.clock_running() {
                if let Some(clock) = game.clock(color) {
                    let remaining = clock - (now - game.last_move_at);
                    timed_out = remaining <= 0;
                    let charged = if timed_out {
                        remaining
                    } else {
                        remaining + increment_ms
                    };
                    *game.clock_mut(color) = Some(charged);
                }
            }

            let record = MoveRecord {
                from: from.to_string(),
                to: to.to_string(),
                san: applied.san.clone(),
                position_after: applied.fen_after.clone(),
                timestamp: now,
                promotion,
            };
            game.moves.push(record.clone());
            game.position = applied.fen_after;
            game.turn = applied.turn_after;
            game.last_move_at = now;

            if timed_out {
                game.status = GameStatus::Timeout;
                game.winner = Some(color.other());
            } else {
                match applied.terminal {
                    Some(TerminalKind::Checkmate) => {
                        game.status = GameStatus::Checkmate;
                        game.winner = Some(color);
                    }
                    Some(TerminalKind::Stalemate) => {
                        game.status = GameStatus::Stalemate;
                        game.winner = None;
                    }
                    Some(TerminalKind::InsufficientMaterial)
                    | Some(TerminalKind::FiftyMoves) => {
                        game.status = GameStatus::Draw;
                        game.winner = None;
                    }
                    None => {
                        if game.repetition_count() >= 3 {
                            game.status = GameStatus::Draw;
                            game.winner = None;
                        }
                    }
                }
            }

            let ended = game.status.is_terminal();
            let status = game.status;
            let winner = game.winner;
            let game_view = GameView::from(&*game);
            // Any move clears a pending draw offer.
            room.draw_offerer = None;
            if ended {
                room.state = RoomState::Finished;
            }
            room.touch(now);

            self.hub.publish_room(
                room_id,
                ServerEvent::GameMove {
                    room_id: room_id.to_string(),
                    mv: record.clone(),
                    game: game_view.clone(),
                },
            ).await;
            if ended {
                self.hub.publish_room(
                    room_id,
                    ServerEvent::GameEnded {
                        room_id: room_id.to_string(),
                        status,
                        winner,
                        game: game_view.clone(),
                    },
                ).await;
                self.hub.publish_room(
                    room_id,
                    ServerEvent::RoomUpdated {
                        room: RoomView::from(&*room),
                    },
                ).await;
            }
            (record, game_view, room.clone(), ended)
        };

        self.store.persist(&snapshot).await;
        if ended {
            self.hub.publish_all(ServerEvent::RoomListUpdated).await;
            debug!(room = %room_id, status = ?game_view.status, "game ended by move");
        }
        Ok((record, game_view))
    }

    /// Resign; the other side wins.
    pub async fn resign(
        &self,
        identity: &Identity,
        room_id: &RoomId,
        now: i64,
    ) -> Result<(), ErrorCode> {
        self.end_game(
            identity,
            room_id,
            now,
            |color| (GameStatus::Resigned, Some(color.other())),
        )
        .await
    }

    /// Record a draw offer from a player.
    pub async fn offer_draw(
        &self,
        identity: &Identity,
        room_id: &RoomId,
        now: i64,
    ) -> Result<(), ErrorCode> {
        let handle = self.store.get(room_id).await.ok_or(ErrorCode::NotFound)?;
        let snapshot = {
            let mut room = handle.write().await;
            let color = room.player_color(identity).ok_or(ErrorCode::NotAPlayer)?;
            ensure_active_game(&room)?;
            room.draw_offerer = Some(identity.clone());
            room.touch(now);

            let by_name = room
                .player_name(color)
                .unwrap_or_default()
                .to_string();
            self.hub.publish_room(
                room_id,
                ServerEvent::DrawOffered {
                    room_id: room_id.to_string(),
                    by_id: identity.to_string(),
                    by_name,
                },
            ).await;
            room.clone()
        };
        self.store.persist(&snapshot).await;
        Ok(())
    }

    /// Accept a pending draw offer; only the non-offerer may accept.
    pub async fn accept_draw(
        &self,
        identity: &Identity,
        room_id: &RoomId,
        now: i64,
    ) -> Result<(), ErrorCode> {
        let handle = self.store.get(room_id).await.ok_or(ErrorCode::NotFound)?;
        let snapshot = {
            let mut room = handle.write().await;
            room.player_color(identity).ok_or(ErrorCode::NotAPlayer)?;
            ensure_active_game(&room)?;
            match room.draw_offerer {
                None => return Err(ErrorCode::NoDrawOffer),
                Some(ref offerer) if offerer == identity => {
                    return Err(ErrorCode::CannotAcceptOwnDraw)
                }
                Some(_) => {}
            }

            room.draw_offerer = None;
            let game_view = {
                let game = room.game.as_mut().ok_or_else(|| {
                    internal_invariant(room_id, "in-progress room without a game")
                })?;
                game.status = GameStatus::Draw;
                game.winner = None;
                GameView::from(&*game)
            };
            room.state = RoomState::Finished;
            room.touch(now);

            self.hub.publish_room(
                room_id,
                ServerEvent::GameEnded {
                    room_id: room_id.to_string(),
                    status: GameStatus::Draw,
                    winner: None,
                    game: game_view,
                },
            ).await;
            self.hub.publish_room(
                room_id,
                ServerEvent::RoomUpdated {
                    room: RoomView::from(&*room),
                },
            ).await;
            room.clone()
        };
        self.store.persist(&snapshot).await;
        self.hub.publish_all(ServerEvent::RoomListUpdated).await;
        Ok(())
    }

    /// Decline (or retract) a pending draw offer.
    pub async fn decline_draw(
        &self,
        identity: &Identity,
        room_id: &RoomId,
        now: i64,
    ) -> Result<(), ErrorCode> {
        let handle = self.store.get(room_id).await.ok_or(ErrorCode::NotFound)?;
        let snapshot = {
            let mut room = handle.write().await;
            room.player_color(identity).ok_or(ErrorCode::NotAPlayer)?;
            ensure_active_game(&room)?;
            if room.draw_offerer.is_none() {
                return Err(ErrorCode::NoDrawOffer);
            }
            room.draw_offerer = None;
            room.touch(now);
            self.hub.publish_room(
                room_id,
                ServerEvent::DrawDeclined {
                    room_id: room_id.to_string(),
                    by_id: identity.to_string(),
                },
            ).await;
            room.clone()
        };
        self.store.persist(&snapshot).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Host privileges
    // -----------------------------------------------------------------------

    /// Remove a spectator. Players are unkickable.
    pub async fn kick_spectator(
        &self,
        identity: &Identity,
        room_id: &RoomId,
        target_raw: &str,
        now: i64,
    ) -> Result<(), ErrorCode> {
        let target: Identity = target_raw.parse().map_err(|_| ErrorCode::NotFound)?;

        let handle = self.store.get(room_id).await.ok_or(ErrorCode::NotFound)?;
        let snapshot = {
            let mut room = handle.write().await;
            if *identity != room.host_id {
                return Err(ErrorCode::HostOnly);
            }
            if room.player_color(&target).is_some() {
                return Err(ErrorCode::CannotKickPlayer);
            }
            if room.spectators.remove(&target).is_none() {
                return Err(ErrorCode::NotFound);
            }
            room.touch(now);

            if let Some(session) = self.registry.discard(&target).await {
                self.hub.publish_to(
                    session.connection_id,
                    ServerEvent::RoomKicked {
                        room_id: room_id.to_string(),
                    },
                ).await;
                self.hub.unsubscribe(room_id, session.connection_id).await;
            }
            self.hub.publish_room(
                room_id,
                ServerEvent::RoomUpdated {
                    room: RoomView::from(&*room),
                },
            ).await;
            room.clone()
        };

        self.store.persist(&snapshot).await;
        self.hub.publish_all(ServerEvent::RoomListUpdated).await;
        info!(room = %room_id, target = %target, "spectator kicked");
        Ok(())
    }

    /// Lock or unlock the room; an accompanying password replaces the hash.
    pub async fn lock_room(
        &self,
        identity: &Identity,
        room_id: &RoomId,
        locked: bool,
        password: Option<&str>,
        now: i64,
    ) -> Result<(), ErrorCode> {
        let handle = self.store.get(room_id).await.ok_or(ErrorCode::NotFound)?;
        let snapshot = {
            let mut room = handle.write().await;
            if *identity != room.host_id {
                return Err(ErrorCode::HostOnly);
            }
            room.settings.is_locked = locked;
            if locked {
                if let Some(password) = password {
                    room.settings.password_hash = Some(hash_password(password));
                }
            } else {
                room.settings.password_hash = None;
            }
            room.touch(now);
            self.hub.publish_room(
                room_id,
                ServerEvent::RoomUpdated {
                    room: RoomView::from(&*room),
                },
            ).await;
            room.clone()
        };
        self.store.persist(&snapshot).await;
        self.hub.publish_all(ServerEvent::RoomListUpdated).await;
        Ok(())
    }

    /// Merge a host-supplied settings subset.
    pub async fn update_settings(
        &self,
        identity: &Identity,
        room_id: &RoomId,
        patch: &SettingsPatch,
        now: i64,
    ) -> Result<(), ErrorCode> {
        let handle = self.store.get(room_id).await.ok_or(ErrorCode::NotFound)?;
        let (snapshot, catalog_dirty) = {
            let mut room = handle.write().await;
            if *identity != room.host_id {
                return Err(ErrorCode::HostOnly);
            }
            let catalog_dirty = room.settings.apply(patch);
            room.touch(now);
            self.hub.publish_room(
                room_id,
                ServerEvent::RoomUpdated {
                    room: RoomView::from(&*room),
                },
            ).await;
            (room.clone(), catalog_dirty)
        };
        self.store.persist(&snapshot).await;
        if catalog_dirty {
            self.hub.publish_all(ServerEvent::RoomListUpdated).await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reconnection
    // -----------------------------------------------------------------------

    /// Reconcile a reconnecting identity with its prior role.
    pub async fn restore_session(
        &self,
        identity: &Identity,
        conn: ConnectionId,
    ) -> Result<(SessionInfo, RoomView), ErrorCode> {
        let session = self
            .registry
            .lookup(identity)
            .await
            .ok_or(ErrorCode::NotConnected)?;
        let room_id = session.room_id.clone();

        let handle = match self.store.get(&room_id).await {
            Some(handle) => handle,
            None => {
                self.registry.discard(identity).await;
                return Err(ErrorCode::NotConnected);
            }
        };

        let view = {
            let room = handle.read().await;
            if room.state == RoomState::Finished {
                drop(room);
                self.registry.discard(identity).await;
                return Err(ErrorCode::NotConnected);
            }
            self.registry.rebind(identity, conn).await;
            self.hub.subscribe(&room_id, conn).await;
            if session.role.is_player() {
                self.hub.publish_room(
                    &room_id,
                    ServerEvent::PlayerReconnected {
                        room_id: room_id.to_string(),
                        player_id: identity.to_string(),
                    },
                ).await;
            }
            self.sync_game(&room, conn).await;
            RoomView::from(&*room)
        };

        info!(room = %room_id, identity = %identity, role = ?session.role, "session restored");
        Ok((
            SessionInfo {
                room_id: room_id.to_string(),
                role: session.role,
                color: session.color,
            },
            view,
        ))
    }

    /// Transport-level disconnect. Spectators and connection-scoped
    /// identities leave immediately; players get the grace period.
    pub async fn handle_disconnect(&self, identity: &Identity, conn: ConnectionId, now: i64) {
        let Some(session) = self.registry.lookup(identity).await else {
            return;
        };
        // A reconnect may already have rebound the identity elsewhere.
        if session.connection_id != conn {
            return;
        }

        if session.role == PlayerRole::Spectator || !identity.survives_reconnect() {
            let _ = self
                .leave_with_reason(identity, LeaveReason::Disconnected, now)
                .await;
            return;
        }

        self.registry.mark_disconnected(identity, now).await;
        self.hub.publish_room(
            &session.room_id,
            ServerEvent::PlayerDisconnected {
                room_id: session.room_id.to_string(),
                player_id: identity.to_string(),
                grace_period: self.limits.grace_period_ms as u64,
            },
        ).await;
        debug!(room = %session.room_id, identity = %identity, "player disconnected, grace running");
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    /// Relay a chat line. Private chat is players-only in both directions.
    pub async fn chat(
        &self,
        identity: &Identity,
        room_id: &RoomId,
        message: &str,
        chat_type: ChatType,
        now: i64,
    ) -> Result<(), ErrorCode> {
        let handle = self.store.get(room_id).await.ok_or(ErrorCode::NotFound)?;
        let room = handle.read().await;

        let sender_name = if let Some(color) = room.player_color(identity) {
            room.player_name(color).unwrap_or_default().to_string()
        } else if let Some(name) = room.spectators.get(identity) {
            if chat_type == ChatType::Private {
                return Err(ErrorCode::NotAPlayer);
            }
            name.clone()
        } else {
            return Err(ErrorCode::NotConnected);
        };

        let event = ServerEvent::ChatMessage {
            room_id: room_id.to_string(),
            sender_id: identity.to_string(),
            sender_name,
            message: message.to_string(),
            chat_type,
            timestamp: now,
        };

        match chat_type {
            ChatType::Public => self.hub.publish_room(room_id, event).await,
            ChatType::Private => {
                let mut players = vec![room.host_id.clone()];
                players.extend(room.opponent_id.clone());
                for player in players {
                    if let Some(session) = self.registry.lookup(&player).await {
                        if session.is_connected {
                            self.hub.publish_to(session.connection_id, event.clone()).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sweeps (driven by the background loops)
    // -----------------------------------------------------------------------

    /// Flag-fall detection against the side on move. Required whenever time
    /// control is configured; the caller runs it on a sub-second cadence.
    pub async fn sweep_clocks(&self, now: i64) {
        for handle in self.store.enumerate().await {
            let expired = {
                let room = handle.read().await;
                room.state == RoomState::InProgress
                    && room
                        .game
                        .as_ref()
                        .filter(|g| g.status == GameStatus::Active && g.clock_running())
                        .and_then(|g| g.remaining_on_move(now))
                        .map_or(false, |remaining| remaining < 0)
            };
            if !expired {
                continue;
            }

            let snapshot = {
                let mut room = handle.write().await;
                let room_id = room.id.clone();
                // Re-check: a move may have landed since the read.
                let Some(game) = room.game.as_mut() else {
                    continue;
                };
                if game.status != GameStatus::Active || !game.clock_running() {
                    continue;
                }
                let Some(remaining) = game.remaining_on_move(now) else {
                    continue;
                };
                if remaining >= 0 {
                    continue;
                }

                let loser = game.turn;
                *game.clock_mut(loser) = Some(remaining);
                game.status = GameStatus::Timeout;
                game.winner = Some(loser.other());
                let game_view = GameView::from(&*game);
                room.state = RoomState::Finished;
                room.draw_offerer = None;
                room.touch(now);

                self.hub.publish_room(
                    &room_id,
                    ServerEvent::GameEnded {
                        room_id: room_id.to_string(),
                        status: GameStatus::Timeout,
                        winner: Some(loser.other()),
                        game: game_view,
                    },
                ).await;
                self.hub.publish_room(
                    &room_id,
                    ServerEvent::RoomUpdated {
                        room: RoomView::from(&*room),
                    },
                ).await;
                info!(room = %room_id, loser = ?loser, "flag fell, game ended on time");
                room.clone()
            };
            self.store.persist(&snapshot).await;
            self.hub.publish_all(ServerEvent::RoomListUpdated).await;
        }
    }

    /// End games whose disconnected player never came back.
    pub async fn sweep_grace(&self, now: i64) {
        for session in self
            .registry
            .expired_players(now, self.limits.grace_period_ms)
            .await
        {
            // Re-check: the player may have reconnected since the scan.
            let Some(current) = self.registry.lookup(&session.identity).await else {
                continue;
            };
            if current.is_connected {
                continue;
            }
            let _ = self
                .leave_with_reason(&session.identity, LeaveReason::Disconnected, now)
                .await;
        }
    }

    /// Reclaim idle rooms: finished rooms after `finished_ttl_ms`, waiting
    /// rooms that never got an opponent after `waiting_ttl_ms`.
    pub async fn sweep_idle_rooms(&self, now: i64, finished_ttl_ms: i64, waiting_ttl_ms: i64) {
        for handle in self.store.enumerate().await {
            let (room_id, reclaim, listable) = {
                let room = handle.read().await;
                let idle = now - room.last_activity;
                let reclaim = match room.state {
                    RoomState::Finished => idle >= finished_ttl_ms,
                    RoomState::WaitingForPlayer => idle >= waiting_ttl_ms,
                    RoomState::InProgress => false,
                };
                (room.id.clone(), reclaim, room.is_listable())
            };
            if !reclaim {
                continue;
            }

            self.hub.publish_room(
                &room_id,
                ServerEvent::RoomClosed {
                    room_id: room_id.to_string(),
                    reason: LeaveReason::Expired.as_str().to_string(),
                },
            ).await;
            self.hub.drop_room(&room_id).await;
            self.registry.discard_room(&room_id).await;
            self.store.remove(&room_id).await;
            if listable {
                self.hub.publish_all(ServerEvent::RoomListUpdated).await;
            }
            info!(room = %room_id, "idle room reclaimed");
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// An identity may hold at most one session in a non-finished room.
    /// Stale entries pointing at deleted or finished rooms are dropped.
    async fn ensure_no_active_session(&self, identity: &Identity) -> Result<(), ErrorCode> {
        let Some(session) = self.registry.lookup(identity).await else {
            return Ok(());
        };
        if let Some(handle) = self.store.get(&session.room_id).await {
            let room = handle.read().await;
            if room.state != RoomState::Finished {
                return Err(ErrorCode::AlreadyInRoom);
            }
        }
        self.registry.discard(identity).await;
        Ok(())
    }

    /// Shared terminal path for resignation-shaped endings.
    async fn end_game(
        &self,
        identity: &Identity,
        room_id: &RoomId,
        now: i64,
        outcome: impl FnOnce(Color) -> (GameStatus, Option<Color>),
    ) -> Result<(), ErrorCode> {
        let handle = self.store.get(room_id).await.ok_or(ErrorCode::NotFound)?;
        let snapshot = {
            let mut room = handle.write().await;
            let color = room.player_color(identity).ok_or(ErrorCode::NotAPlayer)?;
            ensure_active_game(&room)?;

            let (status, winner) = outcome(color);
            room.draw_offerer = None;
            let game_view = {
                let game = room.game.as_mut().ok_or_else(|| {
                    internal_invariant(room_id, "in-progress room without a game")
                })?;
                game.status = status;
                game.winner = winner;
                GameView::from(&*game)
            };
            room.state = RoomState::Finished;
            room.touch(now);

            self.hub.publish_room(
                room_id,
                ServerEvent::GameEnded {
                    room_id: room_id.to_string(),
                    status,
                    winner,
                    game: game_view,
                },
            ).await;
            self.hub.publish_room(
                room_id,
                ServerEvent::RoomUpdated {
                    room: RoomView::from(&*room),
                },
            ).await;
            room.clone()
        };
        self.store.persist(&snapshot).await;
        self.hub.publish_all(ServerEvent::RoomListUpdated).await;
        Ok(())
    }

    /// Bring one connection up to date on the room's game, if any.
    async fn sync_game(&self, room: &Room, conn: ConnectionId) {
        if let Some(game) = room.game.as_ref() {
            self.hub.publish_to(
                conn,
                ServerEvent::GameSync {
                    room_id: room.id.to_string(),
                    game: GameView::from(game),
                },
            ).await;
        }
    }
}

/// Room must be in progress with a live game for play-phase operations.
fn ensure_active_game(room: &Room) -> Result<(), ErrorCode> {
    if room.state != RoomState::InProgress {
        return Err(ErrorCode::GameNotInProgress);
    }
    match room.game.as_ref() {
        Some(game) if game.status == GameStatus::Active => Ok(()),
        _ => Err(ErrorCode::GameNotInProgress),
    }
}

/// Invariant breakage is a programming error: log loudly, abort the
/// operation, surface `internal` to the caller.
fn internal_invariant(room_id: &RoomId, detail: &str) -> ErrorCode {
    error!(room = %room_id, "invariant violated: {detail}");
    ErrorCode::Internal
}

/// Access check for join/spectate against a possibly locked room.
fn check_access(settings: &RoomSettings, password: Option<&str>) -> Result<(), ErrorCode> {
    if !settings.is_locked {
        return Ok(());
    }
    match (&settings.password_hash, password) {
        // Pure lock: no password opens it.
        (None, _) => Err(ErrorCode::RoomLocked),
        (Some(_), None) => Err(ErrorCode::PasswordRequired),
        (Some(stored), Some(supplied)) => {
            if verify_password(stored, supplied) {
                Ok(())
            } else {
                Err(ErrorCode::PasswordIncorrect)
            }
        }
    }
}
