//! Wire Protocol
//!
//! JSON text frames over WebSocket. Requests are `{id, type, ...payload}`
//! envelopes; every request is acknowledged with `{id, success, ...}` on the
//! same connection. Server-initiated events are `{event, ...payload}`.
//! Payloads are validated here before any state is touched; a failure
//! acknowledges `validation_failed` and mutates nothing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::room::{
    Color, GameStatus, GameView, MoveRecord, PlayerRole, PromotionPiece, RoomId, RoomView,
    SettingsPatch, TimeControl,
};

// =============================================================================
// CLIENT -> SERVER
// =============================================================================

/// Request envelope: ack id plus the typed payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// Requests a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientRequest {
    /// Handshake: optional bearer token or client-persisted guest id.
    /// Must be the first request on a connection.
    #[serde(rename = "session:hello", rename_all = "camelCase")]
    Hello {
        token: Option<String>,
        guest_id: Option<String>,
    },

    #[serde(rename = "room:create", rename_all = "camelCase")]
    RoomCreate {
        player_name: String,
        #[serde(default)]
        settings: SettingsPatch,
        password: Option<String>,
    },

    #[serde(rename = "room:join", rename_all = "camelCase")]
    RoomJoin {
        room_id: String,
        player_name: String,
        password: Option<String>,
    },

    #[serde(rename = "room:spectate", rename_all = "camelCase")]
    RoomSpectate {
        room_id: String,
        spectator_name: Option<String>,
        password: Option<String>,
    },

    #[serde(rename = "room:leave")]
    RoomLeave,

    #[serde(rename = "room:kick", rename_all = "camelCase")]
    RoomKick { room_id: String, target_id: String },

    #[serde(rename = "room:lock", rename_all = "camelCase")]
    RoomLock {
        room_id: String,
        locked: bool,
        password: Option<String>,
    },

    #[serde(rename = "room:update-settings", rename_all = "camelCase")]
    RoomUpdateSettings {
        room_id: String,
        settings: SettingsPatch,
    },

    #[serde(rename = "game:move", rename_all = "camelCase")]
    GameMove {
        room_id: String,
        from: String,
        to: String,
        promotion: Option<PromotionPiece>,
    },

    #[serde(rename = "game:resign", rename_all = "camelCase")]
    GameResign { room_id: String },

    #[serde(rename = "game:offer-draw", rename_all = "camelCase")]
    GameOfferDraw { room_id: String },

    #[serde(rename = "game:accept-draw", rename_all = "camelCase")]
    GameAcceptDraw { room_id: String },

    #[serde(rename = "game:decline-draw", rename_all = "camelCase")]
    GameDeclineDraw { room_id: String },

    #[serde(rename = "chat:send", rename_all = "camelCase")]
    ChatSend {
        room_id: String,
        message: String,
        #[serde(default)]
        chat_type: ChatType,
    },

    #[serde(rename = "session:restore")]
    SessionRestore,

    #[serde(rename = "ping")]
    Ping,
}

/// Chat visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    #[default]
    Public,
    /// Players only; rejected from spectators.
    Private,
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Bounds on wire payloads.
pub mod limits {
    pub const NAME_MIN: usize = 1;
    pub const NAME_MAX: usize = 20;
    pub const MESSAGE_MAX: usize = 500;
    pub const PASSWORD_MAX: usize = 72;
    pub const TIME_INITIAL_MIN: u32 = 60;
    pub const TIME_INITIAL_MAX: u32 = 3600;
    pub const TIME_INCREMENT_MAX: u32 = 60;
}

fn valid_square(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 2 && (b'a'..=b'h').contains(&bytes[0]) && (b'1'..=b'8').contains(&bytes[1])
}

fn valid_name(name: &str) -> bool {
    let trimmed = name.trim();
    (limits::NAME_MIN..=limits::NAME_MAX).contains(&trimmed.chars().count())
}

fn valid_room_id(raw: &str) -> bool {
    RoomId::parse(raw).is_some()
}

fn valid_time_control(tc: &TimeControl) -> bool {
    (limits::TIME_INITIAL_MIN..=limits::TIME_INITIAL_MAX).contains(&tc.initial)
        && tc.increment <= limits::TIME_INCREMENT_MAX
}

fn valid_settings(patch: &SettingsPatch) -> bool {
    if let Some(Some(ref tc)) = patch.time_control {
        if !valid_time_control(tc) {
            return false;
        }
    }
    if let Some(Some(ref name)) = patch.room_name {
        if !valid_name(name) {
            return false;
        }
    }
    true
}

fn valid_password(password: &Option<String>) -> bool {
    password
        .as_ref()
        .map_or(true, |p| !p.is_empty() && p.len() <= limits::PASSWORD_MAX)
}

impl ClientRequest {
    /// Schema validation: field shapes and bounds only, no state access.
    pub fn validate(&self) -> Result<(), ErrorCode> {
        let ok = match self {
            // Credential problems demote to the guest/connection path in the
            // resolver; the handshake itself is never rejected on them.
            ClientRequest::Hello { .. } => true,
            ClientRequest::RoomCreate {
                player_name,
                settings,
                password,
            } => valid_name(player_name) && valid_settings(settings) && valid_password(password),
            ClientRequest::RoomJoin {
                room_id,
                player_name,
                password,
            } => valid_room_id(room_id) && valid_name(player_name) && valid_password(password),
            ClientRequest::RoomSpectate {
                room_id,
                spectator_name,
                password,
            } => {
                valid_room_id(room_id)
                    && spectator_name.as_ref().map_or(true, |n| valid_name(n))
                    && valid_password(password)
            }
            ClientRequest::RoomLeave | ClientRequest::SessionRestore | ClientRequest::Ping => true,
            ClientRequest::RoomKick { room_id, target_id } => {
                valid_room_id(room_id) && !target_id.is_empty()
            }
            ClientRequest::RoomLock {
                room_id, password, ..
            } => valid_room_id(room_id) && valid_password(password),
            ClientRequest::RoomUpdateSettings { room_id, settings } => {
                valid_room_id(room_id) && valid_settings(settings)
            }
            ClientRequest::GameMove {
                room_id, from, to, ..
            } => valid_room_id(room_id) && valid_square(from) && valid_square(to),
            ClientRequest::GameResign { room_id }
            | ClientRequest::GameOfferDraw { room_id }
            | ClientRequest::GameAcceptDraw { room_id }
            | ClientRequest::GameDeclineDraw { room_id } => valid_room_id(room_id),
            ClientRequest::ChatSend {
                room_id, message, ..
            } => {
                valid_room_id(room_id)
                    && !message.trim().is_empty()
                    && message.chars().count() <= limits::MESSAGE_MAX
            }
        };
        if ok {
            Ok(())
        } else {
            Err(ErrorCode::ValidationFailed)
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Rejection taxonomy; codes are returned to clients verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    #[error("payload did not match schema")]
    ValidationFailed,
    #[error("no session for this identity")]
    NotConnected,
    #[error("room or session not found")]
    NotFound,
    #[error("identity already participates in a room")]
    AlreadyInRoom,
    #[error("room is locked")]
    RoomLocked,
    #[error("password required")]
    PasswordRequired,
    #[error("password incorrect")]
    PasswordIncorrect,
    #[error("room is full")]
    RoomFull,
    #[error("joining is not allowed")]
    JoinNotAllowed,
    #[error("spectating is not allowed")]
    SpectateNotAllowed,
    #[error("not a player of this room")]
    NotAPlayer,
    #[error("not your turn")]
    NotYourTurn,
    #[error("game is not in progress")]
    GameNotInProgress,
    #[error("illegal move")]
    InvalidMove,
    #[error("promotion piece required")]
    PromotionRequired,
    #[error("no draw offer pending")]
    NoDrawOffer,
    #[error("cannot accept your own draw offer")]
    CannotAcceptOwnDraw,
    #[error("host privileges required")]
    HostOnly,
    #[error("players cannot be kicked")]
    CannotKickPlayer,
    #[error("internal error")]
    Internal,
}

impl ErrorCode {
    /// Stable wire identifier.
    pub fn code(self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::NotConnected => "not_connected",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyInRoom => "already_in_room",
            ErrorCode::RoomLocked => "room_locked",
            ErrorCode::PasswordRequired => "password_required",
            ErrorCode::PasswordIncorrect => "password_incorrect",
            ErrorCode::RoomFull => "room_full",
            ErrorCode::JoinNotAllowed => "join_not_allowed",
            ErrorCode::SpectateNotAllowed => "spectate_not_allowed",
            ErrorCode::NotAPlayer => "not_a_player",
            ErrorCode::NotYourTurn => "not_your_turn",
            ErrorCode::GameNotInProgress => "game_not_in_progress",
            ErrorCode::InvalidMove => "invalid_move",
            ErrorCode::PromotionRequired => "promotion_required",
            ErrorCode::NoDrawOffer => "no_draw_offer",
            ErrorCode::CannotAcceptOwnDraw => "cannot_accept_own_draw",
            ErrorCode::HostOnly => "host_only",
            ErrorCode::CannotKickPlayer => "cannot_kick_player",
            ErrorCode::Internal => "internal",
        }
    }
}

// =============================================================================
// SERVER -> CLIENT
// =============================================================================

/// Everything a connection's writer task can put on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Ack(Ack),
    Event(ServerEvent),
}

/// Request acknowledgement.
#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub id: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub data: Option<AckData>,
}

impl Ack {
    pub fn ok(id: u64, data: AckData) -> Self {
        Self {
            id,
            success: true,
            error: None,
            message: None,
            data: Some(data),
        }
    }

    pub fn empty(id: u64) -> Self {
        Self {
            id,
            success: true,
            error: None,
            message: None,
            data: None,
        }
    }

    pub fn rejected(id: u64, code: ErrorCode) -> Self {
        Self {
            id,
            success: false,
            error: Some(code.code()),
            message: Some(code.to_string()),
            data: None,
        }
    }
}

/// Typed ack payloads, flattened into the envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AckData {
    #[serde(rename_all = "camelCase")]
    Welcome {
        player_id: String,
        authenticated: bool,
    },
    #[serde(rename_all = "camelCase")]
    RoomEntered {
        room: RoomView,
        player_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<Color>,
    },
    #[serde(rename_all = "camelCase")]
    MoveAccepted {
        #[serde(rename = "move")]
        mv: MoveRecord,
        game_state: GameView,
    },
    #[serde(rename_all = "camelCase")]
    SessionRestored {
        session: SessionInfo,
        room: RoomView,
    },
    #[serde(rename_all = "camelCase")]
    Pong { timestamp: i64 },
}

/// Restored-session summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub room_id: String,
    pub role: PlayerRole,
    pub color: Option<Color>,
}

/// Server-initiated events. Per-room events arrive in production order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum ServerEvent {
    #[serde(rename = "room:updated", rename_all = "camelCase")]
    RoomUpdated { room: RoomView },

    #[serde(rename = "room:closed", rename_all = "camelCase")]
    RoomClosed { room_id: String, reason: String },

    #[serde(rename = "room:kicked", rename_all = "camelCase")]
    RoomKicked { room_id: String },

    /// Server-wide, payload-free; clients refetch the catalog on demand.
    #[serde(rename = "room:list-updated")]
    RoomListUpdated,

    #[serde(rename = "game:started", rename_all = "camelCase")]
    GameStarted { room_id: String, game: GameView },

    #[serde(rename = "game:move", rename_all = "camelCase")]
    GameMove {
        room_id: String,
        #[serde(rename = "move")]
        mv: MoveRecord,
        game: GameView,
    },

    #[serde(rename = "game:ended", rename_all = "camelCase")]
    GameEnded {
        room_id: String,
        status: GameStatus,
        winner: Option<Color>,
        game: GameView,
    },

    #[serde(rename = "game:sync", rename_all = "camelCase")]
    GameSync { room_id: String, game: GameView },

    #[serde(rename = "player:joined", rename_all = "camelCase")]
    PlayerJoined {
        room_id: String,
        player_id: String,
        player_name: String,
        color: Color,
    },

    #[serde(rename = "player:left", rename_all = "camelCase")]
    PlayerLeft {
        room_id: String,
        player_id: String,
        reason: String,
    },

    #[serde(rename = "player:disconnected", rename_all = "camelCase")]
    PlayerDisconnected {
        room_id: String,
        player_id: String,
        grace_period: u64,
    },

    #[serde(rename = "player:reconnected", rename_all = "camelCase")]
    PlayerReconnected { room_id: String, player_id: String },

    #[serde(rename = "spectator:joined", rename_all = "camelCase")]
    SpectatorJoined {
        room_id: String,
        spectator_id: String,
        spectator_name: String,
    },

    #[serde(rename = "spectator:left", rename_all = "camelCase")]
    SpectatorLeft {
        room_id: String,
        spectator_id: String,
    },

    #[serde(rename = "chat:message", rename_all = "camelCase")]
    ChatMessage {
        room_id: String,
        sender_id: String,
        sender_name: String,
        message: String,
        chat_type: ChatType,
        timestamp: i64,
    },

    #[serde(rename = "draw:offered", rename_all = "camelCase")]
    DrawOffered {
        room_id: String,
        by_id: String,
        by_name: String,
    },

    #[serde(rename = "draw:declined", rename_all = "camelCase")]
    DrawDeclined { room_id: String, by_id: String },

    #[serde(rename = "error", rename_all = "camelCase")]
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn internal_error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: ErrorCode::Internal.code().to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_move_request() {
        let raw = r#"{"id":7,"type":"game:move","roomId":"abc123xy","from":"e2","to":"e4"}"#;
        let envelope: RequestEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.id, 7);
        match envelope.request {
            ClientRequest::GameMove {
                room_id,
                from,
                to,
                promotion,
            } => {
                assert_eq!(room_id, "abc123xy");
                assert_eq!(from, "e2");
                assert_eq!(to, "e4");
                assert!(promotion.is_none());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn parses_promotion_piece() {
        let raw = r#"{"id":1,"type":"game:move","roomId":"abc123xy","from":"a7","to":"a8","promotion":"n"}"#;
        let envelope: RequestEnvelope = serde_json::from_str(raw).unwrap();
        match envelope.request {
            ClientRequest::GameMove { promotion, .. } => {
                assert_eq!(promotion, Some(PromotionPiece::Knight));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_promotion_piece() {
        let raw = r#"{"id":1,"type":"game:move","roomId":"abc123xy","from":"a7","to":"a8","promotion":"k"}"#;
        assert!(serde_json::from_str::<RequestEnvelope>(raw).is_err());
    }

    #[test]
    fn validates_squares_and_names() {
        let bad_square = ClientRequest::GameMove {
            room_id: "abc123xy".into(),
            from: "e9".into(),
            to: "e4".into(),
            promotion: None,
        };
        assert_eq!(
            bad_square.validate().unwrap_err(),
            ErrorCode::ValidationFailed
        );

        let bad_name = ClientRequest::RoomCreate {
            player_name: "x".repeat(21),
            settings: SettingsPatch::default(),
            password: None,
        };
        assert_eq!(bad_name.validate().unwrap_err(), ErrorCode::ValidationFailed);

        let good = ClientRequest::RoomJoin {
            room_id: "AbC123xy".into(),
            player_name: "Magnus".into(),
            password: None,
        };
        assert!(good.validate().is_ok());
    }

    #[test]
    fn validates_time_control_bounds() {
        let too_fast = ClientRequest::RoomCreate {
            player_name: "Anna".into(),
            settings: SettingsPatch {
                time_control: Some(Some(TimeControl {
                    initial: 30,
                    increment: 0,
                })),
                ..Default::default()
            },
            password: None,
        };
        assert!(too_fast.validate().is_err());

        let too_generous = ClientRequest::RoomCreate {
            player_name: "Anna".into(),
            settings: SettingsPatch {
                time_control: Some(Some(TimeControl {
                    initial: 300,
                    increment: 61,
                })),
                ..Default::default()
            },
            password: None,
        };
        assert!(too_generous.validate().is_err());
    }

    #[test]
    fn validates_chat_message_length() {
        let long = ClientRequest::ChatSend {
            room_id: "abc123xy".into(),
            message: "x".repeat(501),
            chat_type: ChatType::Public,
        };
        assert!(long.validate().is_err());

        let empty = ClientRequest::ChatSend {
            room_id: "abc123xy".into(),
            message: "   ".into(),
            chat_type: ChatType::Public,
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn ack_serialization_shape() {
        let ack = Ack::rejected(3, ErrorCode::NotYourTurn);
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "not_your_turn");

        let pong = Ack::ok(4, AckData::Pong { timestamp: 99 });
        let json = serde_json::to_value(&pong).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["timestamp"], 99);
    }

    #[test]
    fn event_serialization_uses_event_tag() {
        let json = serde_json::to_value(ServerEvent::RoomListUpdated).unwrap();
        assert_eq!(json["event"], "room:list-updated");

        let json = serde_json::to_value(ServerEvent::PlayerDisconnected {
            room_id: "abc123xy".into(),
            player_id: "guest:g1".into(),
            grace_period: 60_000,
        })
        .unwrap();
        assert_eq!(json["event"], "player:disconnected");
        assert_eq!(json["gracePeriod"], 60_000);
    }

    #[test]
    fn every_error_code_is_stable() {
        let codes = [
            (ErrorCode::ValidationFailed, "validation_failed"),
            (ErrorCode::AlreadyInRoom, "already_in_room"),
            (ErrorCode::CannotAcceptOwnDraw, "cannot_accept_own_draw"),
            (ErrorCode::CannotKickPlayer, "cannot_kick_player"),
            (ErrorCode::PromotionRequired, "promotion_required"),
        ];
        for (code, expected) in codes {
            assert_eq!(code.code(), expected);
        }
    }
}
