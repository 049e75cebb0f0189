//! Room & Game Data Model
//!
//! The authoritative state owned by the server: rooms keyed by short id,
//! each embedding at most one game, plus the redacted views that go out on
//! the wire. All mutation happens through the state machine in
//! [`engine`](crate::room::engine).

pub mod catalog;
pub mod engine;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chess::repetition_key;
use crate::identity::Identity;

/// Epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Short, case-insensitive room identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub const LEN: usize = 8;
    const CHARSET: &'static [u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

    /// Allocate a fresh random id. Collision checks are the store's job.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id: String = (0..Self::LEN)
            .map(|_| Self::CHARSET[rng.gen_range(0..Self::CHARSET.len())] as char)
            .collect();
        Self(id)
    }

    /// Normalize client input; lookups are case-insensitive.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        let ok = (6..=10).contains(&normalized.len())
            && normalized
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
        ok.then_some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Piece color. Host is always white, opponent always black.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    White,
    Black,
}

impl Color {
    pub fn other(self) -> Self {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }
}

/// Promotion piece selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromotionPiece {
    #[serde(rename = "q")]
    Queen,
    #[serde(rename = "r")]
    Rook,
    #[serde(rename = "b")]
    Bishop,
    #[serde(rename = "n")]
    Knight,
}

/// Room lifecycle. Monotonic except via deletion; `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    WaitingForPlayer,
    InProgress,
    Finished,
}

/// Game outcome state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Active,
    Checkmate,
    Stalemate,
    Draw,
    Resigned,
    Timeout,
    Abandoned,
}

impl GameStatus {
    pub fn is_terminal(self) -> bool {
        self != GameStatus::Active
    }
}

/// A participant's role within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerRole {
    Host,
    Opponent,
    Spectator,
}

impl PlayerRole {
    pub fn is_player(self) -> bool {
        matches!(self, PlayerRole::Host | PlayerRole::Opponent)
    }
}

/// Wall-clock time control, in seconds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeControl {
    /// Initial budget per side, seconds.
    pub initial: u32,
    /// Added to the mover's clock after each accepted move, seconds.
    pub increment: u32,
}

impl TimeControl {
    pub fn initial_ms(&self) -> i64 {
        i64::from(self.initial) * 1000
    }

    pub fn increment_ms(&self) -> i64 {
        i64::from(self.increment) * 1000
    }
}

/// Per-room behavior knobs, host-controlled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub time_control: Option<TimeControl>,
    pub allow_spectators: bool,
    pub allow_join: bool,
    pub is_private: bool,
    pub room_name: Option<String>,
    pub is_locked: bool,
    /// `salt$hex(sha256(salt ‖ password))`; never leaves the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            time_control: None,
            allow_spectators: true,
            allow_join: true,
            is_private: false,
            room_name: None,
            is_locked: false,
            password_hash: None,
        }
    }
}

/// Host-supplied partial settings update; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsPatch {
    pub time_control: Option<Option<TimeControl>>,
    pub allow_spectators: Option<bool>,
    pub allow_join: Option<bool>,
    pub is_private: Option<bool>,
    pub room_name: Option<Option<String>>,
}

impl RoomSettings {
    /// Merge a patch, reporting whether catalog-relevant fields changed.
    pub fn apply(&mut self, patch: &SettingsPatch) -> bool {
        let mut catalog_dirty = false;
        if let Some(tc) = patch.time_control {
            self.time_control = tc;
        }
        if let Some(v) = patch.allow_spectators {
            self.allow_spectators = v;
        }
        if let Some(v) = patch.allow_join {
            if self.allow_join != v {
                catalog_dirty = true;
            }
            self.allow_join = v;
        }
        if let Some(v) = patch.is_private {
            if self.is_private != v {
                catalog_dirty = true;
            }
            self.is_private = v;
        }
        if let Some(ref name) = patch.room_name {
            self.room_name = name.clone();
        }
        catalog_dirty
    }
}

/// Hash a room password with a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let salt: [u8; 16] = rand::thread_rng().gen();
    let salt_hex = hex::encode(salt);
    format!("{salt_hex}${}", digest_with_salt(&salt_hex, password))
}

/// Verify a supplied password against a stored `salt$digest` pair.
pub fn verify_password(stored: &str, supplied: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, digest)) => digest_with_salt(salt, supplied) == digest,
        None => false,
    }
}

fn digest_with_salt(salt_hex: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt_hex.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// One accepted move.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRecord {
    pub from: String,
    pub to: String,
    pub san: String,
    /// FEN after the move; sufficient to resume rules evaluation.
    pub position_after: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion: Option<PromotionPiece>,
}

/// The embedded game record, created when the opponent is admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    /// Current position, FEN.
    pub position: String,
    pub turn: Color,
    pub moves: Vec<MoveRecord>,
    pub status: GameStatus,
    pub winner: Option<Color>,
    /// Milliseconds remaining; `None` when the room has no time control.
    pub white_time: Option<i64>,
    pub black_time: Option<i64>,
    pub last_move_at: i64,
    pub started_at: i64,
}

impl Game {
    pub fn new(time_control: Option<TimeControl>, now: i64) -> Self {
        Self {
            position: crate::chess::Board::new().fen(),
            turn: Color::White,
            moves: Vec::new(),
            status: GameStatus::Active,
            winner: None,
            white_time: time_control.map(|tc| tc.initial_ms()),
            black_time: time_control.map(|tc| tc.initial_ms()),
            last_move_at: now,
            started_at: now,
        }
    }

    pub fn clock_mut(&mut self, color: Color) -> &mut Option<i64> {
        match color {
            Color::White => &mut self.white_time,
            Color::Black => &mut self.black_time,
        }
    }

    pub fn clock(&self, color: Color) -> Option<i64> {
        match color {
            Color::White => self.white_time,
            Color::Black => self.black_time,
        }
    }

    /// Remaining time of the side on move as of `now`, when timed.
    pub fn remaining_on_move(&self, now: i64) -> Option<i64> {
        self.clock(self.turn)
            .map(|clock| clock - (now - self.last_move_at))
    }

    /// Whether the side on move is burning clock. Each side's first move is
    /// exempt: clocks start counting from a side's second move.
    pub fn clock_running(&self) -> bool {
        self.moves.len() / 2 >= 1
    }

    /// How often the current position has occurred over the whole game.
    /// Placement, side to move, castling rights and en-passant target are
    /// compared; move counters are ignored.
    pub fn repetition_count(&self) -> usize {
        let key = repetition_key(&self.position).to_string();
        let initial = crate::chess::Board::new().fen();
        std::iter::once(initial.as_str())
            .chain(self.moves.iter().map(|m| m.position_after.as_str()))
            .filter(|fen| repetition_key(fen) == key)
            .count()
    }
}

/// An active room and everything in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub host_id: Identity,
    pub host_name: String,
    pub opponent_id: Option<Identity>,
    pub opponent_name: Option<String>,
    /// Stable identity → display name. Unordered, soft-capped server-wide.
    pub spectators: BTreeMap<Identity, String>,
    pub state: RoomState,
    pub created_at: i64,
    pub last_activity: i64,
    pub game: Option<Game>,
    pub settings: RoomSettings,
    /// Pending draw offer; cleared on any move, resignation, leave, or end.
    pub draw_offerer: Option<Identity>,
}

impl Room {
    pub fn new(
        id: RoomId,
        host_id: Identity,
        host_name: String,
        settings: RoomSettings,
        now: i64,
    ) -> Self {
        Self {
            id,
            host_id,
            host_name,
            opponent_id: None,
            opponent_name: None,
            spectators: BTreeMap::new(),
            state: RoomState::WaitingForPlayer,
            created_at: now,
            last_activity: now,
            game: None,
            settings,
            draw_offerer: None,
        }
    }

    pub fn touch(&mut self, now: i64) {
        self.last_activity = now;
    }

    /// The color an identity plays, if it is a player of this room.
    pub fn player_color(&self, identity: &Identity) -> Option<Color> {
        if *identity == self.host_id {
            Some(Color::White)
        } else if self.opponent_id.as_ref() == Some(identity) {
            Some(Color::Black)
        } else {
            None
        }
    }

    pub fn player_name(&self, color: Color) -> Option<&str> {
        match color {
            Color::White => Some(self.host_name.as_str()),
            Color::Black => self.opponent_name.as_deref(),
        }
    }

    pub fn player_count(&self) -> usize {
        1 + usize::from(self.opponent_id.is_some())
    }

    /// Whether a listed catalog entry should exist for this room.
    pub fn is_listable(&self) -> bool {
        !self.settings.is_private && self.settings.allow_join
    }
}

// ---------------------------------------------------------------------------
// Redacted wire views
// ---------------------------------------------------------------------------

/// A spectator as shown to room participants (the host needs ids to kick).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectatorView {
    pub id: String,
    pub name: String,
}

/// Settings as shown to clients; the hash never leaves, only its presence.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    pub time_control: Option<TimeControl>,
    pub allow_spectators: bool,
    pub allow_join: bool,
    pub is_private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    pub is_locked: bool,
    pub has_password: bool,
}

/// Full room snapshot for participants.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    pub room_id: String,
    pub host_id: String,
    pub host_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opponent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opponent_name: Option<String>,
    pub spectators: Vec<SpectatorView>,
    pub state: RoomState,
    pub created_at: i64,
    pub last_activity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game: Option<GameView>,
    pub settings: SettingsView,
}

/// Game snapshot for participants.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameView {
    pub position: String,
    pub turn: Color,
    pub moves: Vec<MoveRecord>,
    pub status: GameStatus,
    pub winner: Option<Color>,
    pub white_time: Option<i64>,
    pub black_time: Option<i64>,
    pub last_move_at: i64,
    pub started_at: i64,
}

impl From<&Game> for GameView {
    fn from(game: &Game) -> Self {
        Self {
            position: game.position.clone(),
            turn: game.turn,
            moves: game.moves.clone(),
            status: game.status,
            winner: game.winner,
            white_time: game.white_time,
            black_time: game.black_time,
            last_move_at: game.last_move_at,
            started_at: game.started_at,
        }
    }
}

impl From<&Room> for RoomView {
    fn from(room: &Room) -> Self {
        Self {
            room_id: room.id.to_string(),
            host_id: room.host_id.to_string(),
            host_name: room.host_name.clone(),
            opponent_id: room.opponent_id.as_ref().map(Identity::to_string),
            opponent_name: room.opponent_name.clone(),
            spectators: room
                .spectators
                .iter()
                .map(|(id, name)| SpectatorView {
                    id: id.to_string(),
                    name: name.clone(),
                })
                .collect(),
            state: room.state,
            created_at: room.created_at,
            last_activity: room.last_activity,
            game: room.game.as_ref().map(GameView::from),
            settings: SettingsView {
                time_control: room.settings.time_control,
                allow_spectators: room.settings.allow_spectators,
                allow_join: room.settings.allow_join,
                is_private: room.settings.is_private,
                room_name: room.settings.room_name.clone(),
                is_locked: room.settings.is_locked,
                has_password: room.settings.password_hash.is_some(),
            },
        }
    }
}
