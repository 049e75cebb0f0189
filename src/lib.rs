//! # Rookery
//!
//! Authoritative server for real-time multiplayer chess: rooms, embedded
//! games, wall-clock time control, reconnect grace, and ordered event
//! fan-out to players and spectators.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         ROOKERY                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  chess/          - Rules adapter over shakmaty               │
//! │                                                              │
//! │  room/           - Authoritative state                       │
//! │  ├── store.rs    - Room set, per-room critical sections      │
//! │  ├── engine.rs   - The protocol state machine                │
//! │  └── catalog.rs  - Public listings projection                │
//! │                                                              │
//! │  network/        - Transport and sessions                    │
//! │  ├── server.rs   - WebSocket accept loop and dispatch        │
//! │  ├── protocol.rs - Wire schema, validation, error codes      │
//! │  ├── registry.rs - Identity → session binding                │
//! │  ├── bus.rs      - Per-room ordered event fan-out            │
//! │  └── http.rs     - Health, stats, catalog endpoints          │
//! │                                                              │
//! │  identity.rs     - User / guest / connection resolution      │
//! │  cache.rs        - Optional write-through room cache         │
//! │  sweeper.rs      - Clocks, grace expiry, room GC             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency model
//!
//! Every mutation of a room runs inside that room's critical section, and
//! events are pushed onto per-connection queues at commit point, so each
//! room's event stream is totally ordered and never interleaves
//! read-modify-write cycles. Operations on different rooms are independent.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod cache;
pub mod chess;
pub mod config;
pub mod identity;
pub mod network;
pub mod room;
pub mod sweeper;

// Re-export the spine of the crate
pub use config::Config;
pub use identity::{ConnectionId, Identity};
pub use network::bus::Hub;
pub use network::registry::SessionRegistry;
pub use room::engine::{Engine, EngineLimits};
pub use room::store::RoomStore;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
