//! WebSocket Game Server
//!
//! Async WebSocket server for the room engine. Accepts connections, runs
//! the identity handshake, then relays validated requests into the state
//! machine and acknowledgements/events back out. Each connection gets a
//! reader loop here and a writer task draining its outbound channel.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::identity::{resolve, AuthConfig, ConnectionId, Identity};
use crate::network::protocol::{
    Ack, AckData, ClientRequest, ErrorCode, RequestEnvelope, ServerFrame,
};
use crate::room::engine::Engine;
use crate::room::{now_ms, Color, RoomId};

/// Server-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The WebSocket front of the room engine.
pub struct GameServer {
    config: Config,
    engine: Arc<Engine>,
    auth: AuthConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    pub fn new(config: Config, engine: Arc<Engine>) -> Self {
        let auth = AuthConfig {
            secret: config.jwt_secret.clone(),
        };
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            engine,
            auth,
            shutdown_tx,
        }
    }

    /// Accept loop. Runs until shutdown is signalled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.ws_addr).await?;
        info!("game server listening on {}", self.config.ws_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        if self.engine.hub().connection_count().await >= self.config.max_connections {
                            warn!("connection limit reached, rejecting {addr}");
                            continue;
                        }
                        self.handle_connection(stream, addr);
                    }
                    Err(e) => error!("accept error: {e}"),
                },
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Spawn the per-connection task: handshake, reader loop, cleanup.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let engine = self.engine.clone();
        let auth = self.auth.clone();
        let handshake_timeout = self.config.handshake_timeout;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("websocket handshake failed for {addr}: {e}");
                    return;
                }
            };
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();

            let conn = ConnectionId::generate();
            let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
            engine.hub().register(conn, tx.clone()).await;

            // Writer task: the only place socket writes happen.
            let sender_task = tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    let text = match serde_json::to_string(&frame) {
                        Ok(t) => t,
                        Err(e) => {
                            error!("failed to serialize outbound frame: {e}");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            // Identity handshake: first frame within the window, or close.
            let identity =
                match timeout(handshake_timeout, ws_receiver.next()).await {
                    Ok(Some(Ok(Message::Text(text)))) => handshake(&auth, conn, &tx, &text),
                    Ok(_) => None,
                    Err(_) => {
                        debug!("handshake timed out for {addr}");
                        None
                    }
                };
            let Some(identity) = identity else {
                sender_task.abort();
                engine.hub().unregister(conn).await;
                return;
            };
            info!(%conn, %identity, "connection admitted from {addr}");

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            handle_request(&engine, &identity, conn, &tx, &text).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("websocket error for {addr}: {e}");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }

            sender_task.abort();
            engine.hub().unregister(conn).await;
            engine.handle_disconnect(&identity, conn, now_ms()).await;
            debug!(%conn, "connection closed");
        });
    }
}

/// Process the handshake frame; returns the resolved identity on success.
fn handshake(
    auth: &AuthConfig,
    conn: ConnectionId,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    text: &str,
) -> Option<Identity> {
    let envelope: RequestEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("malformed handshake frame: {e}");
            return None;
        }
    };
    if envelope.request.validate().is_err() {
        let _ = tx.send(ServerFrame::Ack(Ack::rejected(
            envelope.id,
            ErrorCode::ValidationFailed,
        )));
        return None;
    }
    let ClientRequest::Hello { token, guest_id } = envelope.request else {
        let _ = tx.send(ServerFrame::Ack(Ack::rejected(
            envelope.id,
            ErrorCode::ValidationFailed,
        )));
        return None;
    };

    let identity = resolve(token.as_deref(), guest_id.as_deref(), conn, auth);
    let _ = tx.send(ServerFrame::Ack(Ack::ok(
        envelope.id,
        AckData::Welcome {
            player_id: identity.to_string(),
            authenticated: identity.is_authenticated(),
        },
    )));
    Some(identity)
}

/// Parse, validate, route, acknowledge.
async fn handle_request(
    engine: &Engine,
    identity: &Identity,
    conn: ConnectionId,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    text: &str,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("unparseable request: {e}");
            let _ = tx.send(ServerFrame::Ack(Ack::rejected(0, ErrorCode::ValidationFailed)));
            return;
        }
    };
    let id = value.get("id").and_then(|v| v.as_u64()).unwrap_or(0);
    let envelope: RequestEnvelope = match serde_json::from_value(value) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("request failed to decode: {e}");
            let _ = tx.send(ServerFrame::Ack(Ack::rejected(id, ErrorCode::ValidationFailed)));
            return;
        }
    };

    let ack = match envelope.request.validate() {
        Err(code) => Ack::rejected(envelope.id, code),
        Ok(()) => match route(engine, identity, conn, envelope.request).await {
            Ok(Some(data)) => Ack::ok(envelope.id, data),
            Ok(None) => Ack::empty(envelope.id),
            Err(code) => Ack::rejected(envelope.id, code),
        },
    };
    let _ = tx.send(ServerFrame::Ack(ack));
}

/// Map a validated request onto the state machine.
async fn route(
    engine: &Engine,
    identity: &Identity,
    conn: ConnectionId,
    request: ClientRequest,
) -> Result<Option<AckData>, ErrorCode> {
    let now = now_ms();
    match request {
        // Only meaningful during the handshake.
        ClientRequest::Hello { .. } => Err(ErrorCode::ValidationFailed),

        ClientRequest::RoomCreate {
            player_name,
            settings,
            password,
        } => {
            let room = engine
                .create_room(
                    identity,
                    conn,
                    &player_name,
                    &settings,
                    password.as_deref(),
                    now,
                )
                .await?;
            Ok(Some(AckData::RoomEntered {
                room,
                player_id: identity.to_string(),
                color: Some(Color::White),
            }))
        }

        ClientRequest::RoomJoin {
            room_id,
            player_name,
            password,
        } => {
            let room_id = parse_room_id(&room_id)?;
            let room = engine
                .join_room(
                    identity,
                    conn,
                    &player_name,
                    &room_id,
                    password.as_deref(),
                    now,
                )
                .await?;
            Ok(Some(AckData::RoomEntered {
                room,
                player_id: identity.to_string(),
                color: Some(Color::Black),
            }))
        }

        ClientRequest::RoomSpectate {
            room_id,
            spectator_name,
            password,
        } => {
            let room_id = parse_room_id(&room_id)?;
            let room = engine
                .spectate_room(
                    identity,
                    conn,
                    spectator_name.as_deref(),
                    &room_id,
                    password.as_deref(),
                    now,
                )
                .await?;
            Ok(Some(AckData::RoomEntered {
                room,
                player_id: identity.to_string(),
                color: None,
            }))
        }

        ClientRequest::RoomLeave => {
            engine.leave(identity, now).await?;
            Ok(None)
        }

        ClientRequest::RoomKick { room_id, target_id } => {
            let room_id = parse_room_id(&room_id)?;
            engine
                .kick_spectator(identity, &room_id, &target_id, now)
                .await?;
            Ok(None)
        }

        ClientRequest::RoomLock {
            room_id,
            locked,
            password,
        } => {
            let room_id = parse_room_id(&room_id)?;
            engine
                .lock_room(identity, &room_id, locked, password.as_deref(), now)
                .await?;
            Ok(None)
        }

        ClientRequest::RoomUpdateSettings { room_id, settings } => {
            let room_id = parse_room_id(&room_id)?;
            engine
                .update_settings(identity, &room_id, &settings, now)
                .await?;
            Ok(None)
        }

        ClientRequest::GameMove {
            room_id,
            from,
            to,
            promotion,
        } => {
            let room_id = parse_room_id(&room_id)?;
            let (mv, game_state) = engine
                .play_move(identity, &room_id, &from, &to, promotion, now)
                .await?;
            Ok(Some(AckData::MoveAccepted { mv, game_state }))
        }

        ClientRequest::GameResign { room_id } => {
            let room_id = parse_room_id(&room_id)?;
            engine.resign(identity, &room_id, now).await?;
            Ok(None)
        }

        ClientRequest::GameOfferDraw { room_id } => {
            let room_id = parse_room_id(&room_id)?;
            engine.offer_draw(identity, &room_id, now).await?;
            Ok(None)
        }

        ClientRequest::GameAcceptDraw { room_id } => {
            let room_id = parse_room_id(&room_id)?;
            engine.accept_draw(identity, &room_id, now).await?;
            Ok(None)
        }

        ClientRequest::GameDeclineDraw { room_id } => {
            let room_id = parse_room_id(&room_id)?;
            engine.decline_draw(identity, &room_id, now).await?;
            Ok(None)
        }

        ClientRequest::ChatSend {
            room_id,
            message,
            chat_type,
        } => {
            let room_id = parse_room_id(&room_id)?;
            engine
                .chat(identity, &room_id, &message, chat_type, now)
                .await?;
            Ok(None)
        }

        ClientRequest::SessionRestore => {
            let (session, room) = engine.restore_session(identity, conn).await?;
            Ok(Some(AckData::SessionRestored { session, room }))
        }

        ClientRequest::Ping => Ok(Some(AckData::Pong { timestamp: now })),
    }
}

fn parse_room_id(raw: &str) -> Result<RoomId, ErrorCode> {
    RoomId::parse(raw).ok_or(ErrorCode::ValidationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NullCache;
    use crate::network::bus::Hub;
    use crate::network::registry::SessionRegistry;
    use crate::room::engine::EngineLimits;
    use crate::room::store::RoomStore;

    fn test_engine() -> Arc<Engine> {
        Arc::new(Engine::new(
            Arc::new(RoomStore::new(Arc::new(NullCache))),
            Arc::new(SessionRegistry::new()),
            Arc::new(Hub::new()),
            EngineLimits::default(),
        ))
    }

    async fn client(engine: &Engine) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>) {
        let conn = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        engine.hub().register(conn, tx).await;
        (conn, rx)
    }

    #[tokio::test]
    async fn route_create_then_move() {
        let engine = test_engine();
        let (host_conn, _host_rx) = client(&engine).await;
        let host = Identity::Guest("host".into());

        let created = route(
            &engine,
            &host,
            host_conn,
            ClientRequest::RoomCreate {
                player_name: "Anna".into(),
                settings: Default::default(),
                password: None,
            },
        )
        .await
        .unwrap();
        let Some(AckData::RoomEntered { room, color, .. }) = created else {
            panic!("expected room ack");
        };
        assert_eq!(color, Some(Color::White));

        let (opp_conn, _opp_rx) = client(&engine).await;
        let opponent = Identity::Guest("opp".into());
        route(
            &engine,
            &opponent,
            opp_conn,
            ClientRequest::RoomJoin {
                room_id: room.room_id.clone(),
                player_name: "Boris".into(),
                password: None,
            },
        )
        .await
        .unwrap();

        let moved = route(
            &engine,
            &host,
            host_conn,
            ClientRequest::GameMove {
                room_id: room.room_id.clone(),
                from: "e2".into(),
                to: "e4".into(),
                promotion: None,
            },
        )
        .await
        .unwrap();
        assert!(matches!(moved, Some(AckData::MoveAccepted { .. })));
    }

    #[tokio::test]
    async fn route_rejects_post_handshake_hello() {
        let engine = test_engine();
        let (conn, _rx) = client(&engine).await;
        let identity = Identity::Guest("g".into());
        let err = route(
            &engine,
            &identity,
            conn,
            ClientRequest::Hello {
                token: None,
                guest_id: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn handle_request_acks_validation_failure() {
        let engine = test_engine();
        let (conn, mut rx) = client(&engine).await;
        let identity = Identity::Guest("g".into());
        let (tx, mut ack_rx) = mpsc::unbounded_channel();

        handle_request(
            &engine,
            &identity,
            conn,
            &tx,
            r#"{"id":9,"type":"game:move","roomId":"abc123xy","from":"e9","to":"e4"}"#,
        )
        .await;

        let frame = ack_rx.try_recv().unwrap();
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["id"], 9);
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "validation_failed");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn handshake_resolves_guest_identity() {
        let engine = test_engine();
        let (conn, _rx) = client(&engine).await;
        let (tx, mut ack_rx) = mpsc::unbounded_channel();
        let auth = AuthConfig::default();

        let identity = handshake(
            &auth,
            conn,
            &tx,
            r#"{"id":1,"type":"session:hello","guestId":"g-123"}"#,
        )
        .unwrap();
        assert_eq!(identity, Identity::Guest("g-123".into()));

        let frame = ack_rx.try_recv().unwrap();
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["playerId"], "guest:g-123");
        assert_eq!(json["authenticated"], false);
    }

    #[tokio::test]
    async fn handshake_rejects_non_hello() {
        let engine = test_engine();
        let (conn, _rx) = client(&engine).await;
        let (tx, mut ack_rx) = mpsc::unbounded_channel();
        let auth = AuthConfig::default();

        let identity = handshake(&auth, conn, &tx, r#"{"id":1,"type":"ping"}"#);
        assert!(identity.is_none());
        let json = serde_json::to_value(ack_rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["success"], false);
    }
}
