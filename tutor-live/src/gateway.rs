//! WebSocket gateway: authentication, request dispatch and event delivery.
//!
//! ```text
//!  socket ──► reader loop ──► dispatch ──► RoomRegistry / ChatLog / WhiteboardSync
//!                │                                   │
//!                │ Reply                             │ RoomGuard::broadcast
//!                ▼                                   ▼
//!          outbound queue ◄──── forwarder (one per subscribed room)
//!                │
//!                ▼
//!          writer task ──► socket
//! ```
//!
//! Every connection starts with a `Hello` carrying a bearer token. The
//! WebSocket upgrade and the hello share one `auth_timeout` deadline; until
//! the token resolves, nothing else is served. Afterwards one reader loop handles
//! requests in order while a writer task drains a bounded outbound queue.
//! A connection whose queue fills up, or whose room subscription lags, is
//! dropped rather than allowed to stall a room.

use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{Envelope, Hub, Outbound, Subscriber};
use crate::chat::{ChatLog, ChatPage};
use crate::config::ServerConfig;
use crate::error::{RoomError, RoomResult};
use crate::identity::IdentityProvider;
use crate::protocol::{ClientFrame, ErrorCode, Op, ProtocolError, Reply, RoomEvent, ServerFrame};
use crate::ratelimit::RateLimiter;
use crate::registry::RoomRegistry;
use crate::room::{ConnId, Principal, Room, RoomCode, Stamp, UserId};
use crate::storage::RoomStore;
use crate::whiteboard::WhiteboardSync;

type BoxError = Box<dyn Error + Send + Sync>;

/// Rate-limit key for room creation.
pub const OP_CREATE_ROOM: &str = "room.create";

/// How long a closing connection's writer may keep flushing.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Gateway statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Upgrades or hellos that failed, timed out or were rejected
    pub refused_handshakes: u64,
    /// Connections dropped for falling behind
    pub slow_disconnects: u64,
    /// Room events fanned out
    pub broadcasts_sent: u64,
    /// Room subscriptions cut off for lagging or a full queue
    pub subscribers_dropped: u64,
    /// Notices that found a full queue
    pub notices_dropped: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Rooms with an open broadcast channel
    pub active_rooms: usize,
    /// Rooms with cached state
    pub live_rooms: usize,
}

/// Why a connection's reader loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    Closed,
    Transport,
    SlowConsumer,
    /// A frame for this peer could not be encoded
    Protocol,
}

/// Per-connection session state owned by the reader loop.
struct Session {
    conn_id: ConnId,
    principal: Principal,
    outbound: Outbound,
    kill: Arc<Notify>,
    forwarders: HashMap<RoomCode, JoinHandle<()>>,
    /// Subscription whose forwarder starts once its reply is queued
    pending: Option<(RoomCode, broadcast::Receiver<Arc<Envelope>>)>,
}

impl Session {
    /// Queue a frame for the writer. An error means the connection must go.
    fn send(&self, frame: &ServerFrame) -> Result<(), Disconnect> {
        self.queue(frame.encode())
    }

    fn queue(&self, encoded: Result<Vec<u8>, ProtocolError>) -> Result<(), Disconnect> {
        let encoded = encoded.map_err(|e| {
            log::error!("Connection {}: failed to encode frame: {e}", self.conn_id);
            Disconnect::Protocol
        })?;
        match self.outbound.try_send(Arc::new(encoded)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::warn!("Connection {} outbound queue full; dropping", self.conn_id);
                Err(Disconnect::SlowConsumer)
            }
            Err(TrySendError::Closed(_)) => Err(Disconnect::Transport),
        }
    }

    fn start_pending(&mut self, hub: &Arc<Hub>) {
        if let Some((code, rx)) = self.pending.take() {
            let forwarder = hub.spawn_forwarder(
                code,
                self.conn_id,
                rx,
                self.outbound.clone(),
                Arc::clone(&self.kill),
            );
            if let Some(previous) = self.forwarders.insert(code, forwarder) {
                previous.abort();
            }
        }
    }

    fn stop_forwarder(&mut self, code: RoomCode) {
        if let Some(forwarder) = self.forwarders.remove(&code) {
            forwarder.abort();
        }
    }
}

/// The tutoring gateway.
pub struct Gateway {
    config: ServerConfig,
    hub: Arc<Hub>,
    registry: Arc<RoomRegistry>,
    chat: ChatLog,
    whiteboard: WhiteboardSync,
    limiter: RateLimiter,
    identity: Arc<dyn IdentityProvider>,
    stats: RwLock<ServerStats>,
}

impl Gateway {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn RoomStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let hub = Arc::new(Hub::new(config.broadcast_capacity));
        let registry = Arc::new(RoomRegistry::new(
            store,
            Arc::clone(&hub),
            config.registry_config(),
        ));
        let chat = ChatLog::new(Arc::clone(&registry), config.chat_limits());
        let whiteboard = WhiteboardSync::new(Arc::clone(&registry), config.max_stroke_payload);

        Self {
            config,
            hub,
            registry,
            chat,
            whiteboard,
            limiter: RateLimiter::new(),
            identity,
            stats: RwLock::new(ServerStats::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    pub fn whiteboard(&self) -> &WhiteboardSync {
        &self.whiteboard
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let broadcast = self.hub.stats();
        stats.broadcasts_sent = broadcast.messages_sent;
        stats.subscribers_dropped = broadcast.subscribers_dropped;
        stats.notices_dropped = broadcast.notices_dropped;
        stats.active_rooms = self.hub.rooms().room_count().await;
        stats.live_rooms = self.registry.live_count().await;
        stats
    }

    /// Periodically evict expired rate counters and idle cached rooms.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gateway.config.sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let counters = gateway.limiter.sweep();
                let rooms = gateway.registry.evict_idle().await;
                if counters > 0 || rooms > 0 {
                    log::debug!("Maintenance: {counters} rate counter(s), {rooms} idle room(s) evicted");
                }
            }
        })
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Tutoring gateway listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let gateway = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        self.stats.write().await.total_connections += 1;
        let deadline = Instant::now() + self.config.auth_timeout;

        let upgrade = tokio::time::timeout_at(deadline, tokio_tungstenite::accept_async(stream)).await;
        let ws_stream = match upgrade {
            Ok(Ok(ws_stream)) => ws_stream,
            Ok(Err(e)) => {
                self.stats.write().await.refused_handshakes += 1;
                return Err(e.into());
            }
            Err(_) => {
                self.stats.write().await.refused_handshakes += 1;
                log::debug!("WebSocket upgrade from {addr} not completed within {:?}", self.config.auth_timeout);
                return Ok(());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let principal = match self.handshake(&mut ws_receiver, deadline).await {
            Ok(principal) => principal,
            Err(code) => {
                self.stats.write().await.refused_handshakes += 1;
                if let Some(code) = code {
                    let refused = ServerFrame::Refused { code }.encode()?;
                    let _ = ws_sender.send(Message::Binary(refused.into())).await;
                }
                let _ = ws_sender.close().await;
                log::info!("Handshake from {addr} refused");
                return Ok(());
            }
        };

        let welcome = ServerFrame::Welcome {
            user_id: principal.user_id,
            display_name: principal.display_name.clone(),
        }
        .encode()?;
        ws_sender.send(Message::Binary(welcome.into())).await?;

        let conn_id = Uuid::new_v4();
        let (outbound, mut queue) = mpsc::channel::<Arc<Vec<u8>>>(self.config.outbound_queue.max(1));
        let kill = Arc::new(Notify::new());
        self.hub
            .register(principal.user_id, conn_id, outbound.clone(), Arc::clone(&kill))
            .await;
        self.stats.write().await.active_connections += 1;
        log::info!(
            "Connection {conn_id} from {addr} authenticated as {} ({})",
            principal.display_name,
            principal.user_id
        );

        let mut writer = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(e) = ws_sender.send(Message::Binary(Vec::clone(&frame).into())).await {
                    log::debug!("Writer for {conn_id} stopped: {e}");
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        let mut session = Session {
            conn_id,
            principal,
            outbound,
            kill: Arc::clone(&kill),
            forwarders: HashMap::new(),
            pending: None,
        };

        // tungstenite answers pings on its own; only binary frames matter here
        let reason = loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = self.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        match ClientFrame::decode(&data) {
                            Ok(ClientFrame::Request { id, op }) => {
                                let result = self.dispatch(&mut session, op).await;
                                if let Err(reason) = session.send(&ServerFrame::Reply { id, result }) {
                                    break reason;
                                }
                                session.start_pending(&self.hub);
                            }
                            Ok(ClientFrame::Hello { .. }) => {
                                log::debug!("Connection {conn_id}: repeated hello ignored");
                            }
                            Err(e) => {
                                log::warn!("Connection {conn_id}: undecodable frame: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Disconnect::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("Connection {conn_id} transport error: {e}");
                        break Disconnect::Transport;
                    }
                },
                _ = kill.notified() => break Disconnect::SlowConsumer,
            }
        };

        self.cleanup(&mut session).await;
        let user_id = session.principal.user_id;
        drop(session);

        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            if reason == Disconnect::SlowConsumer {
                s.slow_disconnects += 1;
            }
        }

        if matches!(reason, Disconnect::SlowConsumer | Disconnect::Protocol) {
            writer.abort();
        } else if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            writer.abort();
        }
        log::info!("Connection {conn_id} ({user_id}) from {addr} closed: {reason:?}");
        Ok(())
    }

    /// Wait for `Hello` until `deadline` and resolve its token.
    ///
    /// `Err(None)` means the peer went away or stayed silent; `Err(Some(code))`
    /// is reported back before closing.
    async fn handshake(
        &self,
        ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
        deadline: Instant,
    ) -> Result<Principal, Option<ErrorCode>> {
        let refuse = |e: RoomError| Some(ErrorCode::from_error(&e, self.config.hide_room_existence));
        loop {
            let msg = match tokio::time::timeout_at(deadline, ws_receiver.next()).await {
                Err(_) => {
                    log::debug!("No hello within {:?}", self.config.auth_timeout);
                    return Err(None);
                }
                Ok(None) | Ok(Some(Err(_))) => return Err(None),
                Ok(Some(Ok(msg))) => msg,
            };

            return match msg {
                Message::Binary(data) => match ClientFrame::decode(&data) {
                    Ok(ClientFrame::Hello { token }) => self.authenticate(&token).map_err(refuse),
                    Ok(ClientFrame::Request { .. }) => Err(refuse(RoomError::InvalidToken)),
                    Err(_) => Err(Some(ErrorCode::BadRequest)),
                },
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => Err(None),
                _ => Err(Some(ErrorCode::BadRequest)),
            };
        }
    }

    fn authenticate(&self, token: &str) -> RoomResult<Principal> {
        self.identity.resolve(token).map_err(|e| {
            log::info!("Token rejected: {e}");
            RoomError::InvalidToken
        })
    }

    async fn dispatch(&self, session: &mut Session, op: Op) -> Result<Reply, ErrorCode> {
        let principal = session.principal.clone();
        let origin = Some(session.conn_id);

        let result = match op {
            Op::CreateRoom {
                student_id,
                scheduled_start,
                scheduled_end,
            } => self
                .create_room(&principal, student_id, scheduled_start, scheduled_end)
                .await
                .map(|room| Reply::RoomCreated { room }),
            Op::Subscribe { room } => self.subscribe(session, room).await,
            Op::Unsubscribe { room } => {
                session.stop_forwarder(room);
                self.registry.leave(room, session.conn_id).await;
                Ok(Reply::Unsubscribed { room })
            }
            Op::SendChat { room, body } => self
                .chat
                .append(room, &principal, body, origin)
                .await
                .map(Reply::ChatSent),
            Op::History { room, before, limit } => self
                .history(&principal, room, before, limit)
                .await
                .map(Reply::History),
            Op::AddStroke {
                room,
                stroke_id,
                payload,
            } => self
                .whiteboard
                .add_stroke(room, &principal, stroke_id, payload, origin)
                .await
                .map(|ack| Reply::StrokeAck {
                    stroke_id: ack.stroke_id,
                    applied: ack.applied,
                    stamp: ack.stamp,
                }),
            Op::DeleteStroke { room, stroke_id } => self
                .whiteboard
                .delete_stroke(room, &principal, stroke_id, origin)
                .await
                .map(|ack| Reply::StrokeAck {
                    stroke_id: ack.stroke_id,
                    applied: ack.applied,
                    stamp: ack.stamp,
                }),
            Op::ClearUser { room, user_id } => self
                .whiteboard
                .clear_user(room, &principal, user_id, origin)
                .await
                .map(|stamp| Reply::Cleared { user_id, stamp }),
            Op::StrokeDelta {
                room,
                stroke_id,
                points,
            } => self
                .whiteboard
                .stream_delta(room, &principal, stroke_id, points, origin)
                .await
                .map(|()| Reply::Done),
            Op::Snapshot { room } => self
                .whiteboard
                .snapshot(room, &principal)
                .await
                .map(|strokes| Reply::Snapshot { strokes }),
            Op::EndRoom { room } => self
                .registry
                .end(room, &principal)
                .await
                .map(|room| Reply::Ended { room }),
            Op::Stats { room } => self.registry.stats(room, &principal).await.map(Reply::Stats),
            Op::Typing { room, typing } => self
                .registry
                .typing(room, &principal, typing, origin)
                .await
                .map(|()| Reply::Done),
            Op::Ping => Ok(Reply::Pong),
        };

        result.map_err(|e| {
            match &e {
                RoomError::Storage(_) => log::error!("Request from {} failed: {e}", principal.user_id),
                e if e.is_transient() => log::info!("Request from {} deferred: {e}", principal.user_id),
                _ => log::debug!("Request from {} refused: {e}", principal.user_id),
            }
            ErrorCode::from_error(&e, self.config.hide_room_existence)
        })
    }

    async fn create_room(
        &self,
        principal: &Principal,
        student_id: UserId,
        scheduled_start: u64,
        scheduled_end: u64,
    ) -> RoomResult<Room> {
        if !self.limiter.allow(
            principal.user_id,
            OP_CREATE_ROOM,
            self.config.room_create_limit,
            self.config.room_create_window,
        ) {
            return Err(RoomError::RateExceeded(OP_CREATE_ROOM.into()));
        }
        self.registry
            .create_room(principal.user_id, student_id, scheduled_start, scheduled_end)
            .await
    }

    /// Join a room and hand back its state.
    ///
    /// Everything happens under the room lock, so the snapshot in the reply
    /// and the first live event the forwarder delivers line up exactly.
    async fn subscribe(&self, session: &mut Session, code: RoomCode) -> RoomResult<Reply> {
        let principal = session.principal.clone();
        let mut guard = self.registry.lock(code, &principal).await?;
        let room = self.registry.join_locked(&mut guard, &principal).await?;
        let strokes = guard.board().visible();
        let chat = self
            .chat
            .history(code, None, self.config.history_page_size)
            .await?;

        session.stop_forwarder(code);
        let rx = guard
            .subscribe(Subscriber {
                conn_id: session.conn_id,
                user_id: principal.user_id,
                display_name: principal.display_name.clone(),
            })
            .await;
        guard
            .broadcast(
                RoomEvent::ParticipantJoined {
                    user_id: principal.user_id,
                    display_name: principal.display_name.clone(),
                },
                Some(session.conn_id),
            )
            .await;
        drop(guard);

        session.pending = Some((code, rx));
        Ok(Reply::Subscribed { room, strokes, chat })
    }

    async fn history(
        &self,
        principal: &Principal,
        code: RoomCode,
        before: Option<Stamp>,
        limit: u32,
    ) -> RoomResult<ChatPage> {
        let room = self.registry.resolve_by_code(code).await?;
        RoomRegistry::authorize(&room, principal)?;
        self.chat.history(code, before, limit as usize).await
    }

    async fn cleanup(&self, session: &mut Session) {
        if let Some((code, _)) = session.pending.take() {
            self.registry.leave(code, session.conn_id).await;
        }
        let rooms: Vec<RoomCode> = session.forwarders.keys().copied().collect();
        for code in rooms {
            session.stop_forwarder(code);
            self.registry.leave(code, session.conn_id).await;
        }
        self.hub
            .unregister(session.principal.user_id, &session.conn_id)
            .await;
    }
}
