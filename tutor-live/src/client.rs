//! WebSocket client for the tutoring gateway.
//!
//! [`RoomClient::connect`] performs the `Hello` handshake, then spawns a
//! writer task and a reader task. Replies are matched to requests by id;
//! room events and notices arrive on [`RoomClient::next_event`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::chat::{ChatMessage, ChatPage};
use crate::protocol::{ClientFrame, ErrorCode, Notice, Op, ProtocolError, Reply, RoomEvent, ServerFrame};
use crate::registry::RoomStats;
use crate::room::{Principal, Room, RoomCode, Stamp, UserId};
use crate::whiteboard::{Stroke, StrokeAck};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_BUFFER: usize = 1024;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection refused: {0}")]
    Refused(ErrorCode),

    #[error("Request failed: {0}")]
    Request(ErrorCode),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Connection closed")]
    Closed,

    #[error("Request timed out")]
    Timeout,
}

impl ClientError {
    /// The server's error code, if the server answered with one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Refused(code) | ClientError::Request(code) => Some(*code),
            _ => None,
        }
    }
}

/// Unsolicited traffic from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Room { room: RoomCode, event: RoomEvent },
    Notice(Notice),
    /// The connection is gone; no further events follow
    Disconnected,
}

/// Room state handed back on subscribe.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub room: Room,
    pub strokes: Vec<Stroke>,
    pub chat: ChatPage,
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Reply, ErrorCode>>>>>;

/// An authenticated gateway connection.
pub struct RoomClient {
    principal: Principal,
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: PendingReplies,
    next_id: AtomicU64,
    events: mpsc::Receiver<ClientEvent>,
    request_timeout: Duration,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RoomClient {
    /// Connect to `url` and authenticate with `token`.
    pub async fn connect(url: &str, token: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let hello = ClientFrame::Hello {
            token: token.to_owned(),
        }
        .encode()?;
        ws_writer.send(Message::Binary(hello.into())).await?;

        let principal = loop {
            let msg = match tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_reader.next()).await {
                Err(_) => return Err(ClientError::Timeout),
                Ok(None) => return Err(ClientError::Closed),
                Ok(Some(msg)) => msg?,
            };
            match msg {
                Message::Binary(data) => match ServerFrame::decode(&data)? {
                    ServerFrame::Welcome {
                        user_id,
                        display_name,
                    } => break Principal::new(user_id, display_name),
                    ServerFrame::Refused { code } => return Err(ClientError::Refused(code)),
                    _ => return Err(ProtocolError::UnexpectedFrame("expected welcome").into()),
                },
                Message::Close(_) => return Err(ClientError::Closed),
                _ => continue,
            }
        };

        let (outgoing, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, events) = mpsc::channel(EVENT_BUFFER);
        let replies = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let event = match ServerFrame::decode(&data) {
                    Ok(ServerFrame::Reply { id, result }) => {
                        if let Some(tx) = replies.lock().await.remove(&id) {
                            let _ = tx.send(result);
                        }
                        continue;
                    }
                    Ok(ServerFrame::Event { room, event }) => ClientEvent::Room { room, event },
                    Ok(ServerFrame::Notice(notice)) => ClientEvent::Notice(notice),
                    Ok(other) => {
                        log::debug!("Ignoring unexpected frame {other:?}");
                        continue;
                    }
                    Err(e) => {
                        log::warn!("Undecodable server frame: {e}");
                        continue;
                    }
                };
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }

            // Dropping the senders fails every outstanding request
            replies.lock().await.clear();
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(Self {
            principal,
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            events,
            request_timeout: Duration::from_secs(10),
            writer,
            reader,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Identity the server resolved for this connection.
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn user_id(&self) -> UserId {
        self.principal.user_id
    }

    /// Send one request and wait for its reply.
    pub async fn request(&self, op: Op) -> Result<Reply, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = ClientFrame::Request { id, op }.encode()?;
        if self.outgoing.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ClientError::Timeout)
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Ok(Ok(result)) => result.map_err(ClientError::Request),
        }
    }

    /// Next room event or notice; `None` once the connection is gone and
    /// everything buffered was read.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Close the connection and wait for the background tasks.
    pub async fn close(self) {
        let RoomClient {
            outgoing,
            writer,
            reader,
            ..
        } = self;
        drop(outgoing);
        let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
        reader.abort();
    }

    // ─── Typed requests ───────────────────────────────────────────────

    pub async fn create_room(
        &self,
        student_id: UserId,
        scheduled_start: u64,
        scheduled_end: u64,
    ) -> Result<Room, ClientError> {
        let op = Op::CreateRoom {
            student_id,
            scheduled_start,
            scheduled_end,
        };
        match self.request(op).await? {
            Reply::RoomCreated { room } => Ok(room),
            other => Err(unexpected(other)),
        }
    }

    pub async fn subscribe(&self, room: RoomCode) -> Result<Subscription, ClientError> {
        match self.request(Op::Subscribe { room }).await? {
            Reply::Subscribed { room, strokes, chat } => Ok(Subscription { room, strokes, chat }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unsubscribe(&self, room: RoomCode) -> Result<(), ClientError> {
        match self.request(Op::Unsubscribe { room }).await? {
            Reply::Unsubscribed { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn send_chat(&self, room: RoomCode, body: impl Into<String>) -> Result<ChatMessage, ClientError> {
        let op = Op::SendChat {
            room,
            body: body.into(),
        };
        match self.request(op).await? {
            Reply::ChatSent(message) => Ok(message),
            other => Err(unexpected(other)),
        }
    }

    pub async fn history(
        &self,
        room: RoomCode,
        before: Option<Stamp>,
        limit: u32,
    ) -> Result<ChatPage, ClientError> {
        match self.request(Op::History { room, before, limit }).await? {
            Reply::History(page) => Ok(page),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_stroke(
        &self,
        room: RoomCode,
        stroke_id: Uuid,
        payload: Vec<u8>,
    ) -> Result<StrokeAck, ClientError> {
        let op = Op::AddStroke {
            room,
            stroke_id,
            payload,
        };
        expect_ack(self.request(op).await?)
    }

    /// Relay points of a stroke still being drawn. Peers see them at once;
    /// nothing is stored until [`add_stroke`](Self::add_stroke).
    pub async fn stream_delta(&self, room: RoomCode, stroke_id: Uuid, points: Vec<u8>) -> Result<(), ClientError> {
        let op = Op::StrokeDelta {
            room,
            stroke_id,
            points,
        };
        match self.request(op).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_stroke(&self, room: RoomCode, stroke_id: Uuid) -> Result<StrokeAck, ClientError> {
        expect_ack(self.request(Op::DeleteStroke { room, stroke_id }).await?)
    }

    /// Clear this user's own strokes. `None` when there was nothing to clear.
    pub async fn clear_mine(&self, room: RoomCode) -> Result<Option<Stamp>, ClientError> {
        self.clear_user(room, self.principal.user_id).await
    }

    pub async fn clear_user(&self, room: RoomCode, user_id: UserId) -> Result<Option<Stamp>, ClientError> {
        match self.request(Op::ClearUser { room, user_id }).await? {
            Reply::Cleared { stamp, .. } => Ok(stamp),
            other => Err(unexpected(other)),
        }
    }

    pub async fn snapshot(&self, room: RoomCode) -> Result<Vec<Stroke>, ClientError> {
        match self.request(Op::Snapshot { room }).await? {
            Reply::Snapshot { strokes } => Ok(strokes),
            other => Err(unexpected(other)),
        }
    }

    pub async fn end_room(&self, room: RoomCode) -> Result<Room, ClientError> {
        match self.request(Op::EndRoom { room }).await? {
            Reply::Ended { room } => Ok(room),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stats(&self, room: RoomCode) -> Result<RoomStats, ClientError> {
        match self.request(Op::Stats { room }).await? {
            Reply::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    pub async fn typing(&self, room: RoomCode, typing: bool) -> Result<(), ClientError> {
        match self.request(Op::Typing { room, typing }).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.request(Op::Ping).await? {
            Reply::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn expect_ack(reply: Reply) -> Result<StrokeAck, ClientError> {
    match reply {
        Reply::StrokeAck {
            stroke_id,
            applied,
            stamp,
        } => Ok(StrokeAck {
            stroke_id,
            applied,
            stamp,
        }),
        other => Err(unexpected(other)),
    }
}

fn unexpected(reply: Reply) -> ClientError {
    ClientError::UnexpectedReply(format!("{reply:?}"))
}
