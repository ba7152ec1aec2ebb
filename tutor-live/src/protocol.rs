//! Binary wire protocol between clients and the gateway.
//!
//! Every WebSocket binary frame carries one bincode-encoded frame:
//! ```text
//! client                                   server
//!   │── Hello { token } ─────────────────────►│
//!   │◄──────────────── Welcome | Refused ─────│
//!   │── Request { id, op } ──────────────────►│
//!   │◄──────────────── Reply { id, result } ──│
//!   │◄──────────────── Event { room, event } ─│  (room broadcast)
//!   │◄──────────────── Notice(..) ────────────│  (per-user unicast)
//! ```
//!
//! Requests carry a client-chosen `id` echoed on the matching reply; events
//! and notices are unsolicited and may interleave with replies.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::{ChatMessage, ChatPage};
use crate::error::RoomError;
use crate::registry::RoomStats;
use crate::room::{Room, RoomCode, Stamp, UserId};
use crate::whiteboard::Stroke;

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Must be the first frame on a connection.
    Hello { token: String },
    Request { id: u64, op: Op },
}

/// Operations a client can request once authenticated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    CreateRoom {
        student_id: UserId,
        scheduled_start: u64,
        scheduled_end: u64,
    },
    Subscribe { room: RoomCode },
    Unsubscribe { room: RoomCode },
    SendChat { room: RoomCode, body: String },
    History {
        room: RoomCode,
        /// Exclusive upper bound; `None` starts from the newest message
        before: Option<Stamp>,
        limit: u32,
    },
    AddStroke {
        room: RoomCode,
        stroke_id: Uuid,
        payload: Vec<u8>,
    },
    /// In-progress points of a stroke being drawn; relayed, never stored
    StrokeDelta {
        room: RoomCode,
        stroke_id: Uuid,
        points: Vec<u8>,
    },
    DeleteStroke { room: RoomCode, stroke_id: Uuid },
    ClearUser { room: RoomCode, user_id: UserId },
    Snapshot { room: RoomCode },
    EndRoom { room: RoomCode },
    Stats { room: RoomCode },
    Typing { room: RoomCode, typing: bool },
    Ping,
}

/// Successful results, one shape per [`Op`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    RoomCreated { room: Room },
    Subscribed {
        room: Room,
        strokes: Vec<Stroke>,
        chat: ChatPage,
    },
    Unsubscribed { room: RoomCode },
    ChatSent(ChatMessage),
    History(ChatPage),
    StrokeAck {
        stroke_id: Uuid,
        /// False when the request was an idempotent no-op
        applied: bool,
        stamp: Stamp,
    },
    /// `stamp` is `None` when the user had nothing visible to clear
    Cleared { user_id: UserId, stamp: Option<Stamp> },
    Snapshot { strokes: Vec<Stroke> },
    Ended { room: Room },
    Stats(RoomStats),
    Done,
    Pong,
}

/// Room-scoped events fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoomEvent {
    Activated { actual_start: u64 },
    Chat(ChatMessage),
    StrokeAdded(Stroke),
    StrokeDelta {
        user_id: UserId,
        stroke_id: Uuid,
        points: Vec<u8>,
    },
    StrokeDeleted {
        stroke_id: Uuid,
        by: UserId,
        stamp: Stamp,
    },
    UserCleared { user_id: UserId, stamp: Stamp },
    ParticipantJoined { user_id: UserId, display_name: String },
    ParticipantLeft { user_id: UserId },
    Typing { user_id: UserId, typing: bool },
    /// Last event on a room's channel.
    Closed { actual_end: u64, duration_minutes: u32 },
}

impl RoomEvent {
    /// Whether delivering this event ends the subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoomEvent::Closed { .. })
    }
}

/// Unicast notices addressed to a user rather than a room channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notice {
    RoomEnded { room: RoomCode, duration_minutes: u32 },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Welcome { user_id: UserId, display_name: String },
    Refused { code: ErrorCode },
    Reply {
        id: u64,
        result: Result<Reply, ErrorCode>,
    },
    Event { room: RoomCode, event: RoomEvent },
    Notice(Notice),
}

/// Wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    Validation = 1,
    NotFound = 2,
    AccessDenied = 3,
    AlreadyEnded = 4,
    NotActive = 5,
    InvalidToken = 6,
    RateExceeded = 7,
    /// Room lock not acquired in time; retry
    Busy = 8,
    StorageFailure = 9,
    /// Frame could not be decoded or was out of sequence
    BadRequest = 10,
}

impl ErrorCode {
    /// Map a domain error onto the wire.
    ///
    /// With `hide_room_existence`, an unknown room is indistinguishable from
    /// one the caller may not enter.
    pub fn from_error(err: &RoomError, hide_room_existence: bool) -> Self {
        match err {
            RoomError::Validation(_) => ErrorCode::Validation,
            RoomError::NotFound(_) if hide_room_existence => ErrorCode::AccessDenied,
            RoomError::NotFound(_) => ErrorCode::NotFound,
            RoomError::AccessDenied(_) => ErrorCode::AccessDenied,
            RoomError::AlreadyEnded(_) => ErrorCode::AlreadyEnded,
            RoomError::NotActive(_) => ErrorCode::NotActive,
            RoomError::InvalidToken => ErrorCode::InvalidToken,
            RoomError::RateExceeded(_) => ErrorCode::RateExceeded,
            RoomError::Busy(_) => ErrorCode::Busy,
            RoomError::Storage(_) => ErrorCode::StorageFailure,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(frame)
}

impl ClientFrame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A frame arrived that is not valid at this point of the session
    UnexpectedFrame(&'static str),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedFrame(what) => write!(f, "Unexpected frame: {what}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
