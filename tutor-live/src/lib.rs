//! # tutor-live: real-time tutoring rooms
//!
//! One tutor and one student meet in a room: they chat, draw on a shared
//! whiteboard and see each other come and go. Everything durable goes to
//! storage before it is broadcast.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ RoomClient  │ ◄─────────────────► │  Gateway    │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                     ┌──────────────┬───────┴──────┬───────────────┐
//!                     ▼              ▼              ▼               ▼
//!               RoomRegistry      ChatLog     WhiteboardSync   RateLimiter
//!               (lock per room)      │              │
//!                     │              └──────┬───────┘
//!                     ▼                     ▼
//!                    Hub               RoomStore (RocksDB / memory)
//!               (fan-out, unicast)
//! ```
//!
//! ## Modules
//!
//! - [`room`]: room records, lifecycle transitions and ordering stamps
//! - [`registry`]: room lifecycle, authorization and per-room serialization
//! - [`chat`]: durable chat with stamp-cursor history
//! - [`whiteboard`]: stroke log with tombstone visibility
//! - [`broadcast`]: per-room fan-out and per-user unicast
//! - [`protocol`]: binary wire protocol (bincode-encoded frames)
//! - [`gateway`]: WebSocket server
//! - [`client`]: WebSocket client
//! - [`storage`]: RocksDB and in-memory stores
//! - [`identity`]: bearer token verification
//! - [`ratelimit`]: fixed-window limiter
//! - [`config`]: environment-driven configuration

pub mod broadcast;
pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod room;
pub mod storage;
pub mod whiteboard;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Hub, RoomManager};
pub use chat::{ChatLimits, ChatLog, ChatMessage, ChatPage};
pub use client::{ClientError, ClientEvent, RoomClient, Subscription};
pub use config::{ConfigError, ServerConfig};
pub use error::{RoomError, RoomResult};
pub use gateway::{Gateway, ServerStats};
pub use identity::{IdentityError, IdentityProvider, JwtIdentity, StaticIdentity};
pub use protocol::{ClientFrame, ErrorCode, Notice, Op, ProtocolError, Reply, RoomEvent, ServerFrame};
pub use ratelimit::RateLimiter;
pub use registry::{RegistryConfig, RoomGuard, RoomRegistry, RoomStats};
pub use room::{Principal, Role, Room, RoomCode, RoomStatus, Stamp, StampClock, UserId};
pub use storage::{MemoryStore, RetryPolicy, RocksStore, RoomStore, StoreConfig, StoreError};
pub use whiteboard::{Board, BoardRecord, Stroke, StrokeAck, WhiteboardSync};
