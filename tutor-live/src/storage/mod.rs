//! Persistent storage for rooms, chat messages and whiteboard records.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  save/load room   ┌────────────────────────────────┐
//! │ RoomRegistry │ ────────────────► │ RoomStore (trait)              │
//! └──────────────┘                   │  ├─ RocksStore  (RocksDB)      │
//! ┌──────────────┐  append/page      │  └─ MemoryStore (tests, dev)   │
//! │ ChatLog      │ ────────────────► │                                │
//! └──────────────┘                   │ CF "rooms": room records      │
//! ┌──────────────┐  append/replay    │ CF "chat" : code ∥ stamp keys │
//! │ Whiteboard   │ ────────────────► │ CF "board": code ∥ stamp keys │
//! └──────────────┘                   └────────────────────────────────┘
//! ```
//!
//! Writes happen before anything is broadcast. Transient failures are
//! retried by [`RetryPolicy`]; anything else surfaces as a storage error.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use std::time::Duration;

use crate::chat::ChatMessage;
use crate::room::{Room, RoomCode, Stamp};
use crate::whiteboard::BoardRecord;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// I/O error
    IoError(String),
    /// Backend temporarily unable to serve the request
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same write may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::DatabaseError(_) | StoreError::IoError(_) | StoreError::Unavailable(_)
        )
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable backing store for the room subsystem.
///
/// Implementations are synchronous; callers run them under a room lock.
pub trait RoomStore: Send + Sync {
    /// Insert or overwrite a room record.
    fn save_room(&self, room: &Room) -> Result<(), StoreError>;

    fn load_room(&self, code: RoomCode) -> Result<Option<Room>, StoreError>;

    fn list_rooms(&self) -> Result<Vec<RoomCode>, StoreError>;

    fn append_chat(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// Up to `limit` messages with a stamp strictly below `before`, newest first.
    fn chat_before(
        &self,
        code: RoomCode,
        before: Stamp,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    fn append_board(&self, code: RoomCode, record: &BoardRecord) -> Result<(), StoreError>;

    /// Every whiteboard record of a room in stamp order.
    fn load_board(&self, code: RoomCode) -> Result<Vec<BoardRecord>, StoreError>;

    /// Newest stamp recorded for the room across chat and board, or `Stamp::ZERO`.
    fn latest_stamp(&self, code: RoomCode) -> Result<Stamp, StoreError>;

    /// Push buffered writes to durable media. Called on shutdown.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Bounded retry for store writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1)
    pub attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    log::warn!("{what} failed (attempt {attempt}/{attempts}): {e}");
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::error!("{what} failed after {attempt} attempt(s): {e}");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::default();
        let result = policy
            .run("flaky write", || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(StoreError::Unavailable("busy".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_attempts() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(10),
        };
        let result: Result<(), _> = policy
            .run("dead write", || {
                calls.set(calls.get() + 1);
                Err(StoreError::IoError("eio".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("bad encode", || {
                calls.set(calls.get() + 1);
                Err(StoreError::SerializationError("nope".into()))
            })
            .await;
        assert_eq!(result, Err(StoreError::SerializationError("nope".into())));
        assert_eq!(calls.get(), 1);
    }
}
