//! Domain errors returned by every room-scoped operation.

use thiserror::Error;

use crate::room::RoomCode;
use crate::storage::StoreError;

/// Failure of a room operation.
///
/// Every variant maps onto a distinct wire [`ErrorCode`](crate::protocol::ErrorCode).
#[derive(Error, Debug)]
pub enum RoomError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Room not found: {0}")]
    NotFound(RoomCode),

    #[error("Access denied to room {0}")]
    AccessDenied(RoomCode),

    #[error("Room {0} has already ended")]
    AlreadyEnded(RoomCode),

    #[error("Room {0} is not active")]
    NotActive(RoomCode),

    #[error("Invalid or unresolvable token")]
    InvalidToken,

    #[error("Rate limit exceeded for {0}")]
    RateExceeded(String),

    /// The room's serialization point could not be acquired in time. Retryable.
    #[error("Room {0} is busy")]
    Busy(RoomCode),

    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl RoomError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, RoomError::Busy(_) | RoomError::RateExceeded(_))
    }
}

pub type RoomResult<T> = Result<T, RoomError>;
