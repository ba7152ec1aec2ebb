//! Room chat: stamped, durable, paged newest-first.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{RoomError, RoomResult};
use crate::protocol::RoomEvent;
use crate::registry::RoomRegistry;
use crate::room::{ConnId, Principal, RoomCode, Stamp, UserId};

/// An immutable chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub room: RoomCode,
    pub sender_id: UserId,
    pub sender_name: String,
    pub body: String,
    pub stamp: Stamp,
}

/// One page of history, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPage {
    pub messages: Vec<ChatMessage>,
    /// Pass back as the cursor for the next (older) page; `None` when exhausted
    pub next_cursor: Option<Stamp>,
}

/// Chat limits.
#[derive(Debug, Clone, Copy)]
pub struct ChatLimits {
    /// Largest accepted body in bytes
    pub max_body: usize,
    /// Page size used when a request asks for zero
    pub default_page: usize,
    /// Upper clamp on requested page sizes
    pub max_page: usize,
}

impl Default for ChatLimits {
    fn default() -> Self {
        Self {
            max_body: 4096,
            default_page: 50,
            max_page: 200,
        }
    }
}

pub struct ChatLog {
    registry: Arc<RoomRegistry>,
    limits: ChatLimits,
}

impl ChatLog {
    pub fn new(registry: Arc<RoomRegistry>, limits: ChatLimits) -> Self {
        Self { registry, limits }
    }

    pub fn limits(&self) -> ChatLimits {
        self.limits
    }

    /// Stamp, persist and broadcast a message from a room member.
    ///
    /// The message is durable before anyone else sees it.
    pub async fn append(
        &self,
        code: RoomCode,
        principal: &Principal,
        body: String,
        origin: Option<ConnId>,
    ) -> RoomResult<ChatMessage> {
        let mut guard = self.registry.lock_active(code, principal).await?;
        if body.trim().is_empty() {
            return Err(RoomError::Validation("message body is empty".into()));
        }
        if body.len() > self.limits.max_body {
            return Err(RoomError::Validation(format!(
                "message body exceeds {} bytes",
                self.limits.max_body
            )));
        }

        let message = ChatMessage {
            room: code,
            sender_id: principal.user_id,
            sender_name: principal.display_name.clone(),
            body,
            stamp: guard.next_stamp(),
        };

        let store = self.registry.store();
        self.registry
            .retry()
            .run("append chat", || store.append_chat(&message))
            .await?;

        guard.broadcast(RoomEvent::Chat(message.clone()), origin).await;
        Ok(message)
    }

    /// Messages strictly older than `cursor`, newest first.
    ///
    /// Cursors are stamps, so concurrent appends never shift a page.
    pub async fn history(
        &self,
        code: RoomCode,
        cursor: Option<Stamp>,
        page_size: usize,
    ) -> RoomResult<ChatPage> {
        let limit = match page_size {
            0 => self.limits.default_page,
            n => n.min(self.limits.max_page),
        };
        let before = cursor.unwrap_or(Stamp::MAX);

        let store = self.registry.store();
        let messages = self
            .registry
            .retry()
            .run("load chat history", || store.chat_before(code, before, limit))
            .await?;

        let next_cursor = if messages.len() == limit {
            messages.last().map(|m| m.stamp)
        } else {
            None
        };
        Ok(ChatPage {
            messages,
            next_cursor,
        })
    }
}
