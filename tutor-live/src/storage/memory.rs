//! In-memory [`RoomStore`] used by tests and the storage-less server mode.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{RoomStore, StoreError};
use crate::chat::ChatMessage;
use crate::room::{Room, RoomCode, Stamp};
use crate::whiteboard::BoardRecord;

#[derive(Default)]
struct Tables {
    rooms: HashMap<RoomCode, Room>,
    chat: BTreeMap<(RoomCode, Stamp), ChatMessage>,
    board: BTreeMap<(RoomCode, Stamp), BoardRecord>,
}

/// Volatile store keyed the same way as the RocksDB column families.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    pub fn chat_len(&self, code: RoomCode) -> usize {
        self.tables()
            .map(|t| t.chat.range((code, Stamp::ZERO)..=(code, Stamp::MAX)).count())
            .unwrap_or(0)
    }
}

impl RoomStore for MemoryStore {
    fn save_room(&self, room: &Room) -> Result<(), StoreError> {
        self.tables()?.rooms.insert(room.code, room.clone());
        Ok(())
    }

    fn load_room(&self, code: RoomCode) -> Result<Option<Room>, StoreError> {
        Ok(self.tables()?.rooms.get(&code).cloned())
    }

    fn list_rooms(&self) -> Result<Vec<RoomCode>, StoreError> {
        Ok(self.tables()?.rooms.keys().copied().collect())
    }

    fn append_chat(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.tables()?
            .chat
            .insert((message.room, message.stamp), message.clone());
        Ok(())
    }

    fn chat_before(
        &self,
        code: RoomCode,
        before: Stamp,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .chat
            .range((code, Stamp::ZERO)..(code, before))
            .rev()
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    fn append_board(&self, code: RoomCode, record: &BoardRecord) -> Result<(), StoreError> {
        self.tables()?
            .board
            .insert((code, record.stamp()), record.clone());
        Ok(())
    }

    fn load_board(&self, code: RoomCode) -> Result<Vec<BoardRecord>, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .board
            .range((code, Stamp::ZERO)..=(code, Stamp::MAX))
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn latest_stamp(&self, code: RoomCode) -> Result<Stamp, StoreError> {
        let tables = self.tables()?;
        let range = (code, Stamp::ZERO)..=(code, Stamp::MAX);
        let chat = tables.chat.range(range.clone()).next_back().map(|((_, s), _)| *s);
        let board = tables.board.range(range).next_back().map(|((_, s), _)| *s);
        Ok(chat.max(board).unwrap_or(Stamp::ZERO))
    }
}
