//! RocksDB-backed room store.
//!
//! Column families:
//! - `rooms`: room records (bincode), keyed by room code
//! - `chat` : chat messages (bincode), keyed by `code ∥ stamp`
//! - `board`: whiteboard records (bincode, LZ4 compressed), keyed by `code ∥ stamp`
//!
//! Stamps are written big-endian so RocksDB's byte order equals stamp order,
//! which turns history paging into a single reverse seek.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::{RoomStore, StoreError};
use crate::chat::ChatMessage;
use crate::room::{Room, RoomCode, Stamp};
use crate::whiteboard::BoardRecord;

const CF_ROOMS: &str = "rooms";
const CF_CHAT: &str = "chat";
const CF_BOARD: &str = "board";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_CHAT, CF_BOARD];

/// Length of a `code ∥ stamp` key.
const LOG_KEY_LEN: usize = 32;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true; chat is acknowledged only once durable)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tutor_live_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB-backed [`RoomStore`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode; room locks serialize writers)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Room store opened at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ROOMS => {
                // Small records, point lookups by code
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CHAT | CF_BOARD => {
                // Append-heavy, range-scanned per room
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// Build a log key: room code (16 bytes) + stamp (16 bytes big-endian).
    fn log_key(code: RoomCode, stamp: Stamp) -> Vec<u8> {
        let mut key = Vec::with_capacity(LOG_KEY_LEN);
        key.extend_from_slice(code.as_bytes());
        key.extend_from_slice(&stamp.to_be_bytes());
        key
    }

    fn belongs_to(key: &[u8], code: RoomCode) -> bool {
        key.len() == LOG_KEY_LEN && &key[..16] == code.as_bytes()
    }

    /// Newest stamp in one log column family for a room.
    fn last_stamp_in(&self, cf_name: &str, code: RoomCode) -> Result<Option<Stamp>, StoreError> {
        let cf = self.cf(cf_name)?;
        let seek = Self::log_key(code, Stamp::MAX);
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&seek, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if Self::belongs_to(&key, code) {
                    Ok(Stamp::from_be_bytes(&key[16..]))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

impl RoomStore for RocksStore {
    fn save_room(&self, room: &Room) -> Result<(), StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        self.db
            .put_cf_opt(&cf, room.code.as_bytes(), encode(room)?, &self.write_opts())?;
        Ok(())
    }

    fn load_room(&self, code: RoomCode) -> Result<Option<Room>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(&cf, code.as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn list_rooms(&self) -> Result<Vec<RoomCode>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut codes = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid room key".into()))?;
            codes.push(RoomCode::from_uuid(uuid::Uuid::from_bytes(bytes)));
        }
        Ok(codes)
    }

    fn append_chat(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let cf = self.cf(CF_CHAT)?;
        let key = Self::log_key(message.room, message.stamp);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, encode(message)?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn chat_before(
        &self,
        code: RoomCode,
        before: Stamp,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let cf = self.cf(CF_CHAT)?;
        let seek = Self::log_key(code, before);

        let mut messages = Vec::with_capacity(limit.min(256));
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&seek, Direction::Reverse));
        for item in iter {
            if messages.len() >= limit {
                break;
            }
            let (key, value) = item?;
            // The reverse seek lands on the cursor itself when it exists
            if key.as_ref() == seek.as_slice() {
                continue;
            }
            if !Self::belongs_to(&key, code) {
                break;
            }
            messages.push(decode(&value)?);
        }
        Ok(messages)
    }

    fn append_board(&self, code: RoomCode, record: &BoardRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_BOARD)?;
        let key = Self::log_key(code, record.stamp());
        let compressed = lz4_flex::compress_prepend_size(&encode(record)?);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, &compressed);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn load_board(&self, code: RoomCode) -> Result<Vec<BoardRecord>, StoreError> {
        let cf = self.cf(CF_BOARD)?;
        let start = Self::log_key(code, Stamp::ZERO);

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !Self::belongs_to(&key, code) {
                break;
            }
            let raw = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            records.push(decode(&raw)?);
        }
        Ok(records)
    }

    fn latest_stamp(&self, code: RoomCode) -> Result<Stamp, StoreError> {
        let chat = self.last_stamp_in(CF_CHAT, code)?;
        let board = self.last_stamp_in(CF_BOARD, code)?;
        Ok(chat.max(board).unwrap_or(Stamp::ZERO))
    }

    /// Flush memtables of every column family to disk.
    fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
