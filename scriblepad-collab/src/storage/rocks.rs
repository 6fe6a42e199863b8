//! RocksDB-backed room store.
//!
//! Column families:
//! - `documents` — full yrs state per room (LZ4 compressed)
//! - `updates`   — incremental updates, keyed `<room>/<seq:8 bytes BE>` (LZ4 compressed)
//! - `metadata`  — per-room bookkeeping (bincode)
//!
//! The same store backs the relay's room persistence and the client-side
//! durable cache. A room's state is its snapshot followed by its updates in
//! sequence order; compaction folds the updates into a new snapshot in one
//! write batch.

use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_UPDATES, CF_METADATA];

/// Separates the room from the sequence number in update keys. Room ids
/// never contain it.
const KEY_SEPARATOR: u8 = b'/';

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scriblepad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-chosen directory.
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

/// Per-room bookkeeping stored alongside the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room: String,
    /// Sequence number the next update will get
    pub next_sequence: u64,
    /// Updates stored since the last compaction
    pub update_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room: &str) -> Self {
        let now = now_secs();
        Self {
            room: room.to_string(),
            next_sequence: 0,
            update_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Room not found
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    /// LZ4 frame could not be decoded
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(room) => write!(f, "Room not found: {room}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed room store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serialises metadata read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);
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
        log::info!("Opened room store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
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
            CF_DOCUMENTS | CF_METADATA => {
                // Point lookups by room
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                // Many small writes, range-scanned per room
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Store a full room state, leaving the update log untouched.
    pub fn save_snapshot(&self, room: &str, snapshot: &[u8]) -> Result<RoomMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let _guard = self.write_lock.lock();

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let mut meta = self.metadata_or_new(room)?;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, room.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, room.as_bytes(), &meta.encode()?);
        self.write(batch)?;

        Ok(meta)
    }

    pub fn load_snapshot(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, room.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn room_exists(&self, room: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, room.as_bytes())?.is_some())
    }

    // ─── Updates ──────────────────────────────────────────────────────

    /// Append an update to the room's log. Returns its sequence number.
    pub fn append_update(&self, room: &str, update: &[u8]) -> Result<u64, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let _guard = self.write_lock.lock();

        let mut meta = self.metadata_or_new(room)?;
        let sequence = meta.next_sequence;
        meta.next_sequence += 1;
        meta.update_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_updates,
            update_key(room, sequence),
            lz4_flex::compress_prepend_size(update),
        );
        batch.put_cf(&cf_meta, room.as_bytes(), &meta.encode()?);
        self.write(batch)?;

        Ok(sequence)
    }

    /// The room's updates in sequence order.
    pub fn load_updates(&self, room: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = update_prefix(room);

        let mut updates = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            let Some(sequence) = sequence_from_key(&key, &prefix) else {
                break;
            };
            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            updates.push((sequence, update));
        }

        Ok(updates)
    }

    pub fn update_count(&self, room: &str) -> Result<u64, StoreError> {
        match self.load_metadata(room) {
            Ok(meta) => Ok(meta.update_count),
            Err(StoreError::NotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Replace snapshot and update log with `state`, atomically. Returns the
    /// number of updates folded in.
    pub fn compact(&self, room: &str, state: &[u8]) -> Result<u64, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let _guard = self.write_lock.lock();

        let mut batch = WriteBatch::default();
        let removed = self.delete_updates_into(&mut batch, room)?;

        let compressed = lz4_flex::compress_prepend_size(state);
        let mut meta = self.metadata_or_new(room)?;
        meta.update_count = 0;
        meta.snapshot_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        batch.put_cf(&cf_docs, room.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, room.as_bytes(), &meta.encode()?);
        self.write(batch)?;

        log::debug!("Compacted {removed} updates for room {room}");
        Ok(removed)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, room: &str) -> Result<RoomMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room.as_bytes())? {
            Some(bytes) => RoomMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(room.to_string())),
        }
    }

    /// Every room with stored data.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            rooms.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(rooms)
    }

    /// Delete a room's snapshot, updates and metadata.
    pub fn delete_room(&self, room: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let _guard = self.write_lock.lock();

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, room.as_bytes());
        batch.delete_cf(&cf_meta, room.as_bytes());
        self.delete_updates_into(&mut batch, room)?;
        self.write(batch)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
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

    fn metadata_or_new(&self, room: &str) -> Result<RoomMetadata, StoreError> {
        match self.load_metadata(room) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(RoomMetadata::new(room)),
            Err(e) => Err(e),
        }
    }

    fn delete_updates_into(&self, batch: &mut WriteBatch, room: &str) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = update_prefix(room);
        let mut count = 0u64;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if sequence_from_key(&key, &prefix).is_none() {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }
        Ok(count)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

fn update_prefix(room: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(room.len() + 1);
    prefix.extend_from_slice(room.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

/// Key: room bytes, separator, sequence (8 bytes big-endian).
fn update_key(room: &str, sequence: u64) -> Vec<u8> {
    let mut key = update_prefix(room);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// `None` once the iterator has left the room's key range.
fn sequence_from_key(key: &[u8], prefix: &[u8]) -> Option<u64> {
    let rest = key.strip_prefix(prefix)?;
    let bytes: [u8; 8] = rest.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
