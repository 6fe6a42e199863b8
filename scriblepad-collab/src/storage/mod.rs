//! Durable per-room update logs.
//!
//! A [`LocalCache`] holds what a replica needs to reopen a room offline: a
//! compacted state plus the updates applied since. [`RocksCache`] is the
//! on-disk implementation; [`MemoryCache`] keeps everything in process.

pub mod rocks;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub use rocks::{DocumentStore, RoomMetadata, StoreConfig, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cache is closed")]
    Closed,
}

/// A room's replayable history, oldest first.
pub trait LocalCache: Send + Sync {
    /// Compacted state (if any) followed by the updates stored after it.
    fn load(&self, room: &str) -> Result<Vec<Vec<u8>>, CacheError>;

    fn store_update(&self, room: &str, update: &[u8]) -> Result<(), CacheError>;

    /// Replace everything stored for `room` with `state`.
    fn compact(&self, room: &str, state: &[u8]) -> Result<(), CacheError>;

    /// Updates stored since the last compaction.
    fn update_count(&self, room: &str) -> Result<u64, CacheError>;

    fn flush(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[derive(Default)]
struct RoomLog {
    state: Option<Vec<u8>>,
    updates: Vec<Vec<u8>>,
}

/// In-process cache. Contents are lost with the process.
#[derive(Default)]
pub struct MemoryCache {
    rooms: Mutex<HashMap<String, RoomLog>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalCache for MemoryCache {
    fn load(&self, room: &str) -> Result<Vec<Vec<u8>>, CacheError> {
        let rooms = self.rooms.lock();
        let Some(log) = rooms.get(room) else {
            return Ok(Vec::new());
        };
        Ok(log.state.iter().chain(log.updates.iter()).cloned().collect())
    }

    fn store_update(&self, room: &str, update: &[u8]) -> Result<(), CacheError> {
        self.rooms
            .lock()
            .entry(room.to_string())
            .or_default()
            .updates
            .push(update.to_vec());
        Ok(())
    }

    fn compact(&self, room: &str, state: &[u8]) -> Result<(), CacheError> {
        let mut rooms = self.rooms.lock();
        let log = rooms.entry(room.to_string()).or_default();
        log.state = Some(state.to_vec());
        log.updates.clear();
        Ok(())
    }

    fn update_count(&self, room: &str) -> Result<u64, CacheError> {
        Ok(self
            .rooms
            .lock()
            .get(room)
            .map_or(0, |log| log.updates.len() as u64))
    }
}

/// [`LocalCache`] over a RocksDB [`DocumentStore`].
pub struct RocksCache {
    store: Arc<DocumentStore>,
}

impl RocksCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let config = StoreConfig {
            path: path.as_ref().to_path_buf(),
            ..StoreConfig::default()
        };
        Ok(Self::from_store(Arc::new(DocumentStore::open(config)?)))
    }

    pub fn from_store(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }
}

impl LocalCache for RocksCache {
    fn load(&self, room: &str) -> Result<Vec<Vec<u8>>, CacheError> {
        let mut entries: Vec<Vec<u8>> = self.store.load_snapshot(room)?.into_iter().collect();
        entries.extend(
            self.store
                .load_updates(room)?
                .into_iter()
                .map(|(_, update)| update),
        );
        Ok(entries)
    }

    fn store_update(&self, room: &str, update: &[u8]) -> Result<(), CacheError> {
        self.store.append_update(room, update)?;
        Ok(())
    }

    fn compact(&self, room: &str, state: &[u8]) -> Result<(), CacheError> {
        self.store.compact(room, state)?;
        Ok(())
    }

    fn update_count(&self, room: &str) -> Result<u64, CacheError> {
        Ok(self.store.update_count(room)?)
    }

    fn flush(&self) -> Result<(), CacheError> {
        Ok(self.store.sync()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(cache: &dyn LocalCache) {
        assert!(cache.load("r").unwrap().is_empty());

        cache.store_update("r", b"u1").unwrap();
        cache.store_update("r", b"u2").unwrap();
        assert_eq!(cache.update_count("r").unwrap(), 2);
        assert_eq!(cache.load("r").unwrap(), vec![b"u1".to_vec(), b"u2".to_vec()]);

        cache.compact("r", b"state").unwrap();
        cache.store_update("r", b"u3").unwrap();
        assert_eq!(cache.update_count("r").unwrap(), 1);
        assert_eq!(cache.load("r").unwrap(), vec![b"state".to_vec(), b"u3".to_vec()]);

        assert!(cache.load("other").unwrap().is_empty());
        cache.flush().unwrap();
    }

    #[test]
    fn test_memory_cache() {
        exercise(&MemoryCache::new());
    }

    #[test]
    fn test_rocks_cache() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&RocksCache::open(dir.path().join("cache")).unwrap());
    }
}
