//! In-memory tier: byte-bounded LRU of bitmap handles

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::handle::Handle;
use crate::key::CacheKey;
use crate::lru::LruCache;
use crate::stats::CacheStats;

/// Byte-bounded LRU of decoded bitmaps
///
/// The cache owns one handle per entry. Readers get their own clone and
/// evicted entries are closed before `put` returns.
pub struct MemoryCache {
    lru: Mutex<LruCache<CacheKey, Handle>>,
    stats: Arc<CacheStats>,
}

impl MemoryCache {
    /// Create a cache holding at most `max_bytes` of pixel allocations
    pub fn new(max_bytes: usize, stats: Arc<CacheStats>) -> Self {
        Self {
            lru: Mutex::new(LruCache::new(max_bytes.max(1))),
            stats,
        }
    }

    /// Get a new handle to the cached bitmap and mark it most recently used
    pub fn get(&self, key: &CacheKey) -> Option<Handle> {
        let mut lru = self.lru.lock();
        let cloned = lru.get(key).map(Handle::try_clone);
        match cloned {
            Some(Ok(handle)) => {
                self.stats.record_memory_hit();
                Some(handle)
            }
            Some(Err(_)) => {
                // Someone closed the cache's own reference
                warn!(key = %key, "dropping closed handle from memory cache");
                lru.remove(key);
                self.stats.record_memory_miss();
                None
            }
            None => {
                self.stats.record_memory_miss();
                None
            }
        }
    }

    /// Store a clone of `handle` under `key`
    ///
    /// Entries weigh their pixel allocation, which for a pooled buffer may
    /// exceed the pixels in use. Least recently used entries are evicted and
    /// closed until the byte bound holds, including the new entry.
    pub fn put(&self, key: CacheKey, handle: &Handle) -> Result<()> {
        let size = handle.get()?.allocation_size();
        let owned = handle.try_clone()?;

        let removed = self.lru.lock().put(key.clone(), owned, size);

        let evicted = removed.iter().filter(|(k, _)| *k != key).count() as u64;
        if evicted > 0 {
            debug!(key = %key, evicted, "memory cache evicted entries");
            self.stats.record_evictions(evicted);
        }
        for (_, old) in removed {
            old.close()?;
        }
        Ok(())
    }

    /// Remove and close the entry for `key`
    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = self.lru.lock().remove(key);
        match removed {
            Some(handle) => {
                let _ = handle.close();
                true
            }
            None => false,
        }
    }

    /// Check for `key` without touching the LRU order
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lru.lock().contains(key)
    }

    /// Close and remove every entry
    pub fn evict_all(&self) {
        let drained = self.lru.lock().drain();
        debug!(entries = drained.len(), "memory cache cleared");
        for (_, handle) in drained {
            let _ = handle.close();
        }
    }

    /// Bytes currently held
    pub fn size_bytes(&self) -> usize {
        self.lru.lock().weight()
    }

    /// Byte bound
    pub fn max_bytes(&self) -> usize {
        self.lru.lock().capacity()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<CacheKey> {
        self.lru.lock().keys()
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        self.evict_all();
    }
}
