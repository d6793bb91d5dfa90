//! ImageCache: memory tier, disk tier and buffer pool behind one façade

use std::sync::Arc;

use pixstore::Snapshot;
use tracing::{debug, info, warn};

use crate::bitmap::Bitmap;
use crate::config::CacheConfig;
use crate::disk::DiskCache;
use crate::error::Result;
use crate::handle::Handle;
use crate::key::CacheKey;
use crate::memory::MemoryCache;
use crate::pool::BufferPool;
use crate::stats::CacheStats;

/// Two-tier image cache
///
/// Decoded bitmaps live in a byte-bounded [`MemoryCache`]; their encodings
/// live in a [`DiskCache`]. Released bitmaps are parked in a [`BufferPool`]
/// when reuse is enabled.
pub struct ImageCache {
    config: CacheConfig,
    memory: Option<MemoryCache>,
    disk: DiskCache,
    pool: Option<Arc<BufferPool>>,
    stats: Arc<CacheStats>,
}

impl ImageCache {
    /// Build a cache from `config`
    ///
    /// The disk tier is opened here only if `init_disk_cache_on_create` is
    /// set; otherwise call [`ImageCache::init_disk_cache`] from a background
    /// thread. Disk lookups wait until that happens.
    ///
    /// # Returns
    /// * `Err(Error::Configuration)` if `config` does not validate
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(CacheStats::new());

        let memory = config
            .memory_cache_enabled
            .then(|| MemoryCache::new(config.memory_cache_bytes(), Arc::clone(&stats)));
        let disk = if config.disk_cache_enabled {
            DiskCache::new(
                &config.disk_cache_dir,
                config.disk_cache_size_bytes,
                config.app_version,
                Arc::clone(&stats),
            )
        } else {
            DiskCache::disabled(Arc::clone(&stats))
        };
        let pool = config.reuse_buffers.then(|| {
            Arc::new(
                BufferPool::new(config.reuse_pool_bytes as usize, config.reuse_match)
                    .with_stats(Arc::clone(&stats)),
            )
        });

        info!(
            memory_bytes = memory.as_ref().map_or(0, MemoryCache::max_bytes),
            disk_enabled = config.disk_cache_enabled,
            reuse = config.reuse_buffers,
            "image cache created"
        );

        let cache = Self {
            config,
            memory,
            disk,
            pool,
            stats,
        };
        if cache.config.init_disk_cache_on_create {
            cache.init_disk_cache();
        }
        Ok(cache)
    }

    /// Configuration in use
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Shared statistics
    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    /// Buffer pool for decoders, if reuse is enabled
    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_deref()
    }

    /// Memory tier, if enabled
    pub fn memory_cache(&self) -> Option<&MemoryCache> {
        self.memory.as_ref()
    }

    /// Disk tier
    pub fn disk_cache(&self) -> &DiskCache {
        &self.disk
    }

    /// Wrap a freshly decoded bitmap, returning it to the pool on release
    pub fn new_handle(&self, bitmap: Bitmap) -> Handle {
        match &self.pool {
            Some(pool) => Handle::with_release(bitmap, pool.release_fn()),
            None => Handle::new(bitmap),
        }
    }

    /// Open the disk tier, or reopen it after [`ImageCache::close`]; blocking I/O
    pub fn init_disk_cache(&self) {
        self.disk.reopen();
        self.disk.init();
    }

    /// Look up a decoded bitmap
    pub fn get_from_memory(&self, key: &CacheKey) -> Option<Handle> {
        self.memory.as_ref()?.get(key)
    }

    /// Look up an encoded image, waiting for disk initialization
    pub fn get_from_disk(&self, key: &CacheKey) -> Option<Snapshot> {
        self.disk.get(key)
    }

    /// Store a decoded bitmap in memory
    ///
    /// # Returns
    /// * `Err(Error::UseAfterClose)` if `handle` is closed
    pub fn add_to_memory(&self, key: &CacheKey, handle: &Handle) -> Result<()> {
        match &self.memory {
            Some(memory) => memory.put(key.clone(), handle),
            None => Ok(()),
        }
    }

    /// Encode and store a bitmap on disk unless the key is already there
    ///
    /// Failures are logged and leave the entry memory-only.
    pub fn add_to_disk(&self, key: &CacheKey, handle: &Handle) -> Result<()> {
        if !self.config.disk_cache_enabled {
            return Ok(());
        }
        let encoded = handle
            .get()?
            .encode(self.config.compress_format, self.config.compress_quality);
        match encoded {
            Ok(bytes) => {
                if let Err(e) = self.disk.put(key, &bytes) {
                    warn!(key = %key, error = %e, "disk cache write failed");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "encoding for disk cache failed"),
        }
        Ok(())
    }

    /// Store a bitmap in both tiers
    pub fn add_bitmap(&self, key: &CacheKey, handle: &Handle) -> Result<()> {
        self.add_to_memory(key, handle)?;
        self.add_to_disk(key, handle)
    }

    /// Remove a disk entry that no longer decodes
    pub(crate) fn discard_disk_entry(&self, key: &CacheKey) {
        if let Err(e) = self.disk.remove(key) {
            warn!(key = %key, error = %e, "removing disk cache entry failed");
        }
    }

    /// Close every memory entry; used under memory pressure
    pub fn clear_memory(&self) {
        if let Some(memory) = &self.memory {
            memory.evict_all();
        }
        if let Some(pool) = &self.pool {
            pool.clear();
        }
    }

    /// Empty both tiers; blocking I/O
    pub fn clear_cache(&self) -> Result<()> {
        self.clear_memory();
        self.disk.clear()?;
        debug!("image cache cleared");
        Ok(())
    }

    /// Flush the disk journal
    pub fn flush(&self) -> Result<()> {
        self.disk.flush()
    }

    /// Close the disk tier; memory entries stay usable
    pub fn close(&self) -> Result<()> {
        self.disk.close()?;
        debug!("disk cache closed");
        Ok(())
    }
}
