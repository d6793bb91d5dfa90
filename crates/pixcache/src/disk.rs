//! On-disk tier: encoded images in a [`DiskLru`] keyed by key hash
//!
//! The store is opened lazily by [`DiskCache::init`], which does blocking
//! I/O and belongs on a background thread. Lookups that arrive before
//! initialization finishes wait for it instead of failing.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use pixstore::{DiskLru, Snapshot};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::key::CacheKey;
use crate::stats::CacheStats;

enum DiskState {
    /// Initialization has not completed; readers wait
    Pending,
    Ready(Arc<DiskLru>),
    /// Disabled, failed to open, or closed; readers skip the tier
    Unavailable,
}

/// Disk tier with an initialization barrier
pub struct DiskCache {
    state: Mutex<DiskState>,
    ready: Condvar,
    dir: PathBuf,
    max_bytes: u64,
    app_version: u32,
    stats: Arc<CacheStats>,
}

impl DiskCache {
    /// Create a disk tier that will live in `dir` once [`DiskCache::init`] runs
    pub fn new<P: AsRef<Path>>(
        dir: P,
        max_bytes: u64,
        app_version: u32,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            state: Mutex::new(DiskState::Pending),
            ready: Condvar::new(),
            dir: dir.as_ref().to_path_buf(),
            max_bytes,
            app_version,
            stats,
        }
    }

    /// Create a tier that never stores anything
    pub fn disabled(stats: Arc<CacheStats>) -> Self {
        Self {
            state: Mutex::new(DiskState::Unavailable),
            ready: Condvar::new(),
            dir: PathBuf::new(),
            max_bytes: 0,
            app_version: 0,
            stats,
        }
    }

    /// Open the store, releasing every waiting reader
    ///
    /// Blocking. Does nothing if the store is already open or the tier is
    /// disabled. A failure to open leaves the tier unavailable.
    pub fn init(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, DiskState::Pending) {
            return;
        }
        *state = match DiskLru::open(&self.dir, self.app_version, self.max_bytes) {
            Ok(store) => {
                info!(dir = %self.dir.display(), max_bytes = self.max_bytes, "disk cache initialized");
                DiskState::Ready(Arc::new(store))
            }
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "disk cache unavailable");
                DiskState::Unavailable
            }
        };
        self.ready.notify_all();
    }

    /// Check if initialization has completed, successfully or not
    pub fn is_initialized(&self) -> bool {
        !matches!(*self.state.lock(), DiskState::Pending)
    }

    /// The open store, waiting for initialization if it is still pending
    fn store(&self) -> Option<Arc<DiskLru>> {
        let mut state = self.state.lock();
        while matches!(*state, DiskState::Pending) {
            self.ready.wait(&mut state);
        }
        match &*state {
            DiskState::Ready(store) => Some(Arc::clone(store)),
            _ => None,
        }
    }

    /// Read the encoded image stored for `key`
    pub fn get(&self, key: &CacheKey) -> Option<Snapshot> {
        let store = self.store()?;
        match store.get(&key.disk_id()) {
            Ok(Some(snapshot)) => {
                debug!(key = %key, bytes = snapshot.len(), "disk cache hit");
                self.stats.record_disk_hit();
                Some(snapshot)
            }
            Ok(None) => {
                self.stats.record_disk_miss();
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "disk cache read failed");
                self.stats.record_disk_miss();
                None
            }
        }
    }

    /// Store `bytes` for `key` unless an entry already exists
    pub fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<()> {
        let Some(store) = self.store() else {
            return Ok(());
        };
        let id = key.disk_id();
        if store.get(&id)?.is_some() {
            return Ok(());
        }
        // Another writer holds the entry; its value wins
        if let Some(mut editor) = store.edit(&id)? {
            editor.write_all(bytes)?;
            editor.commit()?;
            debug!(key = %key, bytes = bytes.len(), "disk cache stored");
        }
        Ok(())
    }

    /// Remove the entry for `key`
    pub fn remove(&self, key: &CacheKey) -> Result<bool> {
        match self.store() {
            Some(store) => Ok(store.remove(&key.disk_id())?),
            None => Ok(false),
        }
    }

    /// Delete every entry and reopen an empty store
    pub fn clear(&self) -> Result<()> {
        let previous = {
            let mut state = self.state.lock();
            if matches!(*state, DiskState::Unavailable) && self.dir.as_os_str().is_empty() {
                return Ok(());
            }
            std::mem::replace(&mut *state, DiskState::Pending)
        };
        let result = match previous {
            DiskState::Ready(store) => store.delete().map_err(Into::into),
            _ => Ok(()),
        };
        self.init();
        result
    }

    /// Flush the journal
    pub fn flush(&self) -> Result<()> {
        if let DiskState::Ready(store) = &*self.state.lock() {
            store.flush()?;
        }
        Ok(())
    }

    /// Close the store; the tier stays unavailable until [`DiskCache::reopen`]
    pub fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock(), DiskState::Unavailable);
        self.ready.notify_all();
        if let DiskState::Ready(store) = previous {
            store.close()?;
        }
        Ok(())
    }

    /// Make a closed tier pending again so the next [`DiskCache::init`] reopens it
    pub fn reopen(&self) {
        let mut state = self.state.lock();
        if matches!(*state, DiskState::Unavailable) && !self.dir.as_os_str().is_empty() {
            *state = DiskState::Pending;
        }
    }

    /// Bytes stored, 0 if unavailable
    pub fn size_bytes(&self) -> u64 {
        match &*self.state.lock() {
            DiskState::Ready(store) => store.size(),
            _ => 0,
        }
    }

    /// Directory of the store
    pub fn directory(&self) -> &Path {
        &self.dir
    }
}
