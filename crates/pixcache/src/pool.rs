//! Pool of released bitmaps whose allocations can back future decodes

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::bitmap::{required_bytes, Bitmap, PixelFormat};
use crate::handle::ReleaseFn;
use crate::stats::CacheStats;

/// When a pooled buffer is considered compatible with a decode request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReuseMatch {
    /// Same width, height and pixel format
    Exact,
    /// Allocation large enough for the requested pixels
    #[default]
    Capacity,
}

struct PoolState {
    buffers: VecDeque<Bitmap>,
    bytes: usize,
}

/// Softly held buffers available for reuse
///
/// The pool keeps at most `max_bytes` of allocations and drops the oldest
/// ones beyond that, so parking a buffer here never pins memory the way a
/// cache entry does. Handles reach the pool through a weak reference and
/// never keep it alive.
pub struct BufferPool {
    state: Mutex<PoolState>,
    max_bytes: usize,
    reuse_match: ReuseMatch,
    stats: Option<Arc<CacheStats>>,
}

impl BufferPool {
    /// Create a pool bounded to `max_bytes` of parked allocations
    pub fn new(max_bytes: usize, reuse_match: ReuseMatch) -> Self {
        Self {
            state: Mutex::new(PoolState {
                buffers: VecDeque::new(),
                bytes: 0,
            }),
            max_bytes,
            reuse_match,
            stats: None,
        }
    }

    /// Count reuses in `stats`
    pub fn with_stats(mut self, stats: Arc<CacheStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Park a released bitmap for reuse
    ///
    /// Immutable bitmaps and ones larger than the pool are dropped.
    pub fn offer(&self, bitmap: Bitmap) {
        let size = bitmap.allocation_size();
        if !bitmap.is_mutable() || size == 0 || size > self.max_bytes {
            return;
        }

        let mut state = self.state.lock();
        state.bytes += size;
        state.buffers.push_back(bitmap);
        while state.bytes > self.max_bytes {
            match state.buffers.pop_front() {
                Some(old) => state.bytes -= old.allocation_size(),
                None => break,
            }
        }
    }

    /// Take a parked bitmap able to hold `width` x `height` pixels of `format`
    ///
    /// Buffers that became unusable are pruned during the scan. The scan
    /// and removal happen under one lock so a buffer is handed out once.
    pub fn acquire_compatible(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Option<Bitmap> {
        let needed = required_bytes(width, height, format);
        let mut state = self.state.lock();

        let mut i = 0;
        while i < state.buffers.len() {
            let candidate = &state.buffers[i];
            if !candidate.is_mutable() {
                if let Some(stale) = state.buffers.remove(i) {
                    state.bytes -= stale.allocation_size();
                }
                continue;
            }
            let fits = match self.reuse_match {
                ReuseMatch::Exact => {
                    candidate.width() == width
                        && candidate.height() == height
                        && candidate.format() == format
                }
                ReuseMatch::Capacity => candidate.allocation_size() >= needed,
            };
            if fits {
                let found = state.buffers.remove(i)?;
                state.bytes -= found.allocation_size();
                trace!(width, height, "reusing pooled buffer");
                if let Some(stats) = &self.stats {
                    stats.record_reuse();
                }
                return Some(found);
            }
            i += 1;
        }
        None
    }

    /// Release callback that parks bitmaps in this pool while it is alive
    pub fn release_fn(self: &Arc<Self>) -> ReleaseFn {
        let pool: Weak<BufferPool> = Arc::downgrade(self);
        Arc::new(move |bitmap| {
            if let Some(pool) = pool.upgrade() {
                pool.offer(bitmap);
            }
        })
    }

    /// Number of parked buffers
    pub fn len(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by parked buffers
    pub fn bytes(&self) -> usize {
        self.state.lock().bytes
    }

    /// Drop every parked buffer
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.buffers.clear();
        state.bytes = 0;
    }
}
