//! Cache and loader statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for cache tiers and load outcomes
#[derive(Debug, Default)]
pub struct CacheStats {
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    disk_hits: AtomicU64,
    disk_misses: AtomicU64,
    evictions: AtomicU64,
    decodes: AtomicU64,
    decode_failures: AtomicU64,
    delivered: AtomicU64,
    suppressed: AtomicU64,
    failed: AtomicU64,
    reuses: AtomicU64,
}

impl CacheStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a memory cache hit
    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a memory cache miss
    pub fn record_memory_miss(&self) {
        self.memory_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a disk cache hit
    pub fn record_disk_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a disk cache miss
    pub fn record_disk_miss(&self) {
        self.disk_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record memory cache evictions
    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a decode from the source
    pub fn record_decode(&self) {
        self.decodes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decode that produced no image
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a result handed to its target
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a result withheld from its target
    pub fn record_suppressed(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed load reported to its target
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decode backed by a pooled buffer
    pub fn record_reuse(&self) {
        self.reuses.fetch_add(1, Ordering::Relaxed);
    }

    /// Get memory cache hits
    pub fn memory_hits(&self) -> u64 {
        self.memory_hits.load(Ordering::Relaxed)
    }

    /// Get memory cache misses
    pub fn memory_misses(&self) -> u64 {
        self.memory_misses.load(Ordering::Relaxed)
    }

    /// Get disk cache hits
    pub fn disk_hits(&self) -> u64 {
        self.disk_hits.load(Ordering::Relaxed)
    }

    /// Get disk cache misses
    pub fn disk_misses(&self) -> u64 {
        self.disk_misses.load(Ordering::Relaxed)
    }

    /// Get memory cache evictions
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get decodes from the source
    pub fn decodes(&self) -> u64 {
        self.decodes.load(Ordering::Relaxed)
    }

    /// Get failed decodes
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    /// Get images handed to their targets
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Get withheld results
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Get failed loads reported to their targets
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Get pooled buffer reuses
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Calculate memory hit ratio (0.0 to 1.0)
    pub fn memory_hit_ratio(&self) -> f64 {
        let hits = self.memory_hits();
        let total = hits + self.memory_misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        for counter in [
            &self.memory_hits,
            &self.memory_misses,
            &self.disk_hits,
            &self.disk_misses,
            &self.evictions,
            &self.decodes,
            &self.decode_failures,
            &self.delivered,
            &self.suppressed,
            &self.failed,
            &self.reuses,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_basic() {
        let stats = CacheStats::new();

        stats.record_memory_hit();
        stats.record_memory_hit();
        stats.record_memory_miss();
        stats.record_evictions(3);

        assert_eq!(stats.memory_hits(), 2);
        assert_eq!(stats.memory_misses(), 1);
        assert_eq!(stats.evictions(), 3);
        assert_eq!(stats.memory_hit_ratio(), 2.0 / 3.0);
    }

    #[test]
    fn test_stats_reset() {
        let stats = CacheStats::new();

        stats.record_memory_hit();
        stats.record_disk_miss();
        stats.record_suppressed();
        stats.reset();

        assert_eq!(stats.memory_hits(), 0);
        assert_eq!(stats.disk_misses(), 0);
        assert_eq!(stats.suppressed(), 0);
        assert_eq!(stats.memory_hit_ratio(), 0.0);
    }
}
