//! Read-cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for read-cache activity. All relaxed; they feed diagnostics,
/// never control flow.
#[derive(Default)]
pub struct ReadCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    insert_conflicts: AtomicU64,
    evicted: AtomicU64,
    evicted_invalid: AtomicU64,
    lock_transfers: AtomicU64,
}

impl ReadCacheStats {
    /// Fresh counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert_conflict(&self) {
        self.insert_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self, records: u64, invalid: u64, lock_transfers: u64) {
        self.evicted.fetch_add(records, Ordering::Relaxed);
        self.evicted_invalid.fetch_add(invalid, Ordering::Relaxed);
        self.lock_transfers
            .fetch_add(lock_transfers, Ordering::Relaxed);
    }

    /// Number of reads served from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of cache walks that fell through to the hybrid log.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of records copied into the cache.
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Inserts abandoned because a concurrent copy or splice won.
    pub fn insert_conflicts(&self) -> u64 {
        self.insert_conflicts.load(Ordering::Relaxed)
    }

    /// Records processed by eviction sweeps.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Lock words moved to the lock table by eviction sweeps.
    pub fn lock_transfers(&self) -> u64 {
        self.lock_transfers.load(Ordering::Relaxed)
    }

    /// Hit rate over all cache walks.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Snapshot all counters.
    pub fn summary(&self) -> ReadCacheStatsSummary {
        ReadCacheStatsSummary {
            hits: self.hits(),
            misses: self.misses(),
            hit_rate: self.hit_rate(),
            inserts: self.inserts(),
            insert_conflicts: self.insert_conflicts(),
            evicted: self.evicted(),
            evicted_invalid: self.evicted_invalid.load(Ordering::Relaxed),
            lock_transfers: self.lock_transfers(),
        }
    }
}

/// Point-in-time snapshot of [`ReadCacheStats`].
#[derive(Debug, Clone)]
pub struct ReadCacheStatsSummary {
    /// Reads served from the cache.
    pub hits: u64,
    /// Cache walks that fell through.
    pub misses: u64,
    /// Hit rate over all walks.
    pub hit_rate: f64,
    /// Records copied in.
    pub inserts: u64,
    /// Abandoned inserts.
    pub insert_conflicts: u64,
    /// Records processed by eviction.
    pub evicted: u64,
    /// Evicted records that were already invalid.
    pub evicted_invalid: u64,
    /// Lock words moved to the lock table.
    pub lock_transfers: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = ReadCacheStats::new();
        assert_eq!(stats.hit_rate(), 0.0);

        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_eviction_counters() {
        let stats = ReadCacheStats::new();
        stats.record_eviction(10, 3, 2);
        let summary = stats.summary();
        assert_eq!(summary.evicted, 10);
        assert_eq!(summary.evicted_invalid, 3);
        assert_eq!(summary.lock_transfers, 2);
    }
}
