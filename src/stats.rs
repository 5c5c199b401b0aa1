//! Heap statistics.
//!
//! Atomic counters for allocation, transaction, cache, and collection
//! activity. Cheap to update from any thread; read with
//! [`HeapStats::snapshot`] for a consistent-enough view.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about heap activity.
#[derive(Debug)]
pub struct HeapStats {
    // =========================================================================
    // Allocation
    // =========================================================================
    /// Total regions allocated since open.
    pub regions_allocated: AtomicU64,
    /// Total bytes handed out since open.
    pub bytes_allocated: AtomicU64,
    /// Total regions freed since open.
    pub regions_freed: AtomicU64,

    // =========================================================================
    // Transactions
    // =========================================================================
    /// Transactions committed.
    pub txn_commits: AtomicU64,
    /// Transactions rolled back (error or panic in the body).
    pub txn_rollbacks: AtomicU64,
    /// Log slots resolved during crash recovery at open.
    pub txn_recovered: AtomicU64,

    // =========================================================================
    // Object cache
    // =========================================================================
    /// Cache lookups that found a live instance.
    pub cache_hits: AtomicU64,
    /// Cache lookups that constructed a new instance.
    pub cache_misses: AtomicU64,

    // =========================================================================
    // Cycle collection
    // =========================================================================
    /// Objects reclaimed by the cycle collector.
    pub cycles_collected: AtomicU64,
    /// Objects freed eagerly when their reference count hit zero.
    pub eager_frees: AtomicU64,
}

impl HeapStats {
    /// Create zeroed statistics.
    pub const fn new() -> Self {
        Self {
            regions_allocated: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            regions_freed: AtomicU64::new(0),
            txn_commits: AtomicU64::new(0),
            txn_rollbacks: AtomicU64::new(0),
            txn_recovered: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cycles_collected: AtomicU64::new(0),
            eager_frees: AtomicU64::new(0),
        }
    }

    /// Record a region allocation of `bytes`.
    #[inline]
    pub fn record_allocation(&self, bytes: u64) {
        self.regions_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a region free.
    #[inline]
    pub fn record_free(&self) {
        self.regions_freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            regions_allocated: self.regions_allocated.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            regions_freed: self.regions_freed.load(Ordering::Relaxed),
            txn_commits: self.txn_commits.load(Ordering::Relaxed),
            txn_rollbacks: self.txn_rollbacks.load(Ordering::Relaxed),
            txn_recovered: self.txn_recovered.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cycles_collected: self.cycles_collected.load(Ordering::Relaxed),
            eager_frees: self.eager_frees.load(Ordering::Relaxed),
        }
    }
}

impl Default for HeapStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain-value copy of [`HeapStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Total regions allocated since open.
    pub regions_allocated: u64,
    /// Total bytes handed out since open.
    pub bytes_allocated: u64,
    /// Total regions freed since open.
    pub regions_freed: u64,
    /// Transactions committed.
    pub txn_commits: u64,
    /// Transactions rolled back.
    pub txn_rollbacks: u64,
    /// Log slots resolved during crash recovery.
    pub txn_recovered: u64,
    /// Cache lookups that found a live instance.
    pub cache_hits: u64,
    /// Cache lookups that constructed a new instance.
    pub cache_misses: u64,
    /// Objects reclaimed by the cycle collector.
    pub cycles_collected: u64,
    /// Objects freed eagerly on refcount zero.
    pub eager_frees: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_allocation() {
        let stats = HeapStats::new();
        stats.record_allocation(128);
        stats.record_allocation(64);
        let snap = stats.snapshot();
        assert_eq!(snap.regions_allocated, 2);
        assert_eq!(snap.bytes_allocated, 192);
    }

    #[test]
    fn test_snapshot_is_copy() {
        let stats = HeapStats::new();
        stats.record_free();
        let a = stats.snapshot();
        stats.record_free();
        let b = stats.snapshot();
        assert_eq!(a.regions_freed, 1);
        assert_eq!(b.regions_freed, 2);
    }
}
