//! Operation counters with lock-free snapshots.
//!
//! Each shard owns a set of atomic counters updated as operations run;
//! [`Cache::stats`](crate::cache::Cache::stats) sums the per-shard
//! snapshots. All counters use `Ordering::Relaxed`: they are monotonic
//! totals, not a consistent cut across shards.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of cache operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Successful lookups and references.
    pub hits: u64,
    /// Failed lookups and references.
    pub misses: u64,
    /// Insertions and merges of new keys.
    pub inserts: u64,
    /// Replacements and merges of existing keys.
    pub updates: u64,
    /// Explicit removals that found an entry.
    pub removes: u64,
    /// Entries destroyed by capacity pressure or pruning.
    pub evictions: u64,
}

impl CacheStats {
    pub(crate) fn accumulate(&mut self, other: CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.inserts += other.inserts;
        self.updates += other.updates;
        self.removes += other.removes;
        self.evictions += other.evictions;
    }
}

/// Per-shard atomic counters.
#[derive(Debug, Default)]
pub(crate) struct ShardCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    removes: AtomicU64,
    evictions: AtomicU64,
}

impl ShardCounters {
    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn inc_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_evictions(&self, count: u64) {
        if count > 0 {
            self.evictions.fetch_add(count, Ordering::Relaxed);
        }
    }
}
