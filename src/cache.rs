//! Sharded cache: dispatch by key hash, aggregate commands, namespaces.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            Cache                                     │
//! │                                                                      │
//! │   key ──► hash_bytes ──► hash >> (32 - shard_bits) ──► shard index   │
//! │                                                                      │
//! │   ┌─────────┬─────────┬─────────┬─────────┐                          │
//! │   │ Shard 0 │ Shard 1 │ Shard 2 │ Shard 3 │   one mutex each        │
//! │   └─────────┴─────────┴─────────┴─────────┘                          │
//! │                                                                      │
//! │   registry: Mutex<{namespace tags}>                                  │
//! │   also serializes prune / set_capacity / apply_to_all                │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Dispatch uses the *high* bits of the 32-bit key digest so the table
//! distribution inside each shard stays orthogonal to shard selection.
//! Operations on distinct shards run in parallel; aggregate commands take
//! the cache-level mutex first and then visit shards one at a time, so
//! they serialize against each other without stopping the world.
//!
//! The cache-level mutex is always acquired before any shard mutex and
//! shard mutexes are never held in pairs, so there is no lock cycle.
//!
//! All key-scoped traffic flows through a [`Namespace`] handle, obtained
//! from [`Cache::default_handle`] or [`Cache::open_namespace`]. Handles
//! share the cache's shards; they differ only in the tag they prepend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::merge::Value;
use crate::namespace::{Namespace, Tag, TAG_LEN};
use crate::shard::Shard;
use crate::stats::CacheStats;

/// Shared state behind every [`Cache`] and [`Namespace`] clone.
pub(crate) struct CacheShared {
    shards: Box<[Shard]>,
    shard_bits: u32,
    capacity: AtomicU64,
    /// Namespace tags seen so far. Doubles as the serialization point for
    /// reconfiguration and traversal commands.
    registry: Mutex<FxHashSet<Tag>>,
}

impl CacheShared {
    pub(crate) fn shard_for(&self, hash: u32) -> &Shard {
        let index = if self.shard_bits > 0 {
            (hash >> (32 - self.shard_bits)) as usize
        } else {
            0
        };
        &self.shards[index]
    }

    pub(crate) fn prune(&self) {
        let _serial = self.registry.lock();
        for shard in self.shards.iter() {
            shard.prune();
        }
    }

    pub(crate) fn set_capacity(&self, total: u64) {
        let _serial = self.registry.lock();
        self.capacity.store(total, Ordering::Relaxed);
        let per_shard = total.div_ceil(self.shards.len() as u64);
        for shard in self.shards.iter() {
            shard.set_capacity(per_shard);
        }
    }

    pub(crate) fn apply_to_all(&self, op: &mut dyn FnMut(&[u8], &Value, u64)) {
        let _serial = self.registry.lock();
        for shard in self.shards.iter() {
            shard.apply_to_all(op);
        }
    }

    /// Snapshot sum of per-shard usage. Not a consistent cut: each shard
    /// is read under its own lock, one after another.
    pub(crate) fn total_charge(&self) -> u64 {
        self.shards.iter().map(|shard| shard.total_charge()).sum()
    }
}

/// Sharded, namespaced LRU cache with charge-based capacity accounting.
///
/// A `Cache` is a cheap clone of a shared shard array; pass it by value
/// or hold it in an `Arc`-free field. Key operations live on
/// [`Namespace`] handles.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use shardlru::builder::CacheBuilder;
///
/// let cache = CacheBuilder::new(1 << 20).shard_bits(2).try_build().unwrap();
/// let ns = cache.default_handle();
///
/// ns.insert(b"page:1", Arc::new(vec![0u8; 64]), 64, None);
/// assert!(ns.lookup(b"page:1").is_some());
/// assert!(cache.total_charge() >= 64);
/// ```
#[derive(Clone)]
pub struct Cache {
    shared: Arc<CacheShared>,
}

impl Cache {
    /// Builds a cache with `1 << shard_bits` shards, each budgeted
    /// `ceil(capacity / shards)`. Callers go through
    /// [`CacheBuilder`](crate::builder::CacheBuilder), which validates
    /// the shard-bit range and derives it from capacity when asked.
    pub(crate) fn with_shards(capacity: u64, shard_bits: u32) -> Self {
        let num_shards = 1usize << shard_bits;
        let per_shard = capacity.div_ceil(num_shards as u64);
        let shards: Box<[Shard]> = (0..num_shards).map(|_| Shard::new(per_shard)).collect();
        Cache {
            shared: Arc::new(CacheShared {
                shards,
                shard_bits,
                capacity: AtomicU64::new(capacity),
                registry: Mutex::new(FxHashSet::default()),
            }),
        }
    }

    /// Returns the unnamed handle (all-zero tag).
    pub fn default_handle(&self) -> Namespace {
        Namespace::new(Arc::clone(&self.shared), [0; TAG_LEN])
    }

    /// Returns the handle for `name` and whether this call created it.
    ///
    /// Tags longer than 10 bytes are truncated, shorter ones are
    /// right-padded with zeros, so names sharing a 10-byte prefix share a
    /// namespace. Repeated calls with an equal tag observe the same
    /// logical handle and report `created = false`.
    pub fn open_namespace(&self, name: &str) -> (Namespace, bool) {
        let tag = Namespace::tag_from(name.as_bytes());
        let created = self.shared.registry.lock().insert(tag);
        (Namespace::new(Arc::clone(&self.shared), tag), created)
    }

    /// Destroys every unpinned entry in every shard.
    pub fn prune(&self) {
        self.shared.prune();
    }

    /// Distributes a new total budget as `ceil(total / shards)` per shard,
    /// evicting immediately where a shard is over its new budget.
    pub fn set_capacity(&self, total: u64) {
        self.shared.set_capacity(total);
    }

    /// Runs `op` once per cached entry across all shards, under each
    /// shard's lock in turn. Keys are the full tag-prefixed bytes. The
    /// callback must not re-enter the cache.
    pub fn apply_to_all<F: FnMut(&[u8], &Value, u64)>(&self, mut op: F) {
        self.shared.apply_to_all(&mut op);
    }

    /// Snapshot sum of per-shard usage.
    pub fn total_charge(&self) -> u64 {
        self.shared.total_charge()
    }

    /// The configured total capacity. Per-shard budgets are the source of
    /// truth after distribution; this is the last total handed to
    /// [`set_capacity`](Self::set_capacity) or the builder.
    pub fn capacity(&self) -> u64 {
        self.shared.capacity.load(Ordering::Relaxed)
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shared.shards.len()
    }

    /// Summed operation counters across shards.
    pub fn stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        for shard in self.shared.shards.iter() {
            total.accumulate(shard.stats());
        }
        total
    }

    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        for shard in self.shared.shards.iter() {
            shard.debug_validate_invariants();
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("shards", &self.shard_count())
            .field("capacity", &self.capacity())
            .field("total_charge", &self.total_charge())
            .finish_non_exhaustive()
    }
}
