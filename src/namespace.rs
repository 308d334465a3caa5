//! Namespace handles: a shared cache reference plus a fixed 10-byte tag.
//!
//! Every user-facing key operation forms the real key as
//! `tag (10 bytes) || user_key`, hashes it once, and dispatches to the
//! owning shard. Namespaces therefore share all shard machinery while
//! staying logically disjoint: equal user keys under different tags are
//! different entries. The tag's own bytes never count against charge.
//!
//! Handles are cheap clones. The default handle carries the all-zero tag.

use std::sync::Arc;

use crate::cache::CacheShared;
use crate::ds::hash::hash_bytes;
use crate::error::OperatorError;
use crate::merge::{
    int64_charge, int64_merge, ChargeOperator, Deleter, MergeOperator, Value, INT64_CHARGE,
};
use crate::shard::Key;

/// Fixed namespace tag width.
pub(crate) const TAG_LEN: usize = 10;

/// A namespace tag: exactly 10 bytes, zero-padded.
pub(crate) type Tag = [u8; TAG_LEN];

/// View over a shared [`Cache`](crate::cache::Cache) that prefixes every
/// key with its tag.
///
/// # Example
///
/// ```
/// use shardlru::builder::CacheBuilder;
///
/// let cache = CacheBuilder::new(1 << 20).try_build().unwrap();
/// let (users, _) = cache.open_namespace("users");
/// let (posts, _) = cache.open_namespace("posts");
///
/// users.put("42", "alice");
/// posts.put("42", "hello world");
///
/// assert_eq!(users.get("42").as_deref(), Some("alice"));
/// assert_eq!(posts.get("42").as_deref(), Some("hello world"));
/// ```
#[derive(Clone)]
pub struct Namespace {
    cache: Arc<CacheShared>,
    tag: Tag,
}

impl Namespace {
    pub(crate) fn new(cache: Arc<CacheShared>, tag: Tag) -> Self {
        Namespace { cache, tag }
    }

    /// Builds a tag from a name: truncated past 10 bytes, zero-padded
    /// below.
    pub(crate) fn tag_from(name: &[u8]) -> Tag {
        let mut tag = [0u8; TAG_LEN];
        let len = name.len().min(TAG_LEN);
        tag[..len].copy_from_slice(&name[..len]);
        tag
    }

    /// This handle's tag.
    pub fn tag(&self) -> &[u8] {
        &self.tag
    }

    fn tagged_key(&self, key: &[u8]) -> Key {
        let mut buf = Vec::with_capacity(TAG_LEN + key.len());
        buf.extend_from_slice(&self.tag);
        buf.extend_from_slice(key);
        Arc::from(buf)
    }

    /// Stores `value` under `key` with the given charge. Replaces any
    /// existing entry for the key, firing its deleter once it is
    /// unreferenced. The new entry is always admitted; eviction follows.
    pub fn insert(&self, key: &[u8], value: Value, charge: u64, deleter: Option<Deleter>) {
        let key = self.tagged_key(key);
        let hash = hash_bytes(&key);
        self.cache.shard_for(hash).insert(key, hash, value, charge, deleter);
    }

    /// Returns the cached value for `key`, promoting it to most recently
    /// used. Does not pin.
    pub fn lookup(&self, key: &[u8]) -> Option<Value> {
        let key = self.tagged_key(key);
        let hash = hash_bytes(&key);
        self.cache.shard_for(hash).lookup(&key, hash)
    }

    /// Removes the entry for `key` and returns its value. A pinned
    /// entry's deleter fires at its last [`release`](Self::release).
    pub fn remove(&self, key: &[u8]) -> Option<Value> {
        let key = self.tagged_key(key);
        let hash = hash_bytes(&key);
        self.cache.shard_for(hash).remove(&key, hash)
    }

    /// Atomically combines the cached value with `delta` via the supplied
    /// operators and returns the post-merge value. An absent key stores
    /// `delta` with `delta_charge` directly.
    pub fn merge(
        &self,
        key: &[u8],
        delta: Value,
        delta_charge: u64,
        merge_op: MergeOperator,
        charge_op: ChargeOperator,
    ) -> Result<Value, OperatorError> {
        let key = self.tagged_key(key);
        let hash = hash_bytes(&key);
        self.cache
            .shard_for(hash)
            .merge(&key, hash, delta, delta_charge, merge_op, charge_op)
    }

    /// Looks up `key` and pins the entry so eviction cannot destroy it.
    /// Every successful `reference` needs a matching
    /// [`release`](Self::release).
    pub fn reference(&self, key: &[u8]) -> Option<Value> {
        let key = self.tagged_key(key);
        let hash = hash_bytes(&key);
        self.cache.shard_for(hash).reference(&key, hash)
    }

    /// Drops one pin on the entry for `key`. No-op for unpinned keys.
    pub fn release(&self, key: &[u8]) {
        let key = self.tagged_key(key);
        let hash = hash_bytes(&key);
        self.cache.shard_for(hash).release(&key, hash);
    }

    /// Stores a string value, charged `key.len() + value.len()` bytes.
    pub fn put(&self, key: &str, value: &str) {
        let charge = (key.len() + value.len()) as u64;
        self.insert(key.as_bytes(), Arc::new(value.to_string()), charge, None);
    }

    /// Returns the string stored under `key`, or `None` when the key is
    /// absent or holds a non-string value.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = self.lookup(key.as_bytes())?;
        value.downcast_ref::<String>().cloned()
    }

    /// Removes the entry for `key`, ignoring whether it existed.
    pub fn delete(&self, key: &str) {
        let _ = self.remove(key.as_bytes());
    }

    /// Increments the i64 counter stored under `key` and returns its new
    /// value; the first increment yields 1 and pins the counter so that
    /// routine eviction cannot reset a live id sequence.
    pub fn new_id(&self, key: &str) -> Result<i64, OperatorError> {
        let merged = self.merge(
            key.as_bytes(),
            Arc::new(1i64),
            INT64_CHARGE,
            int64_merge,
            int64_charge,
        )?;
        let id = merged
            .downcast_ref::<i64>()
            .copied()
            .ok_or_else(|| OperatorError::type_mismatch("i64"))?;
        if id == 1 {
            let _ = self.reference(key.as_bytes());
        }
        Ok(id)
    }

    /// Destroys every unpinned entry, across all namespaces.
    pub fn prune(&self) {
        self.cache.prune();
    }

    /// Snapshot sum of per-shard usage, across all namespaces.
    pub fn total_charge(&self) -> u64 {
        self.cache.total_charge()
    }

    /// Redistributes a new total budget across shards, evicting as
    /// needed. Affects all namespaces.
    pub fn set_capacity(&self, total: u64) {
        self.cache.set_capacity(total);
    }

    /// Runs `op` once per cached entry across all namespaces. Keys are
    /// the full tag-prefixed bytes. The callback must not re-enter the
    /// cache.
    pub fn apply_to_all<F: FnMut(&[u8], &Value, u64)>(&self, mut op: F) {
        self.cache.apply_to_all(&mut op);
    }
}

impl PartialEq for Namespace {
    /// Handles are equal when they view the same cache through the same
    /// tag.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cache, &other.cache) && self.tag == other.tag
    }
}

impl Eq for Namespace {}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace").field("tag", &self.tag).finish_non_exhaustive()
    }
}
