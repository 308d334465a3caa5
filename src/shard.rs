//! The per-shard LRU engine: hash table + recency order + charge accounting.
//!
//! ## Architecture
//!
//! ```text
//!   ┌───────────────────────────────────────────────────────────────────┐
//!   │                       Shard (one of 1..1024)                      │
//!   │                                                                   │
//!   │   ┌───────────────────────────────────────────────────────────┐   │
//!   │   │                  Mutex<ShardState>                        │   │
//!   │   │                                                           │   │
//!   │   │  table: (hash, key) ─► EntryId     cached entries         │   │
//!   │   │  detached: (hash, key) ─► [EntryId] pinned, displaced     │   │
//!   │   │                                                           │   │
//!   │   │  entries: EntrySlab                                       │   │
//!   │   │  ┌─────────┬──────────────────────────────────────────┐   │   │
//!   │   │  │ EntryId │ { key, hash, value, charge, deleter,     │   │   │
//!   │   │  │         │   refs, in_cache, lru_prev, lru_next }   │   │   │
//!   │   │  └─────────┴──────────────────────────────────────────┘   │   │
//!   │   │                                                           │   │
//!   │   │  recency order: prev/next links embedded in the entries   │   │
//!   │   │  lru_head ─► [MRU] ◄──► ... ◄──► [LRU] ◄── lru_tail       │   │
//!   │   │  (linked iff refs == 0 && in_cache)                       │   │
//!   │   │                                                           │   │
//!   │   │  usage: Σ charge over table      capacity: budget         │   │
//!   │   └───────────────────────────────────────────────────────────┘   │
//!   └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One allocation pool, two views: the table finds an entry by key, the
//! recency links order the evictable subset. Because the links live
//! inside the entries, pinning, displacement, and eviction all unlink in
//! O(1) without a side structure, and an entry's list membership is a
//! flag the invariant checker can cross-check against its pin count.
//! Vacant slab slots chain into an intrusive free list, so steady-state
//! churn recycles slots without allocating. Ids never leave the shard
//! lock, which is why the slab needs no generation counters: a freed id
//! is only reused after the table, the detached map, and the links have
//! all forgotten it.
//!
//! ## Entry lifecycle
//!
//! ```text
//!   insert/merge ──► in table + linked (refs == 0)
//!        │
//!        ├── reference: refs 0 ─► 1 unlinks (pinned, unevictable)
//!        ├── release:   refs 1 ─► 0 relinks at MRU, then evicts others
//!        ├── lookup / merge hit: promote to MRU (when linked)
//!        │
//!        ├── evicted from the tail (refs == 0 only) ──► destroyed
//!        ├── removed / replaced while unpinned       ──► destroyed
//!        └── removed / replaced while pinned ──► detached until the last
//!            release, then destroyed
//! ```
//!
//! Destroyed entries fire their deleter exactly once, always after the
//! shard mutex is released: every operation collects doomed entries into a
//! local list inside the critical section and runs the deleters once the
//! lock is gone, so a deleter touching another cache cannot deadlock.
//!
//! ## Eviction
//!
//! The victim is strictly `lru_tail`. The entry an insert or merge just
//! touched is never its own victim: the loop stops when the tail is the
//! protected entry, which lets a single entry larger than the whole
//! shard budget stay resident until something displaces it.
//!
//! ## Operation summary
//!
//! | Operation      | Lock | Effect                                           |
//! |----------------|------|--------------------------------------------------|
//! | `insert`       | yes  | displace same key, admit, evict from tail        |
//! | `lookup`       | yes  | promote on hit, refs untouched                   |
//! | `reference`    | yes  | pin; 0 ─► 1 unlinks                              |
//! | `release`      | yes  | unpin; 1 ─► 0 relinks at MRU or destroys         |
//! | `remove`       | yes  | displace; destroy now or at last release         |
//! | `merge`        | yes  | atomic read-modify-write via caller operators    |
//! | `prune`        | yes  | destroy every unpinned cached entry              |
//! | `apply_to_all` | yes  | callback per cached entry, unspecified order     |
//! | `set_capacity` | yes  | update budget, evict down to it                  |
//! | `total_charge` | yes  | usage snapshot                                   |
//!
//! Same-key operations are linearized by the shard mutex; operations on
//! different shards run in parallel.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::OperatorError;
use crate::merge::{ChargeOperator, Deleter, MergeOperator, Value};
use crate::stats::{CacheStats, ShardCounters};

/// Full (namespace-prefixed) key as stored in the shard.
pub(crate) type Key = Arc<[u8]>;

/// Table key: the 32-bit digest rides along so it is computed once per
/// operation, at the dispatch layer.
type TableKey = (u32, Key);

/// Index of an entry slot within one shard's slab. Only ever held by
/// that shard's table, detached map, and recency links, all behind the
/// shard mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryId(u32);

struct Entry {
    key: Key,
    hash: u32,
    value: Value,
    charge: u64,
    deleter: Option<Deleter>,
    refs: u32,
    in_cache: bool,
    // Recency links; meaningful only while `in_lru`.
    lru_prev: Option<EntryId>,
    lru_next: Option<EntryId>,
    in_lru: bool,
}

enum Slot {
    Occupied(Entry),
    Vacant { next_free: Option<EntryId> },
}

/// Entry storage for one shard. Vacant slots thread an intrusive free
/// list through the slab, most recently freed first.
struct EntrySlab {
    slots: Vec<Slot>,
    free_head: Option<EntryId>,
    live: usize,
}

impl EntrySlab {
    fn new() -> Self {
        EntrySlab {
            slots: Vec::new(),
            free_head: None,
            live: 0,
        }
    }

    fn alloc(&mut self, entry: Entry) -> EntryId {
        self.live += 1;
        match self.free_head {
            Some(id) => {
                if let Slot::Vacant { next_free } = &self.slots[id.0 as usize] {
                    self.free_head = *next_free;
                }
                self.slots[id.0 as usize] = Slot::Occupied(entry);
                id
            }
            None => {
                let id = EntryId(self.slots.len() as u32);
                self.slots.push(Slot::Occupied(entry));
                id
            }
        }
    }

    fn free(&mut self, id: EntryId) -> Option<Entry> {
        let slot = self.slots.get_mut(id.0 as usize)?;
        if matches!(slot, Slot::Vacant { .. }) {
            return None;
        }
        let freed = std::mem::replace(
            slot,
            Slot::Vacant {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(id);
        self.live -= 1;
        match freed {
            Slot::Occupied(entry) => Some(entry),
            Slot::Vacant { .. } => None,
        }
    }

    fn get(&self, id: EntryId) -> Option<&Entry> {
        match self.slots.get(id.0 as usize)? {
            Slot::Occupied(entry) => Some(entry),
            Slot::Vacant { .. } => None,
        }
    }

    fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        match self.slots.get_mut(id.0 as usize)? {
            Slot::Occupied(entry) => Some(entry),
            Slot::Vacant { .. } => None,
        }
    }

    fn live(&self) -> usize {
        self.live
    }

    #[cfg(any(test, debug_assertions))]
    fn debug_validate(&self) {
        let occupied = self
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Occupied(_)))
            .count();
        assert_eq!(occupied, self.live);

        let mut seen = std::collections::HashSet::new();
        let mut cursor = self.free_head;
        while let Some(id) = cursor {
            assert!(seen.insert(id.0), "free list revisits a slot");
            cursor = match &self.slots[id.0 as usize] {
                Slot::Vacant { next_free } => *next_free,
                Slot::Occupied(_) => panic!("free list reached an occupied slot"),
            };
        }
        assert_eq!(seen.len() + self.live, self.slots.len());
    }
}

/// An entry displaced from the cache, waiting for its deleter to run
/// outside the lock.
struct Doomed {
    key: Key,
    value: Value,
    deleter: Option<Deleter>,
}

impl Doomed {
    fn of(entry: Entry) -> Self {
        Doomed {
            key: entry.key,
            value: entry.value,
            deleter: entry.deleter,
        }
    }
}

fn fire_deleters(doomed: Vec<Doomed>) {
    for dead in doomed {
        if let Some(deleter) = dead.deleter {
            deleter(&dead.key, dead.value);
        }
    }
}

struct ShardState {
    table: FxHashMap<TableKey, EntryId>,
    detached: FxHashMap<TableKey, Vec<EntryId>>,
    entries: EntrySlab,
    lru_head: Option<EntryId>,
    lru_tail: Option<EntryId>,
    lru_len: usize,
    usage: u64,
    capacity: u64,
}

impl ShardState {
    /// Threads a currently unlinked entry in at the MRU position.
    fn lru_link_front(&mut self, id: EntryId) {
        let old_head = self.lru_head;
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.in_lru = true;
                entry.lru_prev = None;
                entry.lru_next = old_head;
            }
            None => return,
        }
        match old_head {
            Some(head) => {
                if let Some(head_entry) = self.entries.get_mut(head) {
                    head_entry.lru_prev = Some(id);
                }
            }
            None => self.lru_tail = Some(id),
        }
        self.lru_head = Some(id);
        self.lru_len += 1;
    }

    /// Takes an entry out of the recency order. No-op when not linked,
    /// so pin transitions and displacement can call it unconditionally.
    fn lru_unlink(&mut self, id: EntryId) {
        let (prev, next) = match self.entries.get_mut(id) {
            Some(entry) if entry.in_lru => {
                entry.in_lru = false;
                (entry.lru_prev.take(), entry.lru_next.take())
            }
            _ => return,
        };
        match prev {
            Some(prev_id) => {
                if let Some(prev_entry) = self.entries.get_mut(prev_id) {
                    prev_entry.lru_next = next;
                }
            }
            None => self.lru_head = next,
        }
        match next {
            Some(next_id) => {
                if let Some(next_entry) = self.entries.get_mut(next_id) {
                    next_entry.lru_prev = prev;
                }
            }
            None => self.lru_tail = prev,
        }
        self.lru_len -= 1;
    }

    /// Moves a linked entry to MRU on access. Pinned entries are not
    /// linked, so for them this is a no-op and their position is
    /// re-established by `release`.
    fn lru_promote(&mut self, id: EntryId) {
        if self.lru_head == Some(id) {
            return;
        }
        if !matches!(self.entries.get(id), Some(entry) if entry.in_lru) {
            return;
        }
        self.lru_unlink(id);
        self.lru_link_front(id);
    }

    /// Removes the cached entry for `(hash, key)` from the table and the
    /// recency order, subtracting its charge. An unpinned entry is
    /// queued for destruction; a pinned one parks in `detached` until
    /// its last release. Returns the displaced value.
    fn displace(&mut self, hash: u32, key: &Key, doomed: &mut Vec<Doomed>) -> Option<Value> {
        let id = self.table.remove(&(hash, key.clone()))?;
        self.lru_unlink(id);
        let entry = self.entries.get_mut(id)?;
        entry.in_cache = false;
        let charge = entry.charge;
        let pinned = entry.refs > 0;
        let value = entry.value.clone();

        self.usage = self.usage.saturating_sub(charge);
        if pinned {
            self.detached.entry((hash, key.clone())).or_default().push(id);
        } else if let Some(entry) = self.entries.free(id) {
            doomed.push(Doomed::of(entry));
        }
        Some(value)
    }

    /// Creates a cached entry at the MRU position. The caller has already
    /// displaced any previous entry for the key.
    fn admit(
        &mut self,
        key: Key,
        hash: u32,
        value: Value,
        charge: u64,
        deleter: Option<Deleter>,
    ) -> EntryId {
        let id = self.entries.alloc(Entry {
            key: key.clone(),
            hash,
            value,
            charge,
            deleter,
            refs: 0,
            in_cache: true,
            lru_prev: None,
            lru_next: None,
            in_lru: false,
        });
        self.table.insert((hash, key), id);
        self.usage += charge;
        self.lru_link_front(id);
        id
    }

    /// Evicts from the tail until usage fits the budget or only
    /// `protect` remains reachable. Returns the eviction count.
    fn evict_to_capacity(&mut self, protect: Option<EntryId>, doomed: &mut Vec<Doomed>) -> u64 {
        let mut evicted = 0;
        while self.usage > self.capacity {
            let victim = match self.lru_tail {
                Some(id) => id,
                None => break,
            };
            if Some(victim) == protect {
                break;
            }
            self.lru_unlink(victim);
            if let Some(entry) = self.entries.free(victim) {
                self.table.remove(&(entry.hash, entry.key.clone()));
                self.usage = self.usage.saturating_sub(entry.charge);
                doomed.push(Doomed::of(entry));
                evicted += 1;
            }
        }
        evicted
    }
}

pub(crate) struct Shard {
    state: Mutex<ShardState>,
    counters: ShardCounters,
}

impl Shard {
    pub(crate) fn new(capacity: u64) -> Self {
        Shard {
            state: Mutex::new(ShardState {
                table: FxHashMap::default(),
                detached: FxHashMap::default(),
                entries: EntrySlab::new(),
                lru_head: None,
                lru_tail: None,
                lru_len: 0,
                usage: 0,
                capacity,
            }),
            counters: ShardCounters::default(),
        }
    }

    /// Inserts an entry, replacing any cached entry with the same key.
    ///
    /// The new entry is always admitted; eviction then runs from the tail
    /// but never takes the entry just admitted, so a single oversized
    /// entry empties the shard and stays.
    pub(crate) fn insert(
        &self,
        key: Key,
        hash: u32,
        value: Value,
        charge: u64,
        deleter: Option<Deleter>,
    ) {
        let mut doomed = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.displace(hash, &key, &mut doomed).is_some() {
                self.counters.inc_update();
            } else {
                self.counters.inc_insert();
            }
            let id = state.admit(key, hash, value, charge, deleter);
            let evicted = state.evict_to_capacity(Some(id), &mut doomed);
            self.counters.add_evictions(evicted);
        }
        fire_deleters(doomed);
    }

    /// Looks up a cached entry, promoting it to MRU when unpinned. The
    /// pin count is not changed.
    pub(crate) fn lookup(&self, key: &Key, hash: u32) -> Option<Value> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let hit = state
            .table
            .get(&(hash, key.clone()))
            .copied()
            .and_then(|id| {
                state
                    .entries
                    .get(id)
                    .filter(|entry| entry.in_cache)
                    .map(|entry| (id, entry.value.clone()))
            });
        match hit {
            Some((id, value)) => {
                state.lru_promote(id);
                self.counters.inc_hit();
                Some(value)
            }
            None => {
                self.counters.inc_miss();
                None
            }
        }
    }

    /// Looks up a cached entry and pins it. The transition from zero pins
    /// unlinks the entry from the recency order, making it unevictable
    /// until released.
    pub(crate) fn reference(&self, key: &Key, hash: u32) -> Option<Value> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let id = match state.table.get(&(hash, key.clone())).copied() {
            Some(id) => id,
            None => {
                self.counters.inc_miss();
                return None;
            }
        };
        let found = state.entries.get_mut(id).map(|entry| {
            entry.refs += 1;
            (entry.refs == 1, entry.value.clone())
        });
        match found {
            Some((first_pin, value)) => {
                if first_pin {
                    state.lru_unlink(id);
                }
                self.counters.inc_hit();
                Some(value)
            }
            None => {
                self.counters.inc_miss();
                None
            }
        }
    }

    /// Drops one pin. When the last pin drops: an entry still cached
    /// re-enters the recency order at MRU (and eviction then catches up
    /// on any deferred pressure); an entry already displaced is
    /// destroyed.
    ///
    /// Releasing an unpinned key is a no-op. When the same key was pinned
    /// and then replaced, releases resolve the displaced pins first, in
    /// the order they were displaced.
    pub(crate) fn release(&self, key: &Key, hash: u32) {
        let mut doomed = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let table_key = (hash, key.clone());
            let id = state
                .detached
                .get(&table_key)
                .and_then(|ids| ids.first().copied())
                .or_else(|| state.table.get(&table_key).copied());
            let Some(id) = id else {
                return;
            };

            let mut relinked = false;
            let mut destroy = false;
            if let Some(entry) = state.entries.get_mut(id) {
                if entry.refs == 0 {
                    return;
                }
                entry.refs -= 1;
                if entry.refs == 0 {
                    if entry.in_cache {
                        relinked = true;
                    } else {
                        destroy = true;
                    }
                }
            }

            if destroy {
                if let Some(ids) = state.detached.get_mut(&table_key) {
                    ids.retain(|&parked| parked != id);
                    if ids.is_empty() {
                        state.detached.remove(&table_key);
                    }
                }
                if let Some(entry) = state.entries.free(id) {
                    doomed.push(Doomed::of(entry));
                }
            }
            if relinked {
                state.lru_link_front(id);
                let evicted = state.evict_to_capacity(None, &mut doomed);
                self.counters.add_evictions(evicted);
            }
        }
        fire_deleters(doomed);
    }

    /// Removes the cached entry for the key and returns its value. A
    /// pinned entry is displaced immediately but destroyed only when its
    /// last pin drops.
    pub(crate) fn remove(&self, key: &Key, hash: u32) -> Option<Value> {
        let mut doomed = Vec::new();
        let value = {
            let mut guard = self.state.lock();
            guard.displace(hash, key, &mut doomed)
        };
        if value.is_some() {
            self.counters.inc_remove();
        }
        fire_deleters(doomed);
        value
    }

    /// Atomic read-modify-write. An existing entry's value and charge are
    /// replaced by the operator results in place and the entry is promoted;
    /// an absent key stores the delta directly. Operator failure aborts
    /// with no state change.
    pub(crate) fn merge(
        &self,
        key: &Key,
        hash: u32,
        delta: Value,
        delta_charge: u64,
        merge_op: MergeOperator,
        charge_op: ChargeOperator,
    ) -> Result<Value, OperatorError> {
        let mut doomed = Vec::new();
        let merged = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let existing = state
                .table
                .get(&(hash, key.clone()))
                .copied()
                .and_then(|id| {
                    state
                        .entries
                        .get(id)
                        .map(|entry| (id, entry.value.clone(), entry.charge))
                });
            match existing {
                Some((id, old_value, old_charge)) => {
                    let new_value = merge_op(&old_value, &delta)?;
                    let new_charge = charge_op(old_charge, delta_charge)?;
                    if let Some(entry) = state.entries.get_mut(id) {
                        entry.value = new_value.clone();
                        entry.charge = new_charge;
                    }
                    state.usage = state.usage.saturating_sub(old_charge) + new_charge;
                    state.lru_promote(id);
                    let evicted = state.evict_to_capacity(Some(id), &mut doomed);
                    self.counters.add_evictions(evicted);
                    self.counters.inc_update();
                    new_value
                }
                None => {
                    let id = state.admit(key.clone(), hash, delta.clone(), delta_charge, None);
                    let evicted = state.evict_to_capacity(Some(id), &mut doomed);
                    self.counters.add_evictions(evicted);
                    self.counters.inc_insert();
                    delta
                }
            }
        };
        fire_deleters(doomed);
        Ok(merged)
    }

    /// Destroys every unpinned cached entry. Pinned entries stay.
    pub(crate) fn prune(&self) {
        let mut doomed = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut evicted = 0;
            while let Some(id) = state.lru_tail {
                state.lru_unlink(id);
                if let Some(entry) = state.entries.free(id) {
                    state.table.remove(&(entry.hash, entry.key.clone()));
                    state.usage = state.usage.saturating_sub(entry.charge);
                    doomed.push(Doomed::of(entry));
                    evicted += 1;
                }
            }
            self.counters.add_evictions(evicted);
        }
        fire_deleters(doomed);
    }

    /// Runs `op` once per cached entry, under the shard lock, in
    /// unspecified order. The callback must not re-enter the cache.
    pub(crate) fn apply_to_all(&self, op: &mut dyn FnMut(&[u8], &Value, u64)) {
        let guard = self.state.lock();
        for &id in guard.table.values() {
            if let Some(entry) = guard.entries.get(id) {
                op(&entry.key, &entry.value, entry.charge);
            }
        }
    }

    /// Updates the budget and immediately evicts down to it.
    pub(crate) fn set_capacity(&self, capacity: u64) {
        let mut doomed = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.capacity = capacity;
            let evicted = state.evict_to_capacity(None, &mut doomed);
            self.counters.add_evictions(evicted);
        }
        fire_deleters(doomed);
    }

    /// Current usage snapshot.
    pub(crate) fn total_charge(&self) -> u64 {
        self.state.lock().usage
    }

    pub(crate) fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    #[cfg(any(test, debug_assertions))]
    pub(crate) fn debug_validate_invariants(&self) {
        let guard = self.state.lock();

        let mut charge_sum = 0u64;
        let mut linked = 0usize;
        for (table_key, &id) in guard.table.iter() {
            let entry = guard.entries.get(id).expect("table entry missing from slab");
            assert!(entry.in_cache);
            assert_eq!(entry.hash, table_key.0);
            assert_eq!(entry.key, table_key.1);
            charge_sum += entry.charge;
            if entry.refs == 0 {
                assert!(entry.in_lru);
                linked += 1;
            } else {
                assert!(!entry.in_lru);
                assert!(entry.lru_prev.is_none());
                assert!(entry.lru_next.is_none());
            }
        }
        assert_eq!(charge_sum, guard.usage);
        assert_eq!(linked, guard.lru_len);

        // Walk the chain head to tail, checking backlinks and membership.
        let mut count = 0usize;
        let mut prev = None;
        let mut cursor = guard.lru_head;
        while let Some(id) = cursor {
            let entry = guard.entries.get(id).expect("recency link names a dead entry");
            assert!(entry.in_lru);
            assert!(entry.in_cache);
            assert_eq!(entry.refs, 0);
            assert_eq!(entry.lru_prev, prev);
            prev = Some(id);
            cursor = entry.lru_next;
            count += 1;
            assert!(count <= guard.lru_len, "recency links form a cycle");
        }
        assert_eq!(count, guard.lru_len);
        assert_eq!(guard.lru_tail, prev);

        let mut parked = 0usize;
        for ids in guard.detached.values() {
            assert!(!ids.is_empty());
            for &id in ids {
                let entry = guard.entries.get(id).expect("detached entry missing from slab");
                assert!(!entry.in_cache);
                assert!(entry.refs > 0);
                assert!(!entry.in_lru);
                parked += 1;
            }
        }
        assert_eq!(guard.table.len() + parked, guard.entries.live());

        guard.entries.debug_validate();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::ds::hash::hash_bytes;
    use crate::merge::{int64_charge, int64_merge};

    fn key(s: &str) -> Key {
        Arc::from(s.as_bytes())
    }

    fn hashed(s: &str) -> (Key, u32) {
        let k = key(s);
        let h = hash_bytes(&k);
        (k, h)
    }

    fn string_value(s: &str) -> Value {
        Arc::new(s.to_string())
    }

    fn as_string(value: &Value) -> String {
        value.downcast_ref::<String>().unwrap().clone()
    }

    fn counting_deleter(counter: &Arc<AtomicUsize>) -> Deleter {
        let counter = Arc::clone(counter);
        Box::new(move |_key, _value| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn blank_entry(tag: &str) -> Entry {
        Entry {
            key: key(tag),
            hash: 0,
            value: string_value(tag),
            charge: 1,
            deleter: None,
            refs: 0,
            in_cache: true,
            lru_prev: None,
            lru_next: None,
            in_lru: false,
        }
    }

    #[test]
    fn slab_reuses_freed_slots_most_recent_first() {
        let mut slab = EntrySlab::new();
        let a = slab.alloc(blank_entry("a"));
        let b = slab.alloc(blank_entry("b"));
        let c = slab.alloc(blank_entry("c"));
        assert_eq!(slab.live(), 3);

        assert!(slab.free(b).is_some());
        assert!(slab.free(a).is_some());
        assert_eq!(slab.live(), 1);

        // The free list is LIFO: "a" went vacant last, so it comes back
        // first.
        assert_eq!(slab.alloc(blank_entry("d")), a);
        assert_eq!(slab.alloc(blank_entry("e")), b);
        assert!(slab.get(c).is_some());
        slab.debug_validate();
    }

    #[test]
    fn slab_double_free_is_rejected() {
        let mut slab = EntrySlab::new();
        let a = slab.alloc(blank_entry("a"));
        assert!(slab.free(a).is_some());
        assert!(slab.free(a).is_none());
        assert!(slab.get(a).is_none());
        assert!(slab.get_mut(a).is_none());
        assert_eq!(slab.live(), 0);
        slab.debug_validate();
    }

    #[test]
    fn insert_then_lookup_roundtrips() {
        let shard = Shard::new(100);
        let (k, h) = hashed("alpha");
        shard.insert(k.clone(), h, string_value("one"), 10, None);

        let value = shard.lookup(&k, h).unwrap();
        assert_eq!(as_string(&value), "one");
        assert_eq!(shard.total_charge(), 10);
        shard.debug_validate_invariants();
    }

    #[test]
    fn lookup_miss_returns_none() {
        let shard = Shard::new(100);
        let (k, h) = hashed("missing");
        assert!(shard.lookup(&k, h).is_none());
        assert_eq!(shard.stats().misses, 1);
    }

    #[test]
    fn replacing_fires_old_deleter_once() {
        let shard = Shard::new(100);
        let fired = Arc::new(AtomicUsize::new(0));
        let (k, h) = hashed("alpha");

        shard.insert(k.clone(), h, string_value("v1"), 10, Some(counting_deleter(&fired)));
        shard.insert(k.clone(), h, string_value("v2"), 10, None);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let value = shard.lookup(&k, h).unwrap();
        assert_eq!(as_string(&value), "v2");
        assert_eq!(shard.total_charge(), 10);
        shard.debug_validate_invariants();
    }

    #[test]
    fn eviction_takes_least_recently_used() {
        let shard = Shard::new(30);
        let (a, ha) = hashed("a");
        let (b, hb) = hashed("b");
        let (c, hc) = hashed("c");
        let (d, hd) = hashed("d");

        shard.insert(a.clone(), ha, string_value("a"), 10, None);
        shard.insert(b.clone(), hb, string_value("b"), 10, None);
        shard.insert(c.clone(), hc, string_value("c"), 10, None);

        // Touch "a" so "b" becomes the victim.
        assert!(shard.lookup(&a, ha).is_some());
        shard.insert(d.clone(), hd, string_value("d"), 10, None);

        assert!(shard.lookup(&a, ha).is_some());
        assert!(shard.lookup(&b, hb).is_none());
        assert!(shard.lookup(&c, hc).is_some());
        assert!(shard.lookup(&d, hd).is_some());
        assert_eq!(shard.total_charge(), 30);
        assert_eq!(shard.stats().evictions, 1);
        shard.debug_validate_invariants();
    }

    #[test]
    fn oversized_entry_empties_shard_and_stays() {
        let shard = Shard::new(20);
        let (a, ha) = hashed("a");
        let (big, hbig) = hashed("big");

        shard.insert(a.clone(), ha, string_value("a"), 10, None);
        shard.insert(big.clone(), hbig, string_value("big"), 50, None);

        assert!(shard.lookup(&a, ha).is_none());
        assert!(shard.lookup(&big, hbig).is_some());
        assert_eq!(shard.total_charge(), 50);
        shard.debug_validate_invariants();

        // A later insert displaces the oversized tail.
        let (b, hb) = hashed("b");
        shard.insert(b.clone(), hb, string_value("b"), 10, None);
        assert!(shard.lookup(&big, hbig).is_none());
        assert!(shard.lookup(&b, hb).is_some());
        shard.debug_validate_invariants();
    }

    #[test]
    fn pinned_entry_survives_capacity_pressure() {
        let shard = Shard::new(30);
        let fired = Arc::new(AtomicUsize::new(0));
        let (k, h) = hashed("pinned");

        shard.insert(k.clone(), h, string_value("keep"), 10, Some(counting_deleter(&fired)));
        assert!(shard.reference(&k, h).is_some());

        for i in 0..20 {
            let (other, oh) = hashed(&format!("filler-{i}"));
            shard.insert(other, oh, string_value("x"), 25, None);
        }

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        let value = shard.lookup(&k, h).unwrap();
        assert_eq!(as_string(&value), "keep");
        shard.debug_validate_invariants();

        // After release the entry re-enters the order at MRU and the next
        // pressure wave can take it.
        shard.release(&k, h);
        shard.debug_validate_invariants();
        let (last, lh) = hashed("last");
        shard.insert(last, lh, string_value("x"), 25, None);
        assert!(shard.lookup(&k, h).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        shard.debug_validate_invariants();
    }

    #[test]
    fn release_of_unpinned_key_is_noop() {
        let shard = Shard::new(100);
        let (k, h) = hashed("plain");
        shard.insert(k.clone(), h, string_value("v"), 10, None);
        shard.release(&k, h);
        shard.release(&k, h);
        assert!(shard.lookup(&k, h).is_some());
        shard.debug_validate_invariants();
    }

    #[test]
    fn nested_pins_require_matching_releases() {
        let shard = Shard::new(10);
        let (k, h) = hashed("nested");
        shard.insert(k.clone(), h, string_value("v"), 5, None);

        assert!(shard.reference(&k, h).is_some());
        assert!(shard.reference(&k, h).is_some());
        shard.release(&k, h);

        // Still pinned: capacity pressure cannot take it.
        let (other, oh) = hashed("other");
        shard.insert(other, oh, string_value("x"), 10, None);
        assert!(shard.lookup(&k, h).is_some());

        shard.release(&k, h);
        shard.debug_validate_invariants();
    }

    #[test]
    fn remove_fires_deleter_and_forgets_key() {
        let shard = Shard::new(100);
        let fired = Arc::new(AtomicUsize::new(0));
        let (k, h) = hashed("gone");

        shard.insert(k.clone(), h, string_value("v"), 10, Some(counting_deleter(&fired)));
        let removed = shard.remove(&k, h).unwrap();
        assert_eq!(as_string(&removed), "v");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(shard.lookup(&k, h).is_none());
        assert!(shard.remove(&k, h).is_none());
        assert_eq!(shard.total_charge(), 0);
        shard.debug_validate_invariants();
    }

    #[test]
    fn remove_of_pinned_entry_defers_destruction() {
        let shard = Shard::new(100);
        let fired = Arc::new(AtomicUsize::new(0));
        let (k, h) = hashed("held");

        shard.insert(k.clone(), h, string_value("v"), 10, Some(counting_deleter(&fired)));
        assert!(shard.reference(&k, h).is_some());

        assert!(shard.remove(&k, h).is_some());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(shard.lookup(&k, h).is_none());
        assert_eq!(shard.total_charge(), 0);
        shard.debug_validate_invariants();

        shard.release(&k, h);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        shard.debug_validate_invariants();
    }

    #[test]
    fn replace_of_pinned_entry_defers_destruction() {
        let shard = Shard::new(100);
        let fired = Arc::new(AtomicUsize::new(0));
        let (k, h) = hashed("held");

        shard.insert(k.clone(), h, string_value("old"), 10, Some(counting_deleter(&fired)));
        assert!(shard.reference(&k, h).is_some());
        shard.insert(k.clone(), h, string_value("new"), 10, None);

        // The old entry is displaced but alive until released; the new
        // entry answers lookups.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        let value = shard.lookup(&k, h).unwrap();
        assert_eq!(as_string(&value), "new");
        shard.debug_validate_invariants();

        // The release resolves the displaced pin, not the new entry.
        shard.release(&k, h);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let value = shard.lookup(&k, h).unwrap();
        assert_eq!(as_string(&value), "new");
        shard.debug_validate_invariants();
    }

    #[test]
    fn merge_absent_key_stores_delta() {
        let shard = Shard::new(100);
        let (k, h) = hashed("counter");
        let merged = shard
            .merge(&k, h, Arc::new(5i64), 8, int64_merge, int64_charge)
            .unwrap();
        assert_eq!(*merged.downcast_ref::<i64>().unwrap(), 5);
        assert_eq!(shard.total_charge(), 8);
        shard.debug_validate_invariants();
    }

    #[test]
    fn merge_existing_combines_in_place() {
        let shard = Shard::new(100);
        let (k, h) = hashed("counter");
        shard
            .merge(&k, h, Arc::new(5i64), 8, int64_merge, int64_charge)
            .unwrap();
        let merged = shard
            .merge(&k, h, Arc::new(3i64), 8, int64_merge, int64_charge)
            .unwrap();
        assert_eq!(*merged.downcast_ref::<i64>().unwrap(), 8);
        // Charge stays fixed however many increments land.
        assert_eq!(shard.total_charge(), 8);
        shard.debug_validate_invariants();
    }

    #[test]
    fn merge_promotes_existing_entry() {
        let shard = Shard::new(20);
        let (c, hc) = hashed("counter");
        let (b, hb) = hashed("bystander");

        shard
            .merge(&c, hc, Arc::new(1i64), 8, int64_merge, int64_charge)
            .unwrap();
        shard.insert(b.clone(), hb, string_value("x"), 8, None);

        // The merge makes the counter MRU, so pressure takes the bystander.
        shard
            .merge(&c, hc, Arc::new(1i64), 8, int64_merge, int64_charge)
            .unwrap();
        let (big, hbig) = hashed("big");
        shard.insert(big, hbig, string_value("y"), 8, None);

        assert!(shard.lookup(&c, hc).is_some());
        assert!(shard.lookup(&b, hb).is_none());
        shard.debug_validate_invariants();
    }

    #[test]
    fn merge_operator_failure_leaves_state_unchanged() {
        let shard = Shard::new(100);
        let (k, h) = hashed("text");
        shard.insert(k.clone(), h, string_value("not a counter"), 10, None);

        let err = shard
            .merge(&k, h, Arc::new(1i64), 8, int64_merge, int64_charge)
            .unwrap_err();
        assert!(err.message().contains("i64"));

        let value = shard.lookup(&k, h).unwrap();
        assert_eq!(as_string(&value), "not a counter");
        assert_eq!(shard.total_charge(), 10);
        shard.debug_validate_invariants();
    }

    #[test]
    fn failing_charge_operator_aborts_merge() {
        fn reject(_current: u64, _delta: u64) -> Result<u64, OperatorError> {
            Err(OperatorError::new("charge rejected"))
        }

        let shard = Shard::new(100);
        let (k, h) = hashed("counter");
        shard
            .merge(&k, h, Arc::new(7i64), 8, int64_merge, int64_charge)
            .unwrap();
        let err = shard
            .merge(&k, h, Arc::new(1i64), 8, int64_merge, reject)
            .unwrap_err();
        assert_eq!(err.message(), "charge rejected");

        let value = shard.lookup(&k, h).unwrap();
        assert_eq!(*value.downcast_ref::<i64>().unwrap(), 7);
        shard.debug_validate_invariants();
    }

    #[test]
    fn prune_destroys_unpinned_keeps_pinned() {
        let shard = Shard::new(100);
        let fired = Arc::new(AtomicUsize::new(0));
        let (a, ha) = hashed("a");
        let (b, hb) = hashed("b");

        shard.insert(a.clone(), ha, string_value("a"), 10, Some(counting_deleter(&fired)));
        shard.insert(b.clone(), hb, string_value("b"), 10, Some(counting_deleter(&fired)));
        assert!(shard.reference(&b, hb).is_some());

        shard.prune();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(shard.lookup(&a, ha).is_none());
        assert!(shard.lookup(&b, hb).is_some());
        assert_eq!(shard.total_charge(), 10);
        shard.debug_validate_invariants();

        shard.release(&b, hb);
        shard.debug_validate_invariants();
    }

    #[test]
    fn set_capacity_zero_evicts_unpinned_only() {
        let shard = Shard::new(100);
        let (a, ha) = hashed("a");
        let (b, hb) = hashed("b");

        shard.insert(a.clone(), ha, string_value("a"), 10, None);
        shard.insert(b.clone(), hb, string_value("b"), 10, None);
        assert!(shard.reference(&b, hb).is_some());

        shard.set_capacity(0);

        assert!(shard.lookup(&a, ha).is_none());
        assert!(shard.lookup(&b, hb).is_some());
        assert_eq!(shard.total_charge(), 10);
        shard.debug_validate_invariants();

        // The released entry relinks and is immediately over budget.
        shard.release(&b, hb);
        assert!(shard.lookup(&b, hb).is_none());
        assert_eq!(shard.total_charge(), 0);
        shard.debug_validate_invariants();
    }

    #[test]
    fn apply_to_all_visits_every_cached_entry() {
        let shard = Shard::new(100);
        for i in 0..5 {
            let (k, h) = hashed(&format!("k{i}"));
            shard.insert(k, h, string_value("v"), 7, None);
        }

        let mut visited = 0usize;
        let mut charge_sum = 0u64;
        shard.apply_to_all(&mut |_key, _value, charge| {
            visited += 1;
            charge_sum += charge;
        });
        assert_eq!(visited, 5);
        assert_eq!(charge_sum, shard.total_charge());
    }

    #[test]
    fn usage_tracks_charges_through_churn() {
        let shard = Shard::new(1000);
        for i in 0..50 {
            let (k, h) = hashed(&format!("k{}", i % 10));
            shard.insert(k, h, string_value("v"), (i % 7) + 1, None);
        }
        for i in 0..5 {
            let (k, h) = hashed(&format!("k{i}"));
            shard.remove(&k, h);
        }
        shard.debug_validate_invariants();

        let mut charge_sum = 0u64;
        shard.apply_to_all(&mut |_k, _v, charge| charge_sum += charge);
        assert_eq!(charge_sum, shard.total_charge());
    }
}
