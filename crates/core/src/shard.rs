//! Arena-of-shards map with per-shard LRU eviction.
//!
//! Per-identity mutable state (cost ledgers, rate windows, pending
//! reservations) lives here. Keys hash to one of N independently locked
//! shards, so unrelated identities never contend on the same lock. Each
//! shard holds at most `capacity / shards` entries; inserting into a full
//! shard evicts the entry with the lowest eviction rank, least recently used
//! first among equals. A rank of `None` pins an entry.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use tracing::debug;

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 16;

struct Slot<V> {
    value: V,
    last_used: u64,
}

struct Shard<K, V> {
    map: HashMap<K, Slot<V>>,
    tick: u64,
}

/// Eviction priority of an entry: lower ranks go first, `None` pins it.
pub type EvictionRank<V> = Box<dyn Fn(&V) -> Option<u8> + Send + Sync>;

impl<K: Hash + Eq, V> Shard<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Evict the lowest-ranked entry, least recently used among equals.
    fn evict_one(&mut self, rank: &EvictionRank<V>) -> bool
    where
        K: Clone,
    {
        let victim = self
            .map
            .iter()
            .filter_map(|(k, slot)| rank(&slot.value).map(|r| (r, slot.last_used, k)))
            .min_by_key(|(r, last_used, _)| (*r, *last_used))
            .map(|(_, _, k)| k.clone());

        match victim {
            Some(k) => {
                self.map.remove(&k);
                true
            }
            None => false,
        }
    }
}

/// A bounded, sharded, LRU-evicting map.
pub struct ShardedLru<K, V> {
    shards: Box<[Mutex<Shard<K, V>>]>,
    per_shard_capacity: usize,
    hasher: RandomState,
    rank: EvictionRank<V>,
}

impl<K: Hash + Eq + Clone, V: 'static> ShardedLru<K, V> {
    /// Create a map holding roughly `capacity` entries across `shards` locks.
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shard_count = shards.max(1);
        let per_shard_capacity = capacity.div_ceil(shard_count).max(1);
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    map: HashMap::new(),
                    tick: 0,
                })
            })
            .collect();
        Self {
            shards,
            per_shard_capacity,
            hasher: RandomState::new(),
            rank: Box::new(|_: &V| Some(0)),
        }
    }

    /// Restrict eviction to entries for which `f` returns true.
    ///
    /// A full shard whose entries are all pinned grows past its capacity
    /// rather than dropping pinned state.
    pub fn with_eviction_filter(self, f: fn(&V) -> bool) -> Self {
        self.with_eviction_rank(move |v| f(v).then_some(0))
    }

    /// Order eviction candidates by `rank` before recency. Entries ranked
    /// `None` are pinned.
    pub fn with_eviction_rank(mut self, rank: impl Fn(&V) -> Option<u8> + Send + Sync + 'static) -> Self {
        self.rank = Box::new(rank);
        self
    }

    fn shard(&self, key: &K) -> &Mutex<Shard<K, V>> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Run `f` on the entry for `key` under its shard lock, inserting
    /// `init()` first when absent. Everything `f` does is atomic with
    /// respect to other calls touching the same key.
    pub fn with_entry<R>(
        &self,
        key: &K,
        init: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let mut shard = self.shard(key).lock();
        let tick = shard.next_tick();

        if !shard.map.contains_key(key)
            && shard.map.len() >= self.per_shard_capacity
            && !shard.evict_one(&self.rank)
        {
            debug!(
                entries = shard.map.len(),
                capacity = self.per_shard_capacity,
                "shard full of pinned entries, growing"
            );
        }

        let slot = shard.map.entry(key.clone()).or_insert_with(|| Slot {
            value: init(),
            last_used: tick,
        });
        slot.last_used = tick;
        f(&mut slot.value)
    }

    /// Run `f` on an existing entry only. Does not insert.
    pub fn with_existing<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut shard = self.shard(key).lock();
        let tick = shard.next_tick();
        shard.map.get_mut(key).map(|slot| {
            slot.last_used = tick;
            f(&mut slot.value)
        })
    }

    /// Insert or replace, returning the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let mut shard = self.shard(&key).lock();
        let tick = shard.next_tick();
        if !shard.map.contains_key(&key) && shard.map.len() >= self.per_shard_capacity {
            shard.evict_one(&self.rank);
        }
        shard
            .map
            .insert(
                key,
                Slot {
                    value,
                    last_used: tick,
                },
            )
            .map(|s| s.value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).lock().map.remove(key).map(|s| s.value)
    }

    /// Remove the entry with the smallest `by(value)` across all shards.
    ///
    /// Shards are scanned one at a time, so a concurrent writer may remove
    /// the chosen entry first; the call then returns `None`.
    pub fn remove_min_by<T: Ord>(&self, by: impl Fn(&V) -> T) -> Option<(K, V)> {
        let mut best: Option<(usize, K, T)> = None;
        for (i, shard) in self.shards.iter().enumerate() {
            let shard = shard.lock();
            let Some((k, t)) = shard
                .map
                .iter()
                .map(|(k, slot)| (k, by(&slot.value)))
                .min_by(|a, b| a.1.cmp(&b.1))
            else {
                continue;
            };
            if best.as_ref().is_none_or(|(_, _, current)| t < *current) {
                best = Some((i, k.clone(), t));
            }
        }
        let (i, key, _) = best?;
        let value = self.shards[i].lock().map.remove(&key)?.value;
        Some((key, value))
    }

    /// Remove and return every entry matching `pred`.
    pub fn remove_where(&self, pred: impl Fn(&V) -> bool) -> Vec<(K, V)> {
        let mut removed = Vec::new();
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let keys: Vec<K> = shard
                .map
                .iter()
                .filter(|(_, slot)| pred(&slot.value))
                .map(|(k, _)| k.clone())
                .collect();
            for k in keys {
                if let Some(slot) = shard.map.remove(&k) {
                    removed.push((k, slot.value));
                }
            }
        }
        removed
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shard(key).lock().map.contains_key(key)
    }

    /// Total entries across all shards (not a consistent snapshot).
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upper bound on entries before eviction starts.
    pub fn capacity(&self) -> usize {
        self.per_shard_capacity * self.shards.len()
    }

    /// Clone every entry, one shard at a time.
    pub fn snapshot(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.lock();
            out.extend(shard.map.iter().map(|(k, s)| (k.clone(), s.value.clone())));
        }
        out
    }
}

impl<K, V> std::fmt::Debug for ShardedLru<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries: usize = self.shards.iter().map(|s| s.lock().map.len()).sum();
        f.debug_struct("ShardedLru")
            .field("shards", &self.shards.len())
            .field("per_shard_capacity", &self.per_shard_capacity)
            .field("entries", &entries)
            .finish()
    }
}
