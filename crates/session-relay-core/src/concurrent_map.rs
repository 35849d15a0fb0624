//! Lock-striped map shared by the lease cache and the in-memory store.
//!
//! Entries are spread over independent `RwLock<HashMap>` stripes chosen by
//! key hash, so traffic for unrelated session ids does not serialize on one
//! lock. Every compound operation ([`ShardedMap::insert_if_absent`],
//! [`ShardedMap::remove_if`], [`ShardedMap::write_with`]) runs under a
//! single stripe write lock and is therefore atomic for its key.
//!
//! Poisoned stripes are recovered rather than propagated: the maps hold
//! plain data and stay consistent after a panicking reader.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::hash::{Hash, Hasher};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const DEFAULT_STRIPES: usize = 64;
const MAX_STRIPES: usize = 256;

// Padded so neighbouring stripe locks do not share a cache line.
#[repr(align(128))]
struct Stripe<K, V> {
    map: RwLock<HashMap<K, V>>,
}

/// Concurrent map keyed by session id (or anything `Hash + Eq`).
pub struct ShardedMap<K, V> {
    stripes: Box<[Stripe<K, V>]>,
}

impl<K, V> std::fmt::Debug for ShardedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedMap")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq,
{
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_STRIPES)
    }

    /// `n` is clamped to `1..=256`.
    #[must_use]
    pub fn with_shards(n: usize) -> Self {
        let stripes = (0..n.clamp(1, MAX_STRIPES))
            .map(|_| Stripe {
                map: RwLock::new(HashMap::new()),
            })
            .collect();
        Self { stripes }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.stripes.len()
    }

    // `Borrow` guarantees `Q` hashes like `K`, so borrowed lookups pick the
    // same stripe as the owned insert did.
    fn stripe<Q>(&self, key: &Q) -> &RwLock<HashMap<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.stripes.len();
        &self.stripes[idx].map
    }

    fn read<Q>(&self, key: &Q) -> RwLockReadGuard<'_, HashMap<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.stripe(key).read().unwrap_or_else(|e| e.into_inner())
    }

    fn write<Q>(&self, key: &Q) -> RwLockWriteGuard<'_, HashMap<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.stripe(key).write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.write(&key).insert(key, value)
    }

    /// Returns `false`, leaving the stored value alone, when `key` is taken.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let mut guard = self.write(&key);
        match guard.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.read(key).get(key).cloned()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.read(key).contains_key(key)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.write(key).remove(key)
    }

    /// Removes `key` only when `predicate` accepts its current value.
    pub fn remove_if<Q, F>(&self, key: &Q, predicate: F) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> bool,
    {
        let mut guard = self.write(key);
        if guard.get(key).is_some_and(predicate) {
            guard.remove(key)
        } else {
            None
        }
    }

    /// Runs `f` against the value without cloning it. `None` when absent.
    pub fn read_with<Q, F, R>(&self, key: &Q, f: F) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> R,
    {
        self.read(key).get(key).map(f)
    }

    pub fn write_with<Q, F, R>(&self, key: &Q, f: F) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V) -> R,
    {
        self.write(key).get_mut(key).map(f)
    }

    /// Sums every stripe; not a consistent snapshot under concurrent writes.
    pub fn len(&self) -> usize {
        self.stripes
            .iter()
            .map(|s| s.map.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes
            .iter()
            .all(|s| s.map.read().unwrap_or_else(|e| e.into_inner()).is_empty())
    }

    /// Stripes are visited one at a time, each under its own write lock.
    pub fn retain<F>(&self, mut f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        for stripe in self.stripes.iter() {
            stripe
                .map
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|k, v| f(k, v));
        }
    }
}

impl<K: Hash + Eq, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
