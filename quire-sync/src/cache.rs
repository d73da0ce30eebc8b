//! Bounded write-through value cache for the storage adapter.
//!
//! ```text
//!            ┌───────────────────────────┐
//!  get ────► │ pinned  (not yet durable) │ ─ miss ─┐
//!            └───────────────────────────┘         ▼
//!                                    ┌───────────────────────┐
//!                                    │ LRU  (capacity-bound) │
//!                                    └───────────────────────┘
//! ```
//!
//! Entries are either a value or a tombstone left by a removal. An entry is
//! pinned outside the LRU from the moment its backend write starts until the
//! backend confirms that exact entry, so eviction can neither drop an
//! unpersisted value nor resurrect a row the backend still holds.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::key::{joined_is_under, StorageKey};

/// Default number of LRU entries.
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// A cached slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    Value(Arc<Vec<u8>>),
    /// Removed; the backend may still hold a stale row.
    Tombstone,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheInner {
    lru: LruCache<String, CacheEntry>,
    pinned: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Owned cache object; one per storage adapter.
pub struct ValueCache {
    inner: Mutex<CacheInner>,
}

impl ValueCache {
    /// Create a cache holding at most `capacity` unpinned entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(capacity),
                pinned: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a joined key.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.lock();
        let pinned = inner.pinned.get(key).cloned();
        let found = pinned.or_else(|| inner.lru.get(key).cloned());
        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Store a value. A pinned slot for the key is updated in place.
    pub fn insert(&self, key: &str, value: Vec<u8>) {
        self.put(key, CacheEntry::Value(Arc::new(value)));
    }

    fn put(&self, key: &str, entry: CacheEntry) {
        let mut inner = self.lock();
        if let Some(slot) = inner.pinned.get_mut(key) {
            *slot = entry;
            return;
        }
        inner.lru.put(key.to_string(), entry);
    }

    /// Hold `entry` for `key` outside the LRU until [`unpin_if`](Self::unpin_if),
    /// whether or not the key is still cached.
    pub fn pin(&self, key: &str, entry: CacheEntry) {
        let mut inner = self.lock();
        inner.lru.pop(key);
        inner.pinned.insert(key.to_string(), entry);
    }

    /// Return the pinned slot for `key` to the LRU if it still holds
    /// `expected`. `false` if the slot changed or is not pinned.
    pub fn unpin_if(&self, key: &str, expected: &CacheEntry) -> bool {
        let mut inner = self.lock();
        if inner.pinned.get(key) != Some(expected) {
            return false;
        }
        if let Some(entry) = inner.pinned.remove(key) {
            inner.lru.put(key.to_string(), entry);
        }
        true
    }

    /// Current pinned slot for `key`.
    pub fn pinned_entry(&self, key: &str) -> Option<CacheEntry> {
        self.lock().pinned.get(key).cloned()
    }

    /// Snapshot of pinned entries, for retrying backend writes.
    pub fn pinned(&self) -> Vec<(String, CacheEntry)> {
        self.lock()
            .pinned
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// All entries (values and tombstones) under `prefix`.
    pub fn matching(&self, prefix: &StorageKey) -> Vec<(String, CacheEntry)> {
        let inner = self.lock();
        inner
            .pinned
            .iter()
            .chain(inner.lru.iter())
            .filter(|(k, _)| joined_is_under(k, prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Pin a tombstone over every entry under `prefix`, returning the
    /// affected keys.
    pub fn tombstone_matching(&self, prefix: &StorageKey) -> Vec<String> {
        let keys: Vec<String> = self
            .matching(prefix)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        for key in &keys {
            self.pin(key, CacheEntry::Tombstone);
        }
        keys
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.lru.len() + inner.pinned.len(),
            pinned: inner.pinned.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().lru.cap().get()
    }
}

impl Default for ValueCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
