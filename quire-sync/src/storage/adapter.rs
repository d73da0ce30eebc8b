//! Write-through storage adapter.
//!
//! ```text
//!   load ──► cache ── miss ──► backend.get ──► cache
//!   save ──► pin value ──────► backend.put    ── ok ──► unpin
//! remove ──► pin tombstone ──► backend.delete ── ok ──► unpin
//! ```
//!
//! The cache is written before the backend, so a `load` racing a slow
//! `save` already observes the new value. The slot stays pinned while the
//! write is in flight and is released only when the backend confirmed that
//! exact entry. Writes to one key are serialized, so the backend applies them
//! in the order the cache saw them. Whether a failed backend write is
//! swallowed or surfaced is chosen by [`WritePolicy`]; either way the
//! affected slots stay pinned until [`StorageAdapter::flush`] or a later
//! write for the same key succeeds.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

use crate::cache::{CacheEntry, CacheStats, ValueCache, DEFAULT_CACHE_CAPACITY};
use crate::key::{descendant_prefix, joined_is_under, KeyError, StorageKey};

use super::backend::{BackendError, KvBackend};

/// What to do when a backend write or delete fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Log and report success. The cache keeps the new state.
    #[default]
    Swallow,
    /// Retry `write_retries` times, then return the error.
    Propagate,
}

/// Storage adapter configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Unpinned cache entries kept in memory.
    pub cache_capacity: usize,
    /// Upper bound on any single backend call.
    pub backend_timeout: Duration,
    pub write_policy: WritePolicy,
    /// Extra attempts under [`WritePolicy::Propagate`].
    pub write_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            backend_timeout: Duration::from_secs(10),
            write_policy: WritePolicy::Swallow,
            write_retries: 3,
        }
    }
}

impl StorageConfig {
    pub fn for_testing() -> Self {
        Self {
            cache_capacity: 256,
            backend_timeout: Duration::from_millis(500),
            write_policy: WritePolicy::Swallow,
            write_retries: 1,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("{backend} backend error: {source}")]
    Backend {
        backend: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("{backend} backend timed out after {timeout:?}")]
    Timeout {
        backend: &'static str,
        timeout: Duration,
    },
}

/// Cache-fronted adapter over any [`KvBackend`].
pub struct StorageAdapter {
    backend: Arc<dyn KvBackend>,
    cache: ValueCache,
    config: StorageConfig,
    /// Range removals the backend has not confirmed yet.
    removed_ranges: Mutex<Vec<StorageKey>>,
    /// Per-key write locks; entries live while a writer holds or awaits one.
    writers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive backend access for one key.
struct KeyWriteGuard<'a> {
    writers: &'a Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyWriteGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        if writers
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            writers.remove(&self.key);
        }
    }
}

impl StorageAdapter {
    pub fn new(backend: Arc<dyn KvBackend>, config: StorageConfig) -> Self {
        let cache = ValueCache::new(config.cache_capacity);
        Self::with_cache(backend, cache, config)
    }

    /// Use a caller-owned cache (e.g. one shared with instrumentation).
    pub fn with_cache(backend: Arc<dyn KvBackend>, cache: ValueCache, config: StorageConfig) -> Self {
        Self {
            backend,
            cache,
            config,
            removed_ranges: Mutex::new(Vec::new()),
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ─── Point operations ─────────────────────────────────────────────

    /// Cached value, else backend row. `Ok(None)` only when no row exists.
    pub async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError> {
        let joined = key.join();
        match self.cache.get(&joined) {
            Some(CacheEntry::Value(value)) => return Ok(Some(value.as_ref().clone())),
            Some(CacheEntry::Tombstone) => return Ok(None),
            None => {}
        }
        if self.under_removed_range(&joined) {
            return Ok(None);
        }

        // Holding the key lock keeps writes out until the row is cached, so a
        // row read before a write cannot be cached after it.
        let _write = self.write_lock(&joined).await;
        match self.cache.get(&joined) {
            Some(CacheEntry::Value(newer)) => return Ok(Some(newer.as_ref().clone())),
            Some(CacheEntry::Tombstone) => return Ok(None),
            None => {}
        }
        let row = self.call(self.backend.get(&joined)).await?;
        if let Some(value) = &row {
            self.cache.insert(&joined, value.clone());
        }
        Ok(row)
    }

    /// Upsert. The cache is updated before the backend is contacted.
    pub async fn save(&self, key: &StorageKey, value: &[u8]) -> Result<(), StorageError> {
        let joined = key.join();
        let _write = self.write_lock(&joined).await;
        let entry = CacheEntry::Value(Arc::new(value.to_vec()));
        self.cache.pin(&joined, entry.clone());

        let backend = Arc::clone(&self.backend);
        let result = self
            .write_with_policy(&joined, || {
                let backend = Arc::clone(&backend);
                let joined = joined.clone();
                let value = value.to_vec();
                async move { backend.put(&joined, &value).await }
            })
            .await;
        self.settle(&[(joined, entry)], result, "save")
    }

    /// Delete. The cache records a tombstone before the backend is contacted.
    pub async fn remove(&self, key: &StorageKey) -> Result<(), StorageError> {
        let joined = key.join();
        let _write = self.write_lock(&joined).await;
        self.cache.pin(&joined, CacheEntry::Tombstone);

        let backend = Arc::clone(&self.backend);
        let result = self
            .write_with_policy(&joined, || {
                let backend = Arc::clone(&backend);
                let joined = joined.clone();
                async move { backend.delete(&joined).await }
            })
            .await;
        self.settle(&[(joined, CacheEntry::Tombstone)], result, "remove")
    }

    // ─── Range operations ─────────────────────────────────────────────

    /// Every `(key, value)` under `prefix` (segment-aware, `prefix` itself
    /// included). Cache entries win over backend rows; order is unspecified.
    /// Backend rows are returned but not cached: the scan takes no key locks.
    pub async fn load_range(
        &self,
        prefix: &StorageKey,
    ) -> Result<Vec<(StorageKey, Vec<u8>)>, StorageError> {
        let mut resolved: HashMap<String, Option<Vec<u8>>> = HashMap::new();
        for (joined, entry) in self.cache.matching(prefix) {
            let value = match entry {
                CacheEntry::Value(value) => Some(value.as_ref().clone()),
                CacheEntry::Tombstone => None,
            };
            resolved.insert(joined, value);
        }

        for (joined, value) in self.backend_rows_under(prefix).await? {
            if resolved.contains_key(&joined) || self.under_removed_range(&joined) {
                continue;
            }
            let value = match self.cache.get(&joined) {
                Some(CacheEntry::Value(newer)) => Some(newer.as_ref().clone()),
                Some(CacheEntry::Tombstone) => None,
                None => Some(value),
            };
            resolved.insert(joined, value);
        }

        let mut out = Vec::with_capacity(resolved.len());
        for (joined, value) in resolved {
            let Some(value) = value else { continue };
            match StorageKey::parse(&joined) {
                Ok(key) => out.push((key, value)),
                Err(e) => log::warn!("Skipping unparseable storage key {joined:?}: {e}"),
            }
        }
        Ok(out)
    }

    /// Remove every key under `prefix` (segment-aware, `prefix` itself included).
    pub async fn remove_range(&self, prefix: &StorageKey) -> Result<(), StorageError> {
        let mut keys: HashSet<String> = self.cache.tombstone_matching(prefix).into_iter().collect();

        // Tombstone backend-only rows too so eviction order cannot expose them.
        match self.backend_rows_under(prefix).await {
            Ok(rows) => {
                for (joined, _) in rows {
                    self.cache.pin(&joined, CacheEntry::Tombstone);
                    keys.insert(joined);
                }
            }
            Err(e) => log::warn!("remove_range({prefix}): backend scan failed: {e}"),
        }

        let backend = Arc::clone(&self.backend);
        let scan = descendant_prefix(prefix);
        let exact = (!prefix.is_empty()).then(|| prefix.join());
        let result = self
            .write_with_policy(&prefix.to_string(), || {
                let backend = Arc::clone(&backend);
                let scan = scan.clone();
                let exact = exact.clone();
                async move {
                    backend.delete_prefix(&scan).await?;
                    if let Some(exact) = exact {
                        backend.delete(&exact).await?;
                    }
                    Ok(())
                }
            })
            .await;

        if result.is_err() {
            self.lock_ranges().push(prefix.clone());
        }
        let keys: Vec<(String, CacheEntry)> = keys
            .into_iter()
            .map(|key| (key, CacheEntry::Tombstone))
            .collect();
        self.settle(&keys, result, "remove_range")
    }

    /// Retry backend writes for every pinned entry and unconfirmed range
    /// removal. Returns the last failure, if any.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let mut last_err = None;

        let ranges: Vec<StorageKey> = self.lock_ranges().clone();
        for prefix in ranges {
            match self.retry_range_removal(&prefix).await {
                Ok(()) => self.lock_ranges().retain(|p| p != &prefix),
                Err(e) => {
                    log::warn!("flush: range removal {prefix} still failing: {e}");
                    last_err = Some(e);
                }
            }
        }

        for (joined, _) in self.cache.pinned() {
            let _write = self.write_lock(&joined).await;
            // A save that ran before we got the lock may have settled the slot.
            let Some(entry) = self.cache.pinned_entry(&joined) else {
                continue;
            };
            let result = match &entry {
                CacheEntry::Value(value) => self.call(self.backend.put(&joined, value)).await,
                CacheEntry::Tombstone => self.call(self.backend.delete(&joined)).await,
            };
            match result {
                Ok(()) => {
                    if !self.under_removed_range(&joined) {
                        self.cache.unpin_if(&joined, &entry);
                    }
                }
                Err(e) => {
                    log::warn!("flush: {joined} still failing: {e}");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => {
                log::debug!("Storage flushed to {} backend", self.backend.name());
                Ok(())
            }
        }
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Delete backend rows under `prefix` that have not been rewritten since
    /// the failed range removal.
    async fn retry_range_removal(&self, prefix: &StorageKey) -> Result<(), StorageError> {
        for (joined, _) in self.backend_rows_under(prefix).await? {
            if let Some(CacheEntry::Value(_)) = self.cache.get(&joined) {
                continue;
            }
            self.call(self.backend.delete(&joined)).await?;
        }
        Ok(())
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, StorageError> {
        let backend = self.backend.name();
        match tokio::time::timeout(self.config.backend_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(StorageError::Backend { backend, source }),
            Err(_) => Err(StorageError::Timeout {
                backend,
                timeout: self.config.backend_timeout,
            }),
        }
    }

    /// Run a backend write once, or with retries under `Propagate`.
    async fn write_with_policy<F, Fut>(&self, what: &str, op: F) -> Result<(), StorageError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), BackendError>>,
    {
        let attempts = match self.config.write_policy {
            WritePolicy::Swallow => 1,
            WritePolicy::Propagate => 1 + self.config.write_retries,
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.call(op()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    log::debug!("Backend write for {what} failed (attempt {attempt}): {e}");
                    tokio::time::sleep(Duration::from_millis(20 * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release the slots the backend confirmed and apply the policy on
    /// failure. Slots overwritten during the write stay pinned for `flush`.
    fn settle(
        &self,
        written: &[(String, CacheEntry)],
        result: Result<(), StorageError>,
        op: &str,
    ) -> Result<(), StorageError> {
        match result {
            Ok(()) => {
                for (key, entry) in written {
                    // Writes under a pending range removal stay resident; the
                    // range filter would otherwise hide them after eviction.
                    if !self.under_removed_range(key) {
                        self.cache.unpin_if(key, entry);
                    }
                }
                Ok(())
            }
            Err(e) => match self.config.write_policy {
                WritePolicy::Swallow => {
                    log::warn!("{op} of {} key(s) not persisted: {e}", written.len());
                    Ok(())
                }
                WritePolicy::Propagate => {
                    log::error!("{op} of {} key(s) failed: {e}", written.len());
                    Err(e)
                }
            },
        }
    }

    async fn backend_rows_under(
        &self,
        prefix: &StorageKey,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let mut rows = self
            .call(self.backend.scan_prefix(&descendant_prefix(prefix)))
            .await?;
        if !prefix.is_empty() {
            let exact = prefix.join();
            if let Some(value) = self.call(self.backend.get(&exact)).await? {
                rows.push((exact, value));
            }
        }
        rows.retain(|(joined, _)| joined_is_under(joined, prefix));
        Ok(rows)
    }

    /// Wait for exclusive backend access to `joined`.
    async fn write_lock(&self, joined: &str) -> KeyWriteGuard<'_> {
        let lock = Arc::clone(
            self.writers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(joined.to_string())
                .or_default(),
        );
        KeyWriteGuard {
            writers: &self.writers,
            key: joined.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn lock_ranges(&self) -> MutexGuard<'_, Vec<StorageKey>> {
        self.removed_ranges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn under_removed_range(&self, joined: &str) -> bool {
        self.lock_ranges().iter().any(|p| joined_is_under(joined, p))
    }
}
