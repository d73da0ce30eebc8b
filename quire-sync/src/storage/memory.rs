//! In-process backend.
//!
//! Used for ephemeral deployments and as the test double for the durable
//! backends: reads and writes can be made to fail or to stall, and point
//! reads are counted.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use super::backend::{BackendError, KvBackend};

/// Ordered in-memory table.
#[derive(Default)]
pub struct MemoryBackend {
    rows: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    /// Artificial latency applied to every operation, in milliseconds.
    latency_ms: AtomicU64,
    reads: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read fail until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write and delete fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of point reads and scans served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Direct row access, bypassing fault injection.
    pub async fn row(&self, key: &str) -> Option<Vec<u8>> {
        self.rows.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn before_read(&self) -> Result<(), BackendError> {
        self.delay().await;
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("injected read failure".into()));
        }
        Ok(())
    }

    async fn before_write(&self) -> Result<(), BackendError> {
        self.delay().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.before_read().await?;
        Ok(self.rows.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        self.before_write().await?;
        self.rows.write().await.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.before_write().await?;
        self.rows.write().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, BackendError> {
        self.before_read().await?;
        let rows = self.rows.read().await;
        Ok(rows
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), BackendError> {
        self.before_write().await?;
        self.rows.write().await.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
