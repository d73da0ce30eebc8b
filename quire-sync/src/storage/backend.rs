//! Key/value backend capability consumed by the storage adapter.

use async_trait::async_trait;

/// Errors raised by a backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("database error: {0}")]
    Database(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid backend configuration: {0}")]
    Config(String),
}

impl From<sqlx::Error> for BackendError {
    fn from(e: sqlx::Error) -> Self {
        BackendError::Database(e.to_string())
    }
}

impl From<rocksdb::Error> for BackendError {
    fn from(e: rocksdb::Error) -> Self {
        BackendError::Database(e.to_string())
    }
}

/// A flat table of `(key, value)` rows with prefix scans.
///
/// Keys are already-joined storage keys. Prefix operations are plain string
/// prefix matches; segment awareness is the adapter's job.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Point select. `Ok(None)` when no row exists.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Upsert.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), BackendError>;

    /// Point delete. Deleting a missing row is not an error.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// All rows whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, BackendError>;

    /// Delete all rows whose key starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<(), BackendError>;

    /// Short name for log lines.
    fn name(&self) -> &'static str;
}
