//! Relational backend: one `(key, value)` table in SQLite via sqlx.
//!
//! ```text
//! CREATE TABLE sync_storage (
//!     key   TEXT PRIMARY KEY,
//!     value BLOB NOT NULL
//! )
//! ```
//!
//! Prefix operations compare `substr(key, 1, n)` instead of using `LIKE`:
//! SQLite's `LIKE` folds ASCII case and treats `%`/`_` in keys as wildcards.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use super::backend::{BackendError, KvBackend};

/// SQL backend configuration.
#[derive(Debug, Clone)]
pub struct SqlConfig {
    /// Table holding the rows. Must be a plain identifier.
    pub table: String,
    /// Pool size for file-backed databases.
    pub max_connections: u32,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            table: "sync_storage".to_string(),
            max_connections: 5,
        }
    }
}

struct Statements {
    create: String,
    select: String,
    upsert: String,
    delete: String,
    scan: String,
    delete_prefix: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {table} (key TEXT PRIMARY KEY NOT NULL, value BLOB NOT NULL)"
            ),
            select: format!("SELECT value FROM {table} WHERE key = ?1"),
            upsert: format!(
                "INSERT INTO {table} (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value"
            ),
            delete: format!("DELETE FROM {table} WHERE key = ?1"),
            scan: format!("SELECT key, value FROM {table} WHERE substr(key, 1, ?2) = ?1"),
            delete_prefix: format!("DELETE FROM {table} WHERE substr(key, 1, ?2) = ?1"),
        }
    }
}

/// SQLite-backed key/value table.
pub struct SqlBackend {
    pool: SqlitePool,
    table: String,
    sql: Statements,
}

impl SqlBackend {
    /// Wrap an existing pool. The table is not created; see [`SqlBackend::migrate`].
    pub fn new(pool: SqlitePool, config: SqlConfig) -> Result<Self, BackendError> {
        validate_identifier(&config.table)?;
        Ok(Self {
            pool,
            sql: Statements::for_table(&config.table),
            table: config.table,
        })
    }

    /// Open a pool for `url` (e.g. `sqlite://data/sync.db` or `sqlite::memory:`)
    /// and create the table if missing.
    pub async fn connect(url: &str, config: SqlConfig) -> Result<Self, BackendError> {
        let pool = open_pool(url, config.max_connections).await?;
        let backend = Self::new(pool, config)?;
        backend.migrate().await?;
        Ok(backend)
    }

    /// Create the table if it does not exist.
    pub async fn migrate(&self) -> Result<(), BackendError> {
        sqlx::query(&self.sql.create).execute(&self.pool).await?;
        log::debug!("SQL storage table '{}' ready", self.table);
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

/// Open a SQLite pool. In-memory databases are pinned to a single
/// connection that is never recycled, since each connection would otherwise
/// see its own empty database.
pub async fn open_pool(url: &str, max_connections: u32) -> Result<SqlitePool, BackendError> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| BackendError::Config(format!("invalid database url '{url}': {e}")))?
        .create_if_missing(true);

    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?
    };
    Ok(pool)
}

fn validate_identifier(name: &str) -> Result<(), BackendError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(BackendError::Config(format!("invalid table name '{name}'")))
    }
}

fn char_len(prefix: &str) -> i64 {
    prefix.chars().count() as i64
}

#[async_trait]
impl KvBackend for SqlBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let value = sqlx::query_scalar::<_, Vec<u8>>(&self.sql.select)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        sqlx::query(&self.sql.upsert)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        sqlx::query(&self.sql.delete)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, BackendError> {
        let rows = sqlx::query_as::<_, (String, Vec<u8>)>(&self.sql.scan)
            .bind(prefix)
            .bind(char_len(prefix))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), BackendError> {
        sqlx::query(&self.sql.delete_prefix)
            .bind(prefix)
            .bind(char_len(prefix))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
