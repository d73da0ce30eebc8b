//! Quire sync server: WebSocket entry point for `quire-sync`.
//!
//! Configuration comes from the environment:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `QUIRE_BIND_ADDR` | listen address (default `127.0.0.1:9090`) |
//! | `QUIRE_PEER_ID` | server peer id (default: random) |
//! | `QUIRE_DATABASE_URL` | SQLite URL for node ownership, projections and, unless `QUIRE_STORAGE_PATH` is set, documents |
//! | `QUIRE_STORAGE_PATH` | RocksDB directory for documents |
//! | `QUIRE_HANDSHAKE_TIMEOUT_SECS` | WebSocket upgrade and `join` deadline |
//! | `QUIRE_CACHE_CAPACITY` | storage cache entries |
//!
//! Log verbosity follows `RUST_LOG`.

use log::info;
use std::path::PathBuf;
use std::time::Duration;

use quire_sync::{PeerId, ServerConfig, StorageSelection, SyncServer};

/// Build the server configuration from `lookup` (normally `std::env::var`).
fn config_from(lookup: impl Fn(&str) -> Option<String>) -> Result<ServerConfig, String> {
    let mut config = ServerConfig::default();

    if let Some(addr) = lookup("QUIRE_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Some(peer_id) = lookup("QUIRE_PEER_ID") {
        config.network.peer_id = PeerId::new(peer_id);
    }
    if let Some(url) = lookup("QUIRE_DATABASE_URL") {
        config.storage = StorageSelection::Sqlite(url.clone());
        config.access_database_url = Some(url);
    }
    if let Some(path) = lookup("QUIRE_STORAGE_PATH") {
        config.storage = StorageSelection::Rocks(PathBuf::from(path));
    }
    if let Some(secs) = lookup("QUIRE_HANDSHAKE_TIMEOUT_SECS") {
        let secs: u64 = secs
            .parse()
            .map_err(|e| format!("QUIRE_HANDSHAKE_TIMEOUT_SECS={secs:?}: {e}"))?;
        config.network.handshake_timeout = Duration::from_secs(secs);
    }
    if let Some(capacity) = lookup("QUIRE_CACHE_CAPACITY") {
        config.storage_config.cache_capacity = capacity
            .parse()
            .map_err(|e| format!("QUIRE_CACHE_CAPACITY={capacity:?}: {e}"))?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = config_from(|name| std::env::var(name).ok())?;
    info!(
        "Starting Quire sync server on {} as peer {}",
        config.bind_addr, config.network.peer_id
    );

    let server = SyncServer::open(config).await?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    server.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = config_from(env(&[])).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.storage, StorageSelection::Memory);
        assert!(config.access_database_url.is_none());
    }

    #[test]
    fn test_database_url_selects_sqlite() {
        let config = config_from(env(&[
            ("QUIRE_DATABASE_URL", "sqlite://quire.db"),
            ("QUIRE_PEER_ID", "sync-1"),
            ("QUIRE_CACHE_CAPACITY", "128"),
        ]))
        .unwrap();
        assert_eq!(config.storage, StorageSelection::Sqlite("sqlite://quire.db".into()));
        assert_eq!(config.access_database_url.as_deref(), Some("sqlite://quire.db"));
        assert_eq!(config.network.peer_id, PeerId::new("sync-1"));
        assert_eq!(config.storage_config.cache_capacity, 128);
    }

    #[test]
    fn test_storage_path_overrides_document_store() {
        let config = config_from(env(&[
            ("QUIRE_DATABASE_URL", "sqlite://quire.db"),
            ("QUIRE_STORAGE_PATH", "/var/lib/quire"),
            ("QUIRE_HANDSHAKE_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.storage, StorageSelection::Rocks(PathBuf::from("/var/lib/quire")));
        assert_eq!(config.access_database_url.as_deref(), Some("sqlite://quire.db"));
        assert_eq!(config.network.handshake_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_bad_number_is_reported() {
        let err = config_from(env(&[("QUIRE_CACHE_CAPACITY", "lots")])).unwrap_err();
        assert!(err.contains("QUIRE_CACHE_CAPACITY"));
    }
}
