//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                  ┌──────────────────┐
//!             ├── WebSocket ───►│  NetworkAdapter  │──events──► Repository
//! Client B ──┘   (accept,       │  (handshake,     │               │
//!                 bounded)      │   per-peer task) │◄── send ──────┤
//!                               └──────────────────┘               │
//!                                                 ┌────────────────┼───────────────┐
//!                                                 ▼                ▼               ▼
//!                                          StorageAdapter     SharePolicy   ProjectionSink
//!                                       (memory/rocks/sqlite) (node ACL)    (nodes table)
//! ```
//!
//! The server owns nothing beyond wiring: every accepted TCP connection is
//! upgraded to a WebSocket (bounded by the handshake timeout) and handed to
//! the network adapter; all document logic lives in the repository.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::network::{NetworkAdapter, NetworkConfig, NetworkEvent};
use crate::policy::{AllowAll, NodeAccessPolicy, SharePolicy, SqlAccessStore};
use crate::projection::{NoProjection, ProjectionSink, SqlProjectionSink};
use crate::repo::{RepoConfig, RepoError, Repository};
use crate::storage::sql::open_pool;
use crate::storage::{
    BackendError, KvBackend, MemoryBackend, RocksBackend, RocksConfig, SqlBackend, SqlConfig,
    StorageAdapter, StorageConfig,
};
use crate::transport::WebSocketTransport;

/// Where documents are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageSelection {
    /// Lost on restart.
    #[default]
    Memory,
    /// Embedded RocksDB at this path.
    Rocks(PathBuf),
    /// SQLite database URL, e.g. `sqlite://quire.db`.
    Sqlite(String),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub storage: StorageSelection,
    /// Relational database holding node ownership and receiving projections.
    /// `None` shares every document with every peer.
    pub access_database_url: Option<String>,
    pub storage_config: StorageConfig,
    pub network: NetworkConfig,
    pub repo: RepoConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage: StorageSelection::Memory,
            access_database_url: None,
            storage_config: StorageConfig::default(),
            network: NetworkConfig::default(),
            repo: RepoConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_config: StorageConfig::for_testing(),
            network: NetworkConfig::for_testing("server"),
            repo: RepoConfig::for_testing(),
            ..Self::default()
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// TCP connections that never completed the WebSocket upgrade.
    pub failed_upgrades: u64,
    pub peers: usize,
    pub open_documents: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    failed_upgrades: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    repo: Repository,
    network: NetworkAdapter,
    counters: Arc<Counters>,
}

impl SyncServer {
    /// Build storage, access policy and projection from `config`.
    pub async fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let mut storage_pool = None;
        let backend: Arc<dyn KvBackend> = match &config.storage {
            StorageSelection::Memory => {
                log::warn!("Using in-memory storage; documents are lost on restart");
                Arc::new(MemoryBackend::new())
            }
            StorageSelection::Rocks(path) => Arc::new(RocksBackend::open(RocksConfig {
                path: path.clone(),
                ..RocksConfig::default()
            })?),
            StorageSelection::Sqlite(url) => {
                let backend = SqlBackend::connect(url, SqlConfig::default()).await?;
                storage_pool = Some((url.clone(), backend.pool().clone()));
                Arc::new(backend)
            }
        };
        log::info!("Document storage: {}", backend.name());
        let storage = StorageAdapter::new(backend, config.storage_config.clone());

        let (policy, projection): (Arc<dyn SharePolicy>, Arc<dyn ProjectionSink>) =
            match &config.access_database_url {
                Some(url) => {
                    let pool = match &storage_pool {
                        Some((storage_url, pool)) if storage_url == url => pool.clone(),
                        _ => open_pool(url, SqlConfig::default().max_connections).await?,
                    };
                    (
                        Arc::new(NodeAccessPolicy::new(SqlAccessStore::new(pool.clone()))),
                        Arc::new(SqlProjectionSink::new(pool)),
                    )
                }
                None => {
                    log::warn!("No access database configured; sharing every document with every peer");
                    (Arc::new(AllowAll), Arc::new(NoProjection))
                }
            };

        let repo = Repository::with_projection(storage, policy, projection, config.repo.clone());
        let (network, events) = NetworkAdapter::new(config.network.clone());
        Ok(Self::with_components(config, repo, network, events))
    }

    /// Assemble a server around an existing repository and adapter.
    pub fn with_components(
        config: ServerConfig,
        repo: Repository,
        network: NetworkAdapter,
        events: mpsc::UnboundedReceiver<NetworkEvent>,
    ) -> Self {
        repo.add_network_adapter(network.clone(), events);
        Self {
            config,
            repo,
            network,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn network(&self) -> &NetworkAdapter {
        &self.network
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            failed_upgrades: self.counters.failed_upgrades.load(Ordering::Relaxed),
            peers: self.repo.peers().len(),
            open_documents: self.repo.open_documents(),
        }
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let network = self.network.clone();
            let counters = Arc::clone(&self.counters);
            let upgrade_timeout = self.config.network.handshake_timeout;
            tokio::spawn(async move {
                Self::handle_connection(stream, addr, network, counters, upgrade_timeout).await;
            });
        }
    }

    /// Upgrade one TCP connection and run it to completion.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        network: NetworkAdapter,
        counters: Arc<Counters>,
        upgrade_timeout: Duration,
    ) {
        let ws = match tokio::time::timeout(upgrade_timeout, tokio_tungstenite::accept_async(stream)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                log::warn!("WebSocket upgrade from {addr} failed: {e}");
                counters.failed_upgrades.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(_) => {
                log::warn!("WebSocket upgrade from {addr} timed out after {upgrade_timeout:?}");
                counters.failed_upgrades.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        log::info!("WebSocket connection established from {addr}");

        counters.total_connections.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = network.accept(WebSocketTransport::new(ws)).await {
            log::error!("Connection task for {addr} failed: {e}");
        }
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::debug!("Connection from {addr} closed");
    }

    /// Close every peer connection and flush storage.
    pub async fn shutdown(&self) -> Result<(), RepoError> {
        log::info!("Sync server shutting down");
        self.repo.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn start(config: ServerConfig) -> (Arc<SyncServer>, SocketAddr) {
        let server = Arc::new(SyncServer::open(config).await.unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });
        (server, addr)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.storage, StorageSelection::Memory);
        assert!(config.access_database_url.is_none());
    }

    #[tokio::test]
    async fn test_websocket_client_registers() {
        let (server, addr) = start(ServerConfig::for_testing()).await;
        let (client, _events) = NetworkAdapter::new(NetworkConfig::for_testing("peer-1:client"));

        let remote = client.connect_websocket(&format!("ws://{addr}")).await.unwrap();
        assert_eq!(remote.as_str(), "server");
        wait_until(|| server.stats().peers == 1).await;

        let stats = server.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.active_connections, 1);

        client.close_all().await;
        wait_until(|| server.stats().active_connections == 0).await;
        assert_eq!(server.stats().peers, 0);
    }

    #[tokio::test]
    async fn test_non_websocket_connection_counts_as_failed_upgrade() {
        let (server, addr) = start(ServerConfig::for_testing()).await;
        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        drop(raw);

        wait_until(|| server.stats().failed_upgrades == 1).await;
        assert_eq!(server.stats().total_connections, 0);
    }

    #[tokio::test]
    async fn test_sqlite_storage_and_access_share_one_pool() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("quire.db").display());
        let config = ServerConfig {
            storage: StorageSelection::Sqlite(url.clone()),
            access_database_url: Some(url),
            ..ServerConfig::for_testing()
        };
        let server = SyncServer::open(config).await.unwrap();
        assert_eq!(server.repository().storage().backend().name(), "sqlite");
    }

    #[tokio::test]
    async fn test_rocks_storage_selection() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage: StorageSelection::Rocks(dir.path().join("rocks")),
            ..ServerConfig::for_testing()
        };
        let server = SyncServer::open(config).await.unwrap();
        assert_eq!(server.repository().storage().backend().name(), "rocksdb");
    }
}
