//! Share policy: may peer P learn about / receive document D?
//!
//! The repository asks on every dissemination decision and never caches the
//! answer, so access revoked mid-session takes effect on the next decision.
//! Every failure mode (error, panic, timeout) counts as "no"; see [`authorize`].
//!
//! The node policy maps peer ids of the form `peer-<principal>:<nonce>` to a
//! numeric principal and asks an [`AccessStore`] whether that principal owns or
//! collaborates on the node holding the document.

use async_trait::async_trait;
use futures_util::FutureExt;
use sqlx::sqlite::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use crate::protocol::{DocumentId, PeerId};

/// Peer ids shorter than this are rejected as untrusted.
pub const MIN_PEER_ID_LEN: usize = 8;

const PEER_PREFIX: &str = "peer-";

/// Access decision errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("malformed peer id {0:?}")]
    MalformedPeerId(String),
    #[error("access store error: {0}")]
    Store(String),
}

impl From<sqlx::Error> for AccessError {
    fn from(e: sqlx::Error) -> Self {
        AccessError::Store(e.to_string())
    }
}

/// Per-(peer, document) access decision.
#[async_trait]
pub trait SharePolicy: Send + Sync {
    async fn should_share(&self, peer: &PeerId, document: &DocumentId) -> Result<bool, AccessError>;
}

/// Shares everything with everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl SharePolicy for AllowAll {
    async fn should_share(&self, _peer: &PeerId, _document: &DocumentId) -> Result<bool, AccessError> {
        Ok(true)
    }
}

/// Shares nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl SharePolicy for DenyAll {
    async fn should_share(&self, _peer: &PeerId, _document: &DocumentId) -> Result<bool, AccessError> {
        Ok(false)
    }
}

/// Fail-closed wrapper around a policy call: errors, panics and timeouts
/// all deny, and the reason is logged.
pub async fn authorize(
    policy: &dyn SharePolicy,
    peer: &PeerId,
    document: &DocumentId,
    timeout: Duration,
) -> bool {
    let call = AssertUnwindSafe(policy.should_share(peer, document)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(Ok(allowed))) => {
            if !allowed {
                log::debug!("Policy denied {document} to {peer}");
            }
            allowed
        }
        Ok(Ok(Err(e))) => {
            log::warn!("Policy error for {document} / {peer}, denying: {e}");
            false
        }
        Ok(Err(_)) => {
            log::error!("Policy panicked for {document} / {peer}, denying");
            false
        }
        Err(_) => {
            log::warn!("Policy timed out after {timeout:?} for {document} / {peer}, denying");
            false
        }
    }
}

// ─── Node ownership policy ────────────────────────────────────────────

/// Principal parsed from a `peer-<id>:<nonce>` peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPrincipal {
    pub principal_id: u64,
    pub session: String,
}

impl PeerPrincipal {
    pub fn parse(peer: &PeerId) -> Result<Self, AccessError> {
        let raw = peer.as_str();
        let malformed = || AccessError::MalformedPeerId(raw.to_string());
        if raw.len() < MIN_PEER_ID_LEN {
            return Err(malformed());
        }
        let rest = raw.strip_prefix(PEER_PREFIX).ok_or_else(malformed)?;
        let (id, session) = rest.split_once(':').ok_or_else(malformed)?;
        if session.is_empty() {
            return Err(malformed());
        }
        let principal_id = id.parse::<u64>().map_err(|_| malformed())?;
        Ok(Self {
            principal_id,
            session: session.to_string(),
        })
    }
}

/// Ownership / collaborator lookup.
#[async_trait]
pub trait AccessStore: Send + Sync {
    async fn can_access(&self, principal_id: u64, document: &DocumentId) -> Result<bool, AccessError>;
}

/// Policy backed by node ownership in an [`AccessStore`].
pub struct NodeAccessPolicy<S> {
    store: S,
}

impl<S: AccessStore> NodeAccessPolicy<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: AccessStore> SharePolicy for NodeAccessPolicy<S> {
    async fn should_share(&self, peer: &PeerId, document: &DocumentId) -> Result<bool, AccessError> {
        let principal = PeerPrincipal::parse(peer)?;
        self.store.can_access(principal.principal_id, document).await
    }
}

#[derive(Debug, Default)]
struct NodeAcl {
    owner: Option<u64>,
    collaborators: HashSet<u64>,
}

/// In-memory ownership table.
#[derive(Debug, Default)]
pub struct AccessTable {
    nodes: RwLock<HashMap<DocumentId, NodeAcl>>,
}

impl AccessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_owner(&self, document: &DocumentId, owner: u64) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.entry(document.clone()).or_default().owner = Some(owner);
    }

    pub fn add_collaborator(&self, document: &DocumentId, principal_id: u64) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes
            .entry(document.clone())
            .or_default()
            .collaborators
            .insert(principal_id);
    }

    pub fn remove_collaborator(&self, document: &DocumentId, principal_id: u64) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(acl) = nodes.get_mut(document) {
            acl.collaborators.remove(&principal_id);
        }
    }
}

#[async_trait]
impl AccessStore for AccessTable {
    async fn can_access(&self, principal_id: u64, document: &DocumentId) -> Result<bool, AccessError> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        Ok(nodes.get(document).is_some_and(|acl| {
            acl.owner == Some(principal_id) || acl.collaborators.contains(&principal_id)
        }))
    }
}

/// Default ownership query: `?1` is the document id, `?2` the principal id.
pub const DEFAULT_ACCESS_QUERY: &str = "\
SELECT 1 FROM nodes n \
WHERE n.document_id = ?1 \
  AND (n.owner_id = ?2 \
       OR EXISTS (SELECT 1 FROM node_collaborators c WHERE c.node_id = n.id AND c.user_id = ?2)) \
LIMIT 1";

/// Ownership lookup against the relational store.
pub struct SqlAccessStore {
    pool: SqlitePool,
    query: String,
}

impl SqlAccessStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_query(pool, DEFAULT_ACCESS_QUERY)
    }

    /// Custom statement returning at least one row iff access is granted.
    pub fn with_query(pool: SqlitePool, query: impl Into<String>) -> Self {
        Self {
            pool,
            query: query.into(),
        }
    }
}

#[async_trait]
impl AccessStore for SqlAccessStore {
    async fn can_access(&self, principal_id: u64, document: &DocumentId) -> Result<bool, AccessError> {
        let principal = i64::try_from(principal_id)
            .map_err(|_| AccessError::Store(format!("principal id {principal_id} out of range")))?;
        let row = sqlx::query(&self.query)
            .bind(document.as_str())
            .bind(principal)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl SharePolicy for Failing {
        async fn should_share(&self, _: &PeerId, _: &DocumentId) -> Result<bool, AccessError> {
            Err(AccessError::Store("connection refused".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl SharePolicy for Panicking {
        async fn should_share(&self, _: &PeerId, _: &DocumentId) -> Result<bool, AccessError> {
            panic!("policy bug")
        }
    }

    struct Stalling;

    #[async_trait]
    impl SharePolicy for Stalling {
        async fn should_share(&self, _: &PeerId, _: &DocumentId) -> Result<bool, AccessError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(true)
        }
    }

    fn ids() -> (PeerId, DocumentId) {
        (PeerId::new("peer-7:abc"), DocumentId::new("d1"))
    }

    #[test]
    fn test_parse_principal() {
        let principal = PeerPrincipal::parse(&PeerId::new("peer-42:nonce")).unwrap();
        assert_eq!(principal.principal_id, 42);
        assert_eq!(principal.session, "nonce");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in ["peer-1", "peer-1:", "peer-x:abc", "user-12:abc", "p-1:a", "peer-:abc"] {
            assert!(
                PeerPrincipal::parse(&PeerId::new(raw)).is_err(),
                "{raw} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_authorize_fails_closed() {
        let (peer, doc) = ids();
        let timeout = Duration::from_millis(50);
        assert!(authorize(&AllowAll, &peer, &doc, timeout).await);
        assert!(!authorize(&DenyAll, &peer, &doc, timeout).await);
        assert!(!authorize(&Failing, &peer, &doc, timeout).await);
        assert!(!authorize(&Panicking, &peer, &doc, timeout).await);
        assert!(!authorize(&Stalling, &peer, &doc, timeout).await);
    }

    #[test]
    fn test_release_build_unwinds() {
        // Panics must unwind for `authorize` to catch them in release builds too.
        let manifest = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../Cargo.toml"));
        assert!(!manifest
            .lines()
            .any(|line| line.replace(' ', "").starts_with("panic=\"abort\"")));
    }

    #[tokio::test]
    async fn test_node_policy_with_table() {
        let table = AccessTable::new();
        let doc = DocumentId::new("d1");
        table.set_owner(&doc, 1);
        table.add_collaborator(&doc, 2);
        let policy = NodeAccessPolicy::new(table);

        assert!(policy.should_share(&PeerId::new("peer-1:s"), &doc).await.unwrap());
        assert!(policy.should_share(&PeerId::new("peer-2:s"), &doc).await.unwrap());
        assert!(!policy.should_share(&PeerId::new("peer-3:s"), &doc).await.unwrap());
        assert!(!policy
            .should_share(&PeerId::new("peer-1:s"), &DocumentId::new("other"))
            .await
            .unwrap());
        assert!(policy.should_share(&PeerId::new("garbage"), &doc).await.is_err());

        policy.store().remove_collaborator(&doc, 2);
        assert!(!policy.should_share(&PeerId::new("peer-2:s"), &doc).await.unwrap());
    }

    #[tokio::test]
    async fn test_sql_access_store() {
        let pool = crate::storage::sql::open_pool("sqlite::memory:", 1).await.unwrap();
        sqlx::query("CREATE TABLE nodes (id INTEGER PRIMARY KEY, document_id TEXT, owner_id INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE node_collaborators (node_id INTEGER, user_id INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO nodes (id, document_id, owner_id) VALUES (1, 'd1', 10)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO node_collaborators (node_id, user_id) VALUES (1, 20)")
            .execute(&pool)
            .await
            .unwrap();

        let store = SqlAccessStore::new(pool);
        let doc = DocumentId::new("d1");
        assert!(store.can_access(10, &doc).await.unwrap());
        assert!(store.can_access(20, &doc).await.unwrap());
        assert!(!store.can_access(30, &doc).await.unwrap());
        assert!(!store.can_access(10, &DocumentId::new("d2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_sql_store_error_denies() {
        let pool = crate::storage::sql::open_pool("sqlite::memory:", 1).await.unwrap();
        // No tables: every lookup errors.
        let policy = NodeAccessPolicy::new(SqlAccessStore::new(pool));
        let (peer, doc) = ids();
        assert!(policy.should_share(&peer, &doc).await.is_err());
        assert!(!authorize(&policy, &peer, &doc, Duration::from_secs(1)).await);
    }
}
