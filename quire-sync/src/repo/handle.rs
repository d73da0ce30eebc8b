//! In-memory state of one document.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use yrs::{Doc, GetString, ReadTxn, Transact};

use crate::key::StorageKey;
use crate::projection::ProjectedFields;
use crate::protocol::{DocumentId, PeerId};
use crate::sync;

/// Persistence bookkeeping, guarded by the handle's write lock.
#[derive(Debug, Default)]
pub(crate) struct ChunkState {
    /// Every stored chunk that makes up the current state.
    pub chunks: Vec<StorageKey>,
    /// Incremental chunks written since the last snapshot.
    pub incremental: usize,
}

/// A shared, loaded document.
///
/// Obtained from the [`Repository`](super::Repository); the same `Arc` is
/// handed to every caller asking for the same id. Read through [`doc`](Self::doc);
/// edits go through [`Repository::change`](super::Repository::change) so they
/// are persisted and propagated.
pub struct DocHandle {
    id: DocumentId,
    doc: Doc,
    /// Serializes apply + persist for this document.
    pub(crate) write: tokio::sync::Mutex<ChunkState>,
    version: watch::Sender<u64>,
    /// Per open `request`: the asked peers that have not answered yet.
    awaiting: Mutex<HashMap<u64, HashSet<PeerId>>>,
    next_request: AtomicU64,
    last_projection: Mutex<Option<ProjectedFields>>,
}

impl DocHandle {
    pub(crate) fn new(id: DocumentId, doc: Doc, chunks: ChunkState) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            id,
            doc,
            write: tokio::sync::Mutex::new(chunks),
            version,
            awaiting: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(0),
            last_projection: Mutex::new(None),
        }
    }

    pub(crate) fn empty(id: DocumentId) -> Self {
        Self::new(id, Doc::new(), ChunkState::default())
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// No content has been created or received yet.
    pub fn is_empty(&self) -> bool {
        sync::is_empty(&self.doc)
    }

    /// Number of changes applied since the handle was loaded.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Watch the change counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Contents of the root text `name` (empty if it does not exist).
    pub fn text(&self, name: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(name)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    pub fn full_state(&self) -> Vec<u8> {
        sync::full_state(&self.doc)
    }

    pub(crate) fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn lock_awaiting(&self) -> MutexGuard<'_, HashMap<u64, HashSet<PeerId>>> {
        self.awaiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a request waiting on `peers`. Pair with [`end_request`](Self::end_request).
    pub(crate) fn begin_request(&self, peers: impl IntoIterator<Item = PeerId>) -> u64 {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.lock_awaiting().insert(id, peers.into_iter().collect());
        id
    }

    /// `peer` has nothing for us. Wakes waiting requests.
    pub(crate) fn peer_unavailable(&self, peer: &PeerId) {
        let mut answered = false;
        for peers in self.lock_awaiting().values_mut() {
            answered |= peers.remove(peer);
        }
        if answered {
            self.version.send_modify(|_| {});
        }
    }

    /// Whether request `id` still waits on at least one peer.
    pub(crate) fn has_awaiting_peers(&self, id: u64) -> bool {
        self.lock_awaiting()
            .get(&id)
            .is_some_and(|peers| !peers.is_empty())
    }

    pub(crate) fn end_request(&self, id: u64) {
        self.lock_awaiting().remove(&id);
    }

    /// Record `fields` as projected. `false` if they match the last projection.
    pub(crate) fn replace_projection(&self, fields: &ProjectedFields) -> bool {
        let mut last = self
            .last_projection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last.as_ref() == Some(fields) {
            return false;
        }
        *last = Some(fields.clone());
        true
    }
}

impl std::fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocHandle")
            .field("id", &self.id)
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_dedup() {
        let handle = DocHandle::empty(DocumentId::new("d"));
        let fields = ProjectedFields {
            title: Some("a".into()),
            cover_image: None,
        };
        assert!(handle.replace_projection(&fields));
        assert!(!handle.replace_projection(&fields));
        assert!(handle.replace_projection(&ProjectedFields::default()));
    }

    #[tokio::test]
    async fn test_unavailable_wakes_watchers() {
        let handle = DocHandle::empty(DocumentId::new("d"));
        let mut rx = handle.subscribe();
        let request = handle.begin_request([PeerId::new("a")]);
        assert!(handle.has_awaiting_peers(request));

        handle.peer_unavailable(&PeerId::new("a"));
        rx.changed().await.unwrap();
        assert!(!handle.has_awaiting_peers(request));
        assert_eq!(handle.version(), 0);
    }

    #[test]
    fn test_requests_keep_separate_waiters() {
        let handle = DocHandle::empty(DocumentId::new("d"));
        let first = handle.begin_request([PeerId::new("a")]);
        let second = handle.begin_request([PeerId::new("a"), PeerId::new("b")]);

        handle.end_request(first);
        assert!(!handle.has_awaiting_peers(first));
        assert!(handle.has_awaiting_peers(second));

        handle.peer_unavailable(&PeerId::new("a"));
        assert!(handle.has_awaiting_peers(second));
        handle.peer_unavailable(&PeerId::new("b"));
        assert!(!handle.has_awaiting_peers(second));
        handle.end_request(second);
        assert!(handle.lock_awaiting().is_empty());
    }
}
