//! Repository: documents, peers and sharing decisions.
//!
//! Architecture:
//! ```text
//!  NetworkAdapter ──events──► pump ──► per-peer inbox ──► worker (in order)
//!        ▲                                                   │
//!        │                              ┌────────────────────┤
//!        │                              ▼                    ▼
//!        │                       SharePolicy           DocHandle (Yrs Doc)
//!        │                       (fail closed)               │
//!        │                                        ┌──────────┼────────────┐
//!        └────────── propagate ◄──────────────────┤   StorageAdapter  ProjectionSink
//!                                                 │   (chunks)        (best effort)
//! ```
//!
//! Every peer gets its own worker task, so messages from one peer are handled
//! in receipt order while other peers proceed independently. Document state
//! is shared through [`DocHandle`]s; concurrent first loads of one id are
//! coalesced into a single backend read and a single handle.
//!
//! The share policy is consulted on every dissemination decision: answering a
//! sync or request, announcing a change, relaying ephemeral data. A denied
//! peer gets no reply at all, so it cannot tell "forbidden" from "absent".
//!
//! ## Performance Targets
//!
//! | Metric                          | Target |
//! |---------------------------------|--------|
//! | Local change → peers queued     | <1ms   |
//! | Cached document open            | <10μs  |
//! | Fan-out, 100 authorized peers   | <5ms   |

pub mod handle;
mod persist;

use futures_util::future::join_all;
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, OnceCell};
use tokio::task::JoinHandle;
use yrs::TransactionMut;

use crate::network::{NetworkAdapter, NetworkError, NetworkEvent};
use crate::policy::{self, SharePolicy};
use crate::projection::{NoProjection, ProjectedFields, ProjectionSink};
use crate::protocol::{DocumentId, Message, MessageKind, PeerId, PeerMetadata, ProtocolError};
use crate::storage::{StorageAdapter, StorageError};
use crate::sync::{self, SyncError, SyncFrame};

pub use handle::DocHandle;
use handle::ChunkState;

/// Repository configuration.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Incremental chunks written before a document is compacted into one
    /// snapshot.
    pub compaction_threshold: usize,
    /// Upper bound on one share-policy decision.
    pub auth_timeout: Duration,
    /// Buffered [`RepoEvent`]s per subscriber.
    pub event_capacity: usize,
    /// How long [`Repository::request`] waits for peers.
    pub request_timeout: Duration,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 64,
            auth_timeout: Duration::from_secs(5),
            event_capacity: 1024,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RepoConfig {
    pub fn for_testing() -> Self {
        Self {
            compaction_threshold: 16,
            auth_timeout: Duration::from_millis(500),
            event_capacity: 256,
            request_timeout: Duration::from_secs(1),
        }
    }
}

/// Notifications for local observers.
#[derive(Debug, Clone, PartialEq)]
pub enum RepoEvent {
    DocumentChanged {
        document_id: DocumentId,
        /// `None` for local edits.
        origin: Option<PeerId>,
        update: Vec<u8>,
    },
    Ephemeral {
        document_id: DocumentId,
        sender_id: PeerId,
        data: Vec<u8>,
    },
    PeerConnected {
        peer_id: PeerId,
        peer_metadata: PeerMetadata,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
}

/// Repository errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RepoError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("document {0} is not available from any connected peer")]
    Unavailable(DocumentId),
    #[error("request for document {document} timed out after {timeout:?}")]
    RequestTimeout {
        document: DocumentId,
        timeout: Duration,
    },
}

struct PeerEntry {
    adapter: NetworkAdapter,
    inbox: mpsc::UnboundedSender<Message>,
    /// Documents on which a state-vector exchange has started.
    synced: HashSet<DocumentId>,
}

struct RepoInner {
    config: RepoConfig,
    storage: StorageAdapter,
    policy: Arc<dyn SharePolicy>,
    projection: Arc<dyn ProjectionSink>,
    documents: Mutex<HashMap<DocumentId, Arc<OnceCell<Arc<DocHandle>>>>>,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    adapters: Mutex<Vec<NetworkAdapter>>,
    events: broadcast::Sender<RepoEvent>,
}

impl RepoInner {
    fn lock_documents(&self) -> MutexGuard<'_, HashMap<DocumentId, Arc<OnceCell<Arc<DocHandle>>>>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_peers(&self) -> MutexGuard<'_, HashMap<PeerId, PeerEntry>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_adapters(&self) -> MutexGuard<'_, Vec<NetworkAdapter>> {
        self.adapters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheaply cloneable handle to one repository.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepoInner>,
}

impl Repository {
    pub fn new(storage: StorageAdapter, policy: Arc<dyn SharePolicy>, config: RepoConfig) -> Self {
        Self::with_projection(storage, policy, Arc::new(NoProjection), config)
    }

    pub fn with_projection(
        storage: StorageAdapter,
        policy: Arc<dyn SharePolicy>,
        projection: Arc<dyn ProjectionSink>,
        config: RepoConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(RepoInner {
                config,
                storage,
                policy,
                projection,
                documents: Mutex::new(HashMap::new()),
                peers: Mutex::new(HashMap::new()),
                adapters: Mutex::new(Vec::new()),
                events,
            }),
        }
    }

    fn from_weak(weak: &Weak<RepoInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &RepoConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &StorageAdapter {
        &self.inner.storage
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RepoEvent> {
        self.inner.events.subscribe()
    }

    /// Currently connected peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.lock_peers().keys().cloned().collect()
    }

    /// Number of documents held in memory.
    pub fn open_documents(&self) -> usize {
        self.inner
            .lock_documents()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    fn emit(&self, event: RepoEvent) {
        // Err only means nobody is subscribed.
        let _ = self.inner.events.send(event);
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// A new, empty document with a fresh id. Nothing is stored until the
    /// first change.
    pub fn create(&self) -> Arc<DocHandle> {
        let id = DocumentId::generate();
        let handle = Arc::new(DocHandle::empty(id.clone()));
        self.inner
            .lock_documents()
            .insert(id, Arc::new(OnceCell::new_with(Some(Arc::clone(&handle)))));
        log::debug!("Created document {}", handle.id());
        handle
    }

    /// The handle for `document`, loading it from storage on first use.
    ///
    /// Always succeeds for a readable store; the handle is empty when nothing
    /// was stored. Concurrent callers share one load and one handle.
    pub async fn load(&self, document: &DocumentId) -> Result<Arc<DocHandle>, RepoError> {
        let cell = Arc::clone(
            self.inner
                .lock_documents()
                .entry(document.clone())
                .or_default(),
        );
        let loaded = cell
            .get_or_try_init(|| async {
                let (doc, chunks) = persist::load(&self.inner.storage, document).await?;
                Ok::<_, RepoError>(Arc::new(DocHandle::new(document.clone(), doc, chunks)))
            })
            .await;
        match loaded {
            Ok(handle) => Ok(Arc::clone(handle)),
            Err(e) => {
                let mut documents = self.inner.lock_documents();
                // Leave the cell to any other loader still waiting on it.
                let abandoned = documents.get(document).is_some_and(|held| {
                    Arc::ptr_eq(held, &cell) && !held.initialized() && Arc::strong_count(&cell) == 2
                });
                if abandoned {
                    documents.remove(document);
                }
                Err(e)
            }
        }
    }

    /// Forget `handle` if it is still empty and nothing outside the map
    /// refers to it, so unanswered lookups do not accumulate.
    fn release_if_unused(&self, handle: Arc<DocHandle>) {
        let mut documents = self.inner.lock_documents();
        let Some(cell) = documents.get(handle.id()) else {
            return;
        };
        let held = cell.get().is_some_and(|held| Arc::ptr_eq(held, &handle));
        // One reference in the map, one in `handle`; no loader holds the cell.
        if held
            && handle.is_empty()
            && Arc::strong_count(&handle) == 2
            && Arc::strong_count(cell) == 1
        {
            documents.remove(handle.id());
            log::trace!("Released empty document {}", handle.id());
        }
    }

    /// `document` from memory or storage; `None` if it has no content.
    pub async fn find(&self, document: &DocumentId) -> Result<Option<Arc<DocHandle>>, RepoError> {
        let handle = self.load(document).await?;
        Ok((!handle.is_empty()).then_some(handle))
    }

    fn loaded(&self, document: &DocumentId) -> Option<Arc<DocHandle>> {
        self.inner
            .lock_documents()
            .get(document)
            .and_then(|cell| cell.get().cloned())
    }

    /// Like [`find`](Self::find), but asks every authorized connected peer
    /// when the document has no local content. Fails once every asked peer
    /// reported it unavailable, or after `request_timeout`.
    pub async fn request(&self, document: &DocumentId) -> Result<Arc<DocHandle>, RepoError> {
        let handle = self.load(document).await?;
        if !handle.is_empty() {
            return Ok(handle);
        }
        let mut changes = handle.subscribe();

        let targets = self.peer_routes(None);
        let decisions = join_all(
            targets
                .iter()
                .map(|(peer, _)| self.authorized(peer, document)),
        )
        .await;
        let targets: Vec<(PeerId, NetworkAdapter)> = targets
            .into_iter()
            .zip(decisions)
            .filter_map(|(target, allowed)| allowed.then_some(target))
            .collect();
        if targets.is_empty() {
            self.release_if_unused(handle);
            return Err(RepoError::Unavailable(document.clone()));
        }

        let step1 = SyncFrame::step1(handle.doc()).encode()?;
        let request = handle.begin_request(targets.iter().map(|(peer, _)| peer.clone()));
        for (peer, adapter) in &targets {
            let msg = Message::request(
                adapter.peer_id().clone(),
                peer.clone(),
                document.clone(),
                step1.clone(),
            );
            match adapter.send(msg).await {
                Ok(()) => {
                    self.mark_synced(peer, document);
                }
                Err(e) => {
                    log::warn!("Request for {document} to {peer} failed: {e}");
                    handle.peer_unavailable(peer);
                }
            }
        }

        let timeout = self.inner.config.request_timeout;
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                if !handle.is_empty() {
                    return true;
                }
                if !handle.has_awaiting_peers(request) {
                    return false;
                }
                if changes.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        handle.end_request(request);

        let err = match outcome {
            Ok(true) => return Ok(handle),
            Ok(false) => RepoError::Unavailable(document.clone()),
            Err(_) => RepoError::RequestTimeout {
                document: document.clone(),
                timeout,
            },
        };
        self.release_if_unused(handle);
        Err(err)
    }

    /// Apply a local edit, persist it and propagate it to authorized peers.
    /// Returns `false` when the edit changed nothing.
    pub async fn change<F>(&self, handle: &DocHandle, edit: F) -> Result<bool, RepoError>
    where
        F: FnOnce(&mut TransactionMut<'_>),
    {
        let (update, persisted) = {
            let mut chunks = handle.write.lock().await;
            let Some(update) = sync::edit(handle.doc(), edit) else {
                return Ok(false);
            };
            let persisted = self.persist(handle, &mut chunks, &update).await;
            (update, persisted)
        };
        self.after_change(handle, &update, None).await;
        persisted?;
        Ok(true)
    }

    /// Merge an update from `origin` (or from nowhere, for imports).
    async fn commit(
        &self,
        handle: &DocHandle,
        update: &[u8],
        origin: Option<&PeerId>,
    ) -> Result<bool, RepoError> {
        let persisted = {
            let mut chunks = handle.write.lock().await;
            if !sync::apply_update(handle.doc(), update)? {
                return Ok(false);
            }
            self.persist(handle, &mut chunks, update).await
        };
        self.after_change(handle, update, origin).await;
        persisted?;
        Ok(true)
    }

    async fn persist(
        &self,
        handle: &DocHandle,
        chunks: &mut ChunkState,
        update: &[u8],
    ) -> Result<(), StorageError> {
        let storage = &self.inner.storage;
        persist::save_incremental(storage, handle.id(), update, chunks).await?;
        if chunks.incremental >= self.inner.config.compaction_threshold {
            if let Err(e) = persist::compact(storage, handle.id(), handle.doc(), chunks).await {
                log::warn!("Compaction of {} failed: {e}", handle.id());
            }
        }
        Ok(())
    }

    async fn after_change(&self, handle: &DocHandle, update: &[u8], origin: Option<&PeerId>) {
        handle.bump();
        self.emit(RepoEvent::DocumentChanged {
            document_id: handle.id().clone(),
            origin: origin.cloned(),
            update: update.to_vec(),
        });
        self.propagate(handle, update, origin).await;
        self.project(handle).await;
    }

    /// Push `update` to every other authorized peer. Peers that have not
    /// exchanged state on this document yet get our state vector instead.
    async fn propagate(&self, handle: &DocHandle, update: &[u8], origin: Option<&PeerId>) -> usize {
        let document = handle.id();
        let targets = self.peer_routes(origin);
        if targets.is_empty() {
            return 0;
        }
        let decisions = join_all(
            targets
                .iter()
                .map(|(peer, _)| self.authorized(peer, document)),
        )
        .await;

        let delta = SyncFrame::Update {
            update: update.to_vec(),
        };
        let mut sent = 0;
        for ((peer, adapter), allowed) in targets.iter().zip(decisions) {
            if !allowed {
                continue;
            }
            let starts_exchange = match self.mark_synced(peer, document) {
                None => continue,
                Some(first) => first,
            };
            let frame = if starts_exchange {
                SyncFrame::step1(handle.doc())
            } else {
                delta.clone()
            };
            if self.send_frame(adapter, peer, document, &frame).await {
                sent += 1;
            } else if starts_exchange {
                // The peer never saw our state vector; start over next time.
                self.unmark_synced(peer, document);
            }
        }
        log::trace!("Propagated change to {document} to {sent}/{} peer(s)", targets.len());
        sent
    }

    async fn project(&self, handle: &DocHandle) {
        let fields = ProjectedFields::extract(handle.doc());
        if fields.is_empty() || !handle.replace_projection(&fields) {
            return;
        }
        let call = AssertUnwindSafe(self.inner.projection.project(handle.id(), &fields)).catch_unwind();
        match call.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Projection of {} failed: {e}", handle.id()),
            Err(_) => log::error!("Projection of {} panicked", handle.id()),
        }
    }

    /// Send ephemeral `data` for `document` to every authorized peer synced
    /// on it. Returns the number of peers reached.
    pub async fn broadcast_ephemeral(
        &self,
        document: &DocumentId,
        data: Vec<u8>,
    ) -> Result<usize, RepoError> {
        if data.is_empty() {
            let empty = ProtocolError::EmptyPayload(MessageKind::Ephemeral);
            return Err(NetworkError::Protocol(empty).into());
        }
        Ok(self.relay_ephemeral(document, &data, None).await)
    }

    async fn relay_ephemeral(&self, document: &DocumentId, data: &[u8], exclude: Option<&PeerId>) -> usize {
        let targets: Vec<(PeerId, NetworkAdapter)> = self
            .inner
            .lock_peers()
            .iter()
            .filter(|(id, entry)| exclude != Some(*id) && entry.synced.contains(document))
            .map(|(id, entry)| (id.clone(), entry.adapter.clone()))
            .collect();
        let decisions = join_all(
            targets
                .iter()
                .map(|(peer, _)| self.authorized(peer, document)),
        )
        .await;

        let mut sent = 0;
        for ((peer, adapter), allowed) in targets.iter().zip(decisions) {
            if !allowed {
                continue;
            }
            let msg = Message::ephemeral(
                adapter.peer_id().clone(),
                peer.clone(),
                document.clone(),
                data.to_vec(),
            );
            match adapter.send(msg).await {
                Ok(()) => sent += 1,
                Err(e) => log::debug!("Ephemeral for {document} to {peer} dropped: {e}"),
            }
        }
        sent
    }

    /// Retry pending storage writes.
    pub async fn flush(&self) -> Result<(), RepoError> {
        self.inner.storage.flush().await?;
        Ok(())
    }

    /// Say `leave` to every peer on every adapter, then flush storage.
    pub async fn shutdown(&self) -> Result<(), RepoError> {
        let adapters: Vec<NetworkAdapter> = self.inner.lock_adapters().clone();
        for adapter in adapters {
            adapter.close_all().await;
        }
        self.flush().await
    }

    // ─── Peers ────────────────────────────────────────────────────────

    /// Feed an adapter's events into this repository. The returned task ends
    /// when the adapter's event stream closes.
    pub fn add_network_adapter(
        &self,
        adapter: NetworkAdapter,
        mut events: mpsc::UnboundedReceiver<NetworkEvent>,
    ) -> JoinHandle<()> {
        self.inner.lock_adapters().push(adapter.clone());
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(repo) = Repository::from_weak(&weak) else {
                    break;
                };
                match event {
                    NetworkEvent::PeerCandidate {
                        peer_id,
                        peer_metadata,
                    } => repo.connect(&adapter, peer_id, peer_metadata),
                    NetworkEvent::Message(msg) => repo.dispatch(msg),
                    NetworkEvent::PeerDisconnected { peer_id } => {
                        repo.disconnect(&peer_id);
                    }
                }
            }
            log::debug!("Event stream of adapter {} ended", adapter.peer_id());
        })
    }

    /// Register `peer_id`, reachable through `adapter`, against zero
    /// documents. Re-registering a peer resets its sync state.
    pub fn connect(&self, adapter: &NetworkAdapter, peer_id: PeerId, peer_metadata: PeerMetadata) {
        let (inbox, mut rx) = mpsc::unbounded_channel::<Message>();
        let entry = PeerEntry {
            adapter: adapter.clone(),
            inbox,
            synced: HashSet::new(),
        };
        if self.inner.lock_peers().insert(peer_id.clone(), entry).is_some() {
            log::info!("Peer {peer_id} re-registered, sync state reset");
        } else {
            log::info!("Peer {peer_id} connected");
        }

        let weak = Arc::downgrade(&self.inner);
        let peer = peer_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(repo) = Repository::from_weak(&weak) else {
                    break;
                };
                repo.handle_message(&peer, msg).await;
            }
            log::trace!("Worker for peer {peer} stopped");
        });

        self.emit(RepoEvent::PeerConnected {
            peer_id,
            peer_metadata,
        });
    }

    /// Forget `peer_id`. Returns whether it was registered.
    pub fn disconnect(&self, peer_id: &PeerId) -> bool {
        // Dropping the entry closes the inbox; the worker drains and stops.
        if self.inner.lock_peers().remove(peer_id).is_none() {
            return false;
        }
        let handles: Vec<Arc<DocHandle>> = self
            .inner
            .lock_documents()
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect();
        for handle in handles {
            handle.peer_unavailable(peer_id);
        }
        log::info!("Peer {peer_id} disconnected");
        self.emit(RepoEvent::PeerDisconnected {
            peer_id: peer_id.clone(),
        });
        true
    }

    fn dispatch(&self, msg: Message) {
        let sender = msg.sender_id().clone();
        let inbox = self
            .inner
            .lock_peers()
            .get(&sender)
            .map(|entry| entry.inbox.clone());
        match inbox {
            Some(inbox) => {
                if inbox.send(msg).is_err() {
                    log::debug!("Worker for peer {sender} is gone, dropping message");
                }
            }
            None => log::debug!("Dropping {} from unregistered peer {sender}", msg.kind()),
        }
    }

    /// `(peer, adapter)` for every connected peer except `exclude`.
    fn peer_routes(&self, exclude: Option<&PeerId>) -> Vec<(PeerId, NetworkAdapter)> {
        self.inner
            .lock_peers()
            .iter()
            .filter(|(id, _)| exclude != Some(*id))
            .map(|(id, entry)| (id.clone(), entry.adapter.clone()))
            .collect()
    }

    fn route(&self, peer: &PeerId) -> Option<NetworkAdapter> {
        self.inner
            .lock_peers()
            .get(peer)
            .map(|entry| entry.adapter.clone())
    }

    /// `Some(true)` if this starts the exchange with `peer` on `document`,
    /// `None` if the peer is gone.
    fn mark_synced(&self, peer: &PeerId, document: &DocumentId) -> Option<bool> {
        self.inner
            .lock_peers()
            .get_mut(peer)
            .map(|entry| entry.synced.insert(document.clone()))
    }

    fn unmark_synced(&self, peer: &PeerId, document: &DocumentId) {
        if let Some(entry) = self.inner.lock_peers().get_mut(peer) {
            entry.synced.remove(document);
        }
    }

    async fn authorized(&self, peer: &PeerId, document: &DocumentId) -> bool {
        policy::authorize(
            self.inner.policy.as_ref(),
            peer,
            document,
            self.inner.config.auth_timeout,
        )
        .await
    }

    async fn send_frame(
        &self,
        adapter: &NetworkAdapter,
        peer: &PeerId,
        document: &DocumentId,
        frame: &SyncFrame,
    ) -> bool {
        let data = match frame.encode() {
            Ok(data) => data,
            Err(e) => {
                log::error!("Encoding sync frame for {document} failed: {e}");
                return false;
            }
        };
        let msg = Message::sync(adapter.peer_id().clone(), peer.clone(), document.clone(), data);
        match adapter.send(msg).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Sending {document} to {peer} failed: {e}");
                false
            }
        }
    }

    async fn send_error(&self, adapter: &NetworkAdapter, peer: &PeerId, text: String) {
        let msg = Message::error(adapter.peer_id().clone(), peer.clone(), text);
        if let Err(e) = adapter.send(msg).await {
            log::debug!("Error report to {peer} not delivered: {e}");
        }
    }

    // ─── Incoming ─────────────────────────────────────────────────────

    async fn handle_message(&self, peer: &PeerId, msg: Message) {
        match msg {
            Message::Sync {
                document_id, data, ..
            } => self.on_sync(peer, document_id, data, false).await,
            Message::Request {
                document_id, data, ..
            } => self.on_sync(peer, document_id, data, true).await,
            Message::DocUnavailable { document_id, .. } => {
                if let Some(handle) = self.loaded(&document_id) {
                    handle.peer_unavailable(peer);
                }
            }
            Message::Ephemeral {
                document_id, data, ..
            } => self.on_ephemeral(peer, document_id, data).await,
            Message::Error { message, .. } => {
                log::debug!("Peer {peer} reported: {message}");
            }
            other => log::debug!("Ignoring {} from peer {peer}", other.kind()),
        }
    }

    async fn on_sync(&self, peer: &PeerId, document: DocumentId, data: Vec<u8>, requested: bool) {
        if !self.authorized(peer, &document).await {
            return;
        }
        let Some(adapter) = self.route(peer) else {
            return;
        };

        let handle = match self.load(&document).await {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Loading {document} for peer {peer} failed: {e}");
                self.send_error(&adapter, peer, format!("document {document} could not be loaded"))
                    .await;
                return;
            }
        };

        let frame = match SyncFrame::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Bad sync frame for {document} from peer {peer}: {e}");
                self.send_error(&adapter, peer, e.to_string()).await;
                return;
            }
        };

        match frame {
            SyncFrame::Step1 { state_vector } => {
                if requested && handle.is_empty() {
                    let msg = Message::doc_unavailable(adapter.peer_id().clone(), peer.clone(), document.clone());
                    if let Err(e) = adapter.send(msg).await {
                        log::debug!("doc-unavailable for {document} to {peer} dropped: {e}");
                    }
                    self.release_if_unused(handle);
                    return;
                }
                let update = match sync::diff_since(handle.doc(), &state_vector) {
                    Ok(update) => update,
                    Err(e) => {
                        log::warn!("Bad state vector for {document} from peer {peer}: {e}");
                        self.send_error(&adapter, peer, e.to_string()).await;
                        return;
                    }
                };
                self.send_frame(&adapter, peer, &document, &SyncFrame::Step2 { update })
                    .await;
                if self.mark_synced(peer, &document) == Some(true)
                    && !self
                        .send_frame(&adapter, peer, &document, &SyncFrame::step1(handle.doc()))
                        .await
                {
                    self.unmark_synced(peer, &document);
                }
                self.release_if_unused(handle);
            }
            SyncFrame::Step2 { update } | SyncFrame::Update { update } => {
                match self.commit(&handle, &update, Some(peer)).await {
                    Ok(_) => {}
                    Err(RepoError::Sync(e)) => {
                        log::warn!("Bad update for {document} from peer {peer}: {e}");
                        self.send_error(&adapter, peer, e.to_string()).await;
                    }
                    Err(e) => log::error!("Change to {document} from peer {peer} not persisted: {e}"),
                }
            }
        }
    }

    async fn on_ephemeral(&self, peer: &PeerId, document: DocumentId, data: Vec<u8>) {
        if !self.authorized(peer, &document).await {
            return;
        }
        self.relay_ephemeral(&document, &data, Some(peer)).await;
        self.emit(RepoEvent::Ephemeral {
            document_id: document,
            sender_id: peer.clone(),
            data,
        });
    }
}
