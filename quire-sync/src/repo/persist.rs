//! Chunked document persistence.
//!
//! ```text
//! <doc>/snapshot/<uuid>      full state, written on compaction
//! <doc>/incremental/<uuid>   one per applied change
//! ```
//!
//! Chunks are Yrs updates, so loading applies them in any order. Compaction
//! writes the snapshot before removing the chunks it replaces; a crash in
//! between leaves redundant chunks, never missing ones.

use uuid::Uuid;
use yrs::Doc;

use crate::key::StorageKey;
use crate::protocol::DocumentId;
use crate::storage::{StorageAdapter, StorageError};
use crate::sync;

use super::handle::ChunkState;

pub(crate) const INCREMENTAL: &str = "incremental";
pub(crate) const SNAPSHOT: &str = "snapshot";

fn chunk_key(document: &DocumentId, kind: &str) -> Result<StorageKey, StorageError> {
    Ok(StorageKey::new([
        document.as_str().to_string(),
        kind.to_string(),
        Uuid::new_v4().to_string(),
    ])?)
}

/// Rebuild a document from its stored chunks.
pub(crate) async fn load(
    storage: &StorageAdapter,
    document: &DocumentId,
) -> Result<(Doc, ChunkState), StorageError> {
    let prefix = StorageKey::new([document.as_str()])?;
    let mut rows = storage.load_range(&prefix).await?;
    // Snapshots first; not required for correctness but avoids pending structs.
    rows.sort_by_key(|(key, _)| key.segments().get(1).map(|kind| kind != SNAPSHOT));

    let doc = Doc::new();
    let mut state = ChunkState::default();
    for (key, bytes) in rows {
        if let Err(e) = sync::apply_update(&doc, &bytes) {
            log::error!("Skipping corrupt chunk {key}: {e}");
        }
        if key.segments().get(1).map(String::as_str) == Some(INCREMENTAL) {
            state.incremental += 1;
        }
        state.chunks.push(key);
    }
    log::debug!(
        "Loaded {document}: {} chunk(s), {} incremental",
        state.chunks.len(),
        state.incremental
    );
    Ok((doc, state))
}

/// Store one change.
pub(crate) async fn save_incremental(
    storage: &StorageAdapter,
    document: &DocumentId,
    update: &[u8],
    state: &mut ChunkState,
) -> Result<(), StorageError> {
    let key = chunk_key(document, INCREMENTAL)?;
    storage.save(&key, update).await?;
    state.chunks.push(key);
    state.incremental += 1;
    Ok(())
}

/// Replace every chunk in `state` with one snapshot of `doc`.
pub(crate) async fn compact(
    storage: &StorageAdapter,
    document: &DocumentId,
    doc: &Doc,
    state: &mut ChunkState,
) -> Result<(), StorageError> {
    let key = chunk_key(document, SNAPSHOT)?;
    storage.save(&key, &sync::full_state(doc)).await?;

    let replaced = std::mem::replace(&mut state.chunks, vec![key]);
    state.incremental = 0;
    for old in &replaced {
        if let Err(e) = storage.remove(old).await {
            // Redundant chunk; harmless on load, retried by the next compaction.
            log::warn!("Compaction of {document}: could not remove {old}: {e}");
            state.chunks.push(old.clone());
        }
    }
    log::debug!("Compacted {document}: {} chunk(s) replaced", replaced.len());
    Ok(())
}
