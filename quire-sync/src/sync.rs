//! Payload of `sync` / `request` messages: the state-vector exchange.
//!
//! ```text
//! A                                         B
//! │ ── Step1 { A's state vector } ────────► │
//! │ ◄──────────── Step2 { diff for A } ──── │
//! │ ◄──────────── Step1 { B's state vector }│   (first contact only)
//! │ ── Step2 { diff for B } ──────────────► │
//! │ ◄═══════════ Update { delta } ════════► │   (afterwards)
//! ```
//!
//! Updates use the Yrs v1 encoding. The document content itself is opaque to
//! this crate; the helpers below only move state between `yrs::Doc`s.

use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, TransactionMut, Update};

/// One sync step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncFrame {
    /// "This is what I have."
    Step1 { state_vector: Vec<u8> },
    /// "This is what you are missing."
    Step2 { update: Vec<u8> },
    /// Incremental change pushed to a peer that has already synced.
    Update { update: Vec<u8> },
}

/// Sync errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("sync frame encoding failed: {0}")]
    Encode(String),
    #[error("malformed sync frame: {0}")]
    Frame(String),
    #[error("malformed state vector: {0}")]
    StateVector(String),
    #[error("malformed update: {0}")]
    Update(String),
}

impl SyncFrame {
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Frame(e.to_string()))?;
        Ok(frame)
    }

    /// Our state vector, opening an exchange.
    pub fn step1(doc: &Doc) -> Self {
        SyncFrame::Step1 {
            state_vector: state_vector(doc),
        }
    }
}

/// Encoded state vector of `doc`.
pub fn state_vector(doc: &Doc) -> Vec<u8> {
    doc.transact().state_vector().encode_v1()
}

/// Everything in `doc`, as one update.
pub fn full_state(doc: &Doc) -> Vec<u8> {
    doc.transact()
        .encode_state_as_update_v1(&StateVector::default())
}

/// What a peer with `remote_state_vector` is missing.
pub fn diff_since(doc: &Doc, remote_state_vector: &[u8]) -> Result<Vec<u8>, SyncError> {
    let sv = StateVector::decode_v1(remote_state_vector)
        .map_err(|e| SyncError::StateVector(e.to_string()))?;
    Ok(doc.transact().encode_diff_v1(&sv))
}

/// Whether `doc` holds no content at all.
pub fn is_empty(doc: &Doc) -> bool {
    doc.transact().state_vector().is_empty()
}

/// Merge `update` into `doc`. Returns whether the document's state changed;
/// updates that were already known (or are still waiting on missing
/// dependencies) report `false`.
///
/// Compares snapshots rather than state vectors: a pure deletion leaves the
/// state vector untouched and only grows the delete set.
pub fn apply_update(doc: &Doc, update: &[u8]) -> Result<bool, SyncError> {
    let update = Update::decode_v1(update).map_err(|e| SyncError::Update(e.to_string()))?;
    let before = doc.transact().snapshot();
    doc.transact_mut()
        .apply_update(update)
        .map_err(|e| SyncError::Update(e.to_string()))?;
    let after = doc.transact().snapshot();
    Ok(before != after)
}

/// Run `edit` in one local transaction. Returns the resulting update, or
/// `None` when the transaction changed nothing.
pub fn edit<F>(doc: &Doc, edit: F) -> Option<Vec<u8>>
where
    F: FnOnce(&mut TransactionMut<'_>),
{
    let (before, before_sv) = {
        let txn = doc.transact();
        (txn.snapshot(), txn.state_vector())
    };
    {
        let mut txn = doc.transact_mut();
        edit(&mut txn);
    }
    let txn = doc.transact();
    if txn.snapshot() == before {
        return None;
    }
    Some(txn.encode_diff_v1(&before_sv))
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    fn doc_with_text(s: &str) -> Doc {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("body");
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, s);
        drop(txn);
        doc
    }

    fn text_of(doc: &Doc) -> String {
        let text = doc.get_or_insert_text("body");
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[test]
    fn test_two_way_exchange_converges() {
        let a = doc_with_text("hello ");
        let b = doc_with_text("world");

        // A → B step1, B answers with step2 and its own step1.
        let SyncFrame::Step1 { state_vector: sv_a } = SyncFrame::step1(&a) else {
            unreachable!()
        };
        let diff_for_a = diff_since(&b, &sv_a).unwrap();
        assert!(apply_update(&a, &diff_for_a).unwrap());

        let diff_for_b = diff_since(&a, &state_vector(&b)).unwrap();
        assert!(apply_update(&b, &diff_for_b).unwrap());

        assert_eq!(text_of(&a), text_of(&b));
        assert_eq!(text_of(&a).len(), "hello world".len());
    }

    #[test]
    fn test_reapplying_update_reports_no_change() {
        let a = doc_with_text("abc");
        let b = Doc::new();
        let update = full_state(&a);

        assert!(apply_update(&b, &update).unwrap());
        assert!(!apply_update(&b, &update).unwrap());
    }

    #[test]
    fn test_deletion_counts_as_change() {
        let a = doc_with_text("abc");
        let b = Doc::new();
        apply_update(&b, &full_state(&a)).unwrap();

        let update = edit(&a, |txn| {
            let text = txn.get_or_insert_text("body");
            text.remove_range(txn, 0, 1);
        })
        .unwrap();
        assert!(apply_update(&b, &update).unwrap());
        assert_eq!(text_of(&b), "bc");
    }

    #[test]
    fn test_edit_without_changes_yields_nothing() {
        let doc = doc_with_text("abc");
        assert!(edit(&doc, |_| {}).is_none());
    }

    #[test]
    fn test_empty_doc_detection() {
        assert!(is_empty(&Doc::new()));
        assert!(!is_empty(&doc_with_text("x")));
    }

    #[test]
    fn test_malformed_inputs() {
        let doc = Doc::new();
        assert!(matches!(
            apply_update(&doc, &[0xFF, 0xFF, 0xFF]),
            Err(SyncError::Update(_))
        ));
        assert!(SyncFrame::decode(&[0xFF]).is_err());
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = SyncFrame::Update {
            update: vec![1, 2, 3],
        };
        assert_eq!(SyncFrame::decode(&frame.encode().unwrap()).unwrap(), frame);
    }
}
