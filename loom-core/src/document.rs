//! The unit of collaboration: one replicated text plus its metadata map.
//!
//! A `Document` wraps a [`Sequence`] and exposes the synchronisation
//! surface used by the relay and by clients:
//!
//! ```text
//! local edit ──► insert/delete(pos) ──► Sequence ──► diff_since(peer sv)
//! remote diff ─► apply_remote(bytes) ─► Sequence ──► DocEvent subscribers
//! ```

use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::codec;
use crate::crdt::{ApplyOutcome, Sequence};
use crate::error::{DecodeError, DocumentError};
use crate::id::{ClientId, OpId};
use crate::state_vector::StateVector;

/// Metadata key holding the editor language of a room.
pub const LANGUAGE_KEY: &str = "language";

const EVENT_CAPACITY: usize = 64;

/// Change notifications emitted by a [`Document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocEvent {
    /// The visible text changed.
    TextChanged,
    /// The winning value of a metadata key changed.
    MetaChanged { key: String, value: String },
}

/// Point-in-time summary of a document, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSnapshot {
    pub text: String,
    pub state_vector: StateVector,
    pub meta: BTreeMap<String, String>,
    /// Items including tombstones.
    pub items: usize,
    pub pending: usize,
}

pub struct Document {
    client_id: ClientId,
    sequence: Sequence,
    events: broadcast::Sender<DocEvent>,
}

impl Document {
    /// Create an empty document whose local edits are authored by `client_id`.
    pub fn new(client_id: ClientId) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            client_id,
            sequence: Sequence::new(),
            events,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Visible text.
    pub fn text(&self) -> String {
        self.sequence.materialize()
    }

    pub fn current_text(&self) -> String {
        self.text()
    }

    /// Visible length in characters.
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DocEvent> {
        self.events.subscribe()
    }

    /// Insert `text` so that its first character lands at visible position `pos`.
    pub fn insert(&mut self, pos: usize, text: &str) -> Result<Vec<OpId>, DocumentError> {
        let mut prev = self.origin_before(pos)?;
        let mut ids = Vec::with_capacity(text.len());
        for c in text.chars() {
            let id = self.sequence.insert(prev, c, self.client_id)?;
            ids.push(id);
            prev = Some(id);
        }
        if !ids.is_empty() {
            self.emit(DocEvent::TextChanged);
        }
        Ok(ids)
    }

    pub fn insert_char(&mut self, pos: usize, c: char) -> Result<OpId, DocumentError> {
        let after = self.origin_before(pos)?;
        let id = self.sequence.insert(after, c, self.client_id)?;
        self.emit(DocEvent::TextChanged);
        Ok(id)
    }

    /// Delete the character at visible position `pos`.
    pub fn delete(&mut self, pos: usize) -> Result<OpId, DocumentError> {
        let len = self.len();
        let target = self
            .sequence
            .visible_id(pos)
            .ok_or(DocumentError::OutOfRange { pos, len })?;
        let id = self
            .sequence
            .delete(target, self.client_id)?
            .ok_or(DocumentError::UnknownItem(target))?;
        self.emit(DocEvent::TextChanged);
        Ok(id)
    }

    /// Delete `count` characters starting at visible position `pos`.
    pub fn delete_range(&mut self, pos: usize, count: usize) -> Result<Vec<OpId>, DocumentError> {
        let len = self.len();
        let end = pos.checked_add(count).filter(|end| *end <= len);
        if end.is_none() {
            return Err(DocumentError::OutOfRange { pos: pos.saturating_add(count), len });
        }
        (0..count).map(|_| self.delete(pos)).collect()
    }

    pub fn set_meta(&mut self, key: &str, value: &str) -> OpId {
        let changed = self.sequence.meta(key) != Some(value);
        let id = self.sequence.set_meta(key, value, self.client_id);
        if changed {
            self.emit(DocEvent::MetaChanged {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        id
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.sequence.meta(key)
    }

    pub fn language(&self) -> Option<&str> {
        self.meta(LANGUAGE_KEY)
    }

    pub fn set_language(&mut self, language: &str) -> OpId {
        self.set_meta(LANGUAGE_KEY, language)
    }

    pub fn state_vector(&self) -> &StateVector {
        self.sequence.state_vector()
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        codec::encode_state_vector(self.state_vector())
    }

    /// Encoded diff of every op the peer at `peer` is missing.
    pub fn diff_since(&self, peer: &StateVector) -> Vec<u8> {
        codec::encode_diff(self.sequence.ops_since(peer))
    }

    /// [`diff_since`](Self::diff_since) for an encoded peer state vector.
    pub fn diff_since_encoded(&self, peer: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let peer = codec::decode_state_vector(peer)?;
        Ok(self.diff_since(&peer))
    }

    /// The whole document as a diff against an empty replica.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.diff_since(&StateVector::new())
    }

    /// Decode and integrate a diff produced by another replica.
    pub fn apply_remote(&mut self, update: &[u8]) -> Result<ApplyOutcome, DecodeError> {
        let ops = codec::decode_diff(update)?;
        let outcome = self.sequence.apply(ops)?;
        if outcome.text_changed {
            self.emit(DocEvent::TextChanged);
        }
        for (key, value) in &outcome.meta_changed {
            self.emit(DocEvent::MetaChanged {
                key: key.clone(),
                value: value.clone(),
            });
        }
        Ok(outcome)
    }

    /// Ops received but not yet integrated for lack of a dependency.
    pub fn pending_len(&self) -> usize {
        self.sequence.pending_len()
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            text: self.text(),
            state_vector: self.state_vector().clone(),
            meta: self
                .sequence
                .meta_entries()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            items: self.sequence.item_count(),
            pending: self.pending_len(),
        }
    }

    fn origin_before(&self, pos: usize) -> Result<Option<OpId>, DocumentError> {
        let len = self.len();
        if pos > len {
            return Err(DocumentError::OutOfRange { pos, len });
        }
        Ok(match pos {
            0 => None,
            _ => self.sequence.visible_id(pos - 1),
        })
    }

    fn emit(&self, event: DocEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("client_id", &self.client_id)
            .field("text", &self.text())
            .field("state_vector", self.state_vector())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cat_scenario() {
        let mut a = Document::new(1);
        let mut b = Document::new(2);

        a.insert(0, "cat").unwrap();
        b.apply_remote(&a.diff_since(&StateVector::new())).unwrap();
        assert_eq!(b.text(), "cat");

        let sv_b = b.state_vector().clone();
        a.delete(1).unwrap();
        b.apply_remote(&a.diff_since(&sv_b)).unwrap();
        assert_eq!(b.text(), "ct");
        assert_eq!(a.state_vector().get(1), 4);
        assert_eq!(b.state_vector().get(1), 4);
    }

    #[test]
    fn test_positional_insert() {
        let mut doc = Document::new(1);
        doc.insert(0, "hlo").unwrap();
        doc.insert(1, "el").unwrap();
        doc.insert_char(5, '!').unwrap();
        assert_eq!(doc.text(), "hello!");
        assert_eq!(doc.len(), 6);
    }

    #[test]
    fn test_out_of_range() {
        let mut doc = Document::new(1);
        doc.insert(0, "ab").unwrap();
        assert_eq!(
            doc.insert(3, "x"),
            Err(DocumentError::OutOfRange { pos: 3, len: 2 })
        );
        assert_eq!(
            doc.delete(2),
            Err(DocumentError::OutOfRange { pos: 2, len: 2 })
        );
        assert!(doc.delete_range(1, 2).is_err());
        assert_eq!(doc.text(), "ab");
        assert_eq!(doc.state_vector().get(1), 2);
    }

    #[test]
    fn test_delete_range() {
        let mut doc = Document::new(1);
        doc.insert(0, "hello world").unwrap();
        let ids = doc.delete_range(5, 6).unwrap();
        assert_eq!(ids.len(), 6);
        assert_eq!(doc.text(), "hello");
    }

    #[test]
    fn test_unicode_positions() {
        let mut doc = Document::new(1);
        doc.insert(0, "añb").unwrap();
        doc.delete(1).unwrap();
        doc.insert(1, "ü").unwrap();
        assert_eq!(doc.text(), "aüb");
    }

    #[test]
    fn test_full_state_round_trip() {
        let mut a = Document::new(1);
        a.insert(0, "fn main() {}").unwrap();
        a.delete_range(3, 4).unwrap();
        a.set_language("rust");

        let mut fresh = Document::new(2);
        fresh.apply_remote(&a.encode_state_as_update()).unwrap();
        assert_eq!(fresh.text(), a.text());
        assert_eq!(fresh.language(), Some("rust"));
        assert_eq!(fresh.state_vector(), a.state_vector());
    }

    #[test]
    fn test_decode_error_leaves_state_untouched() {
        let mut doc = Document::new(1);
        doc.insert(0, "keep").unwrap();
        let before = doc.state_vector().clone();
        assert!(doc.apply_remote(&[1, 2, 3]).is_err());
        assert_eq!(doc.text(), "keep");
        assert_eq!(doc.state_vector(), &before);
    }

    #[test]
    fn test_diff_since_encoded() {
        let mut a = Document::new(1);
        a.insert(0, "xy").unwrap();
        let mut b = Document::new(2);
        let diff = a.diff_since_encoded(&b.encode_state_vector()).unwrap();
        b.apply_remote(&diff).unwrap();
        assert_eq!(b.text(), "xy");
        assert!(a.diff_since_encoded(&[9]).is_err());
    }

    #[test]
    fn test_events() {
        let mut a = Document::new(1);
        let mut b = Document::new(2);
        let mut events = b.subscribe();

        a.insert(0, "x").unwrap();
        a.set_language("python");
        b.apply_remote(&a.encode_state_as_update()).unwrap();

        assert_eq!(events.try_recv().unwrap(), DocEvent::TextChanged);
        assert_eq!(
            events.try_recv().unwrap(),
            DocEvent::MetaChanged {
                key: LANGUAGE_KEY.to_string(),
                value: "python".to_string(),
            }
        );
        assert!(events.try_recv().is_err());

        // Re-applying emits nothing.
        b.apply_remote(&a.encode_state_as_update()).unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_snapshot() {
        let mut doc = Document::new(3);
        doc.insert(0, "abc").unwrap();
        doc.delete(0).unwrap();
        doc.set_language("go");

        let snapshot = doc.snapshot();
        assert_eq!(snapshot.text, "bc");
        assert_eq!(snapshot.items, 3);
        assert_eq!(snapshot.pending, 0);
        assert_eq!(snapshot.meta.get(LANGUAGE_KEY).map(String::as_str), Some("go"));
        assert_eq!(
            serde_json::to_value(&snapshot).unwrap()["state_vector"],
            serde_json::json!({"3": 5})
        );
    }
}
