//! # loom-core — replicated text for collaborative editing
//!
//! Everything here is synchronous and free of I/O:
//!
//! - [`crdt`] — sequence CRDT (YATA-style integration, causal buffering)
//! - [`codec`] — binary state vectors and diffs
//! - [`document`] — positional editing, diffing and change events
//! - [`awareness`] — ephemeral per-client presence with timeouts
//! - [`encoding`] — varint primitives shared by all formats
//!
//! ```text
//! Document ──► Sequence ──► Item arena (tombstones kept)
//!    │             └──────► PendingQueue (ops missing an origin)
//!    └──► codec ──► bytes on the wire
//! ```

pub mod awareness;
pub mod codec;
pub mod crdt;
pub mod document;
pub mod encoding;
pub mod error;
pub mod id;
pub mod state_vector;

pub use awareness::{
    AwarenessChanges, AwarenessEntry, AwarenessRecord, AwarenessStore, RemovalNotice, SetOutcome,
    MAX_STATE_CLOCK,
};
pub use crdt::{ApplyOutcome, Item, Op, OpKind, Sequence};
pub use document::{DocEvent, Document, DocumentSnapshot, LANGUAGE_KEY};
pub use error::{DecodeError, DocumentError};
pub use id::{ClientId, OpId};
pub use state_vector::StateVector;
