//! Sequence CRDT for plain text.

pub mod op;
pub mod pending;
pub mod sequence;

pub use op::{Op, OpKind};
pub use pending::PendingQueue;
pub use sequence::{ApplyOutcome, Item, Sequence};
