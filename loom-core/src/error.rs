//! Error types shared across the core.

use thiserror::Error;

use crate::id::{ClientId, OpId};

/// A malformed state vector, diff or awareness payload.
///
/// Returned before any state is touched: decoding is completed and
/// validated in full before integration begins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("varint overflows 64 bits at byte {0}")]
    VarintOverflow(usize),
    #[error("length {0} does not fit in memory")]
    LengthOverflow(u64),
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("client {0} has an op with clock 0")]
    ZeroClock(ClientId),
    #[error("ops for client {client} are not in increasing clock order at {clock}")]
    OutOfOrder { client: ClientId, clock: u64 },
    #[error("duplicate entry for client {0}")]
    DuplicateClient(ClientId),
    #[error("insert {0} must carry exactly one character")]
    InvalidContent(OpId),
    #[error("invalid origin tag {0}")]
    InvalidOriginTag(u64),
    #[error("op {op} references {target}, which is not an inserted item")]
    InvalidReference { op: OpId, target: OpId },
    #[error("invalid JSON in awareness state for client {client}: {reason}")]
    InvalidJson { client: ClientId, reason: String },
    #[error("awareness state for client {0} leaves no clock for its removal")]
    ClockExhausted(ClientId),
}

/// Failure of a positional edit on a [`Document`](crate::Document).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("position {pos} out of range for length {len}")]
    OutOfRange { pos: usize, len: usize },
    #[error("unknown item {0}")]
    UnknownItem(OpId),
}
