//! Binary wire protocol between editors and the relay.
//!
//! Each WebSocket binary message carries exactly one frame:
//! ```text
//! ┌──────────┬──────────────┬──────────────────────────┐
//! │ family   │ sync subtype │ payload                  │
//! │ varint   │ varint       │ varint len │ bytes       │
//! └──────────┴──────────────┴──────────────────────────┘
//!   0 = Sync   0 = Step1 (state vector)
//!              1 = Step2 (diff)
//!              2 = Update (diff)
//!   1 = Awareness (no subtype; payload = awareness update)
//! ```

use loom_core::encoding::{Decoder, Encoder};
use loom_core::DecodeError;
use thiserror::Error;

pub const MESSAGE_SYNC: u64 = 0;
pub const MESSAGE_AWARENESS: u64 = 1;

pub const SYNC_STEP1: u64 = 0;
pub const SYNC_STEP2: u64 = 1;
pub const SYNC_UPDATE: u64 = 2;

/// Document synchronisation messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Sender's encoded state vector; the receiver answers with Step2.
    Step1(Vec<u8>),
    /// Diff answering a Step1.
    Step2(Vec<u8>),
    /// Incremental diff pushed after the handshake.
    Update(Vec<u8>),
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Encoded awareness update, opaque to the relay.
    Awareness(Vec<u8>),
}

impl Message {
    pub fn step1(state_vector: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::Step1(state_vector))
    }

    pub fn step2(diff: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::Step2(diff))
    }

    pub fn update(diff: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::Update(diff))
    }

    pub fn awareness(update: Vec<u8>) -> Self {
        Message::Awareness(update)
    }

    /// Serialize to a binary frame.
    pub fn encode(&self) -> Vec<u8> {
        let payload = match self {
            Message::Sync(sync) => sync.payload(),
            Message::Awareness(update) => update,
        };
        let mut enc = Encoder::with_capacity(payload.len() + 8);
        match self {
            Message::Sync(sync) => {
                enc.write_var_u64(MESSAGE_SYNC);
                enc.write_var_u64(sync.subtype());
            }
            Message::Awareness(_) => enc.write_var_u64(MESSAGE_AWARENESS),
        }
        enc.write_var_bytes(payload);
        enc.into_bytes()
    }

    /// Deserialize a binary frame.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(frame);
        let message = match dec.read_var_u64()? {
            MESSAGE_SYNC => {
                let sync = match dec.read_var_u64()? {
                    SYNC_STEP1 => SyncMessage::Step1(dec.read_var_bytes()?.to_vec()),
                    SYNC_STEP2 => SyncMessage::Step2(dec.read_var_bytes()?.to_vec()),
                    SYNC_UPDATE => SyncMessage::Update(dec.read_var_bytes()?.to_vec()),
                    other => return Err(ProtocolError::UnknownSyncType(other)),
                };
                Message::Sync(sync)
            }
            MESSAGE_AWARENESS => Message::Awareness(dec.read_var_bytes()?.to_vec()),
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        dec.finish()?;
        Ok(message)
    }
}

impl SyncMessage {
    pub fn subtype(&self) -> u64 {
        match self {
            SyncMessage::Step1(_) => SYNC_STEP1,
            SyncMessage::Step2(_) => SYNC_STEP2,
            SyncMessage::Update(_) => SYNC_UPDATE,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            SyncMessage::Step1(p) | SyncMessage::Step2(p) | SyncMessage::Update(p) => p,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),
    #[error("unknown message type {0}")]
    UnknownMessageType(u64),
    #[error("unknown sync message type {0}")]
    UnknownSyncType(u64),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("connection closed")]
    ConnectionClosed,
}

impl ProtocolError {
    /// Unknown message kinds are skipped for forward compatibility.
    pub fn is_unknown_type(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownMessageType(_) | ProtocolError::UnknownSyncType(_)
        )
    }
}
