//! # loom-collab — real-time relay and client for loom documents
//!
//! Multiplexes many rooms over WebSocket connections. Each room holds an
//! authoritative [`loom_core::Document`] and [`loom_core::AwarenessStore`];
//! sessions exchange binary sync and awareness frames with it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │   Step1/Step2/      │ (relay)     │
//! └──────┬──────┘   Update/Awareness  └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Document    │                     │ RoomRegistry│
//! │ (local)     │                     │ room → Room │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — closed message enum and its varint framing
//! - [`broadcast`] — per-room fan-out with origin tagging
//! - [`registry`] — lazily created rooms, one lock per room
//! - [`relay`] — handshake, apply-then-publish, disconnect, awareness sweep
//! - [`server`] — WebSocket listener driving the relay
//! - [`client`] — WebSocket client owning a local replica

pub mod protocol;
pub mod broadcast;
pub mod registry;
pub mod relay;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{Message, ProtocolError, SyncMessage};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope, SessionId};
pub use registry::{Room, RoomRegistry, RoomState};
pub use relay::{Delivery, Relay, RelayError, Session, SessionState};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
