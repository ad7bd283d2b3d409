//! Per-connection sync logic, independent of the transport.
//!
//! ```text
//! connect ──► Connecting ──► SyncStep1Sent ──(client Step1)──► Synced ──► Closed
//!                 │                                                          ▲
//!                 └── Step1(room sv) + awareness bootstrap       disconnect ─┘
//! ```
//!
//! Every operation that touches a room takes the room mutex for the
//! whole apply-then-publish step, so the broadcast order of a room is the
//! order in which its document and awareness store were mutated. The
//! awareness sweeper follows the same discipline, which makes a timeout
//! and a concurrent disconnect remove a client exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use loom_core::awareness::{decode_update, encode_removals};
use loom_core::{AwarenessChanges, ClientId, DecodeError, RemovalNotice};

use crate::broadcast::{Envelope, SessionId};
use crate::protocol::{Message, ProtocolError, SyncMessage};
use crate::registry::{Room, RoomRegistry};

pub const DEFAULT_AWARENESS_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Handshake progress of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    /// The relay sent its state vector and waits for the client's.
    SyncStep1Sent,
    /// The client received everything the room had when it asked.
    Synced,
    Closed,
}

/// What a session's broadcast receiver produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A frame published by another session or by the relay.
    Frame(Arc<Vec<u8>>),
    /// The receiver fell behind and `n` frames were lost.
    Lagged(u64),
    /// The room's channel is gone.
    Closed,
}

/// One connection to one room.
///
/// A session refers to its room by id only; the room itself belongs to
/// the registry.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    room_id: String,
    state: SessionState,
    receiver: broadcast::Receiver<Arc<Envelope>>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Wait for the next frame meant for this session.
    ///
    /// Cancel-safe: frames are only consumed when returned or when they
    /// originated from this session.
    pub async fn next_delivery(&mut self) -> Delivery {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.is_for(self.id) => {
                    return Delivery::Frame(envelope.frame.clone())
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => return Delivery::Lagged(n),
                Err(RecvError::Closed) => return Delivery::Closed,
            }
        }
    }

    /// Non-blocking [`next_delivery`](Self::next_delivery).
    pub fn try_delivery(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) if envelope.is_for(self.id) => {
                    return Some(Delivery::Frame(envelope.frame.clone()))
                }
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Lagged(n)) => return Some(Delivery::Lagged(n)),
                Err(TryRecvError::Closed) => return Some(Delivery::Closed),
            }
        }
    }
}

/// Relay errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("room {0:?} does not exist")]
    UnknownRoom(String),
    #[error("session {0} is closed")]
    SessionClosed(SessionId),
}

impl From<DecodeError> for RelayError {
    fn from(e: DecodeError) -> Self {
        RelayError::Protocol(ProtocolError::Decode(e))
    }
}

/// Routes frames between sessions and the rooms they joined.
#[derive(Debug)]
pub struct Relay {
    registry: Arc<RoomRegistry>,
    awareness_timeout: Duration,
    max_frame_bytes: usize,
}

impl Relay {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            awareness_timeout: DEFAULT_AWARENESS_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_awareness_timeout(mut self, timeout: Duration) -> Self {
        self.awareness_timeout = timeout;
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn awareness_timeout(&self) -> Duration {
        self.awareness_timeout
    }

    /// Join `room_id`, creating the room if needed.
    ///
    /// Returns the session and the frames to send first: the room's state
    /// vector and, if anyone is present, the full awareness state.
    pub async fn connect(&self, room_id: &str) -> (Session, Vec<Vec<u8>>) {
        let room = self.registry.get_or_create(room_id).await;
        let id = Uuid::new_v4();

        // Subscribing under the lock guarantees that every frame published
        // after the snapshot below reaches this session.
        let mut state = room.state.lock().await;
        state.sessions.insert(id, HashSet::new());
        let receiver = room.broadcast.subscribe();
        let mut frames = vec![Message::step1(state.document.encode_state_vector()).encode()];
        if !state.awareness.is_empty() {
            frames.push(Message::awareness(state.awareness.encode_full()).encode());
        }
        let sessions = state.sessions.len();
        drop(state);

        let mut session = Session {
            id,
            room_id: room_id.to_string(),
            state: SessionState::Connecting,
            receiver,
        };
        session.state = SessionState::SyncStep1Sent;
        log::info!("Session {id} joined room {room_id:?} ({sessions} connected)");
        (session, frames)
    }

    /// Process one frame received from `session`.
    ///
    /// Returns the frames to send back to that session only. Malformed
    /// frames fail before any state is touched; unknown message types are
    /// skipped.
    pub async fn handle_frame(
        &self,
        session: &mut Session,
        frame: &[u8],
    ) -> Result<Vec<Vec<u8>>, RelayError> {
        if session.state == SessionState::Closed {
            return Err(RelayError::SessionClosed(session.id));
        }
        if frame.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_bytes,
            }
            .into());
        }
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) if e.is_unknown_type() => {
                log::debug!("Session {} sent {e}; skipped", session.id);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let room = self.room(session).await?;

        match message {
            Message::Sync(SyncMessage::Step1(sv)) => {
                let diff = room.state.lock().await.document.diff_since_encoded(&sv)?;
                session.state = SessionState::Synced;
                log::debug!(
                    "Session {} synced with room {:?} ({} byte diff)",
                    session.id,
                    room.id(),
                    diff.len()
                );
                Ok(vec![Message::step2(diff).encode()])
            }
            Message::Sync(SyncMessage::Step2(diff)) | Message::Sync(SyncMessage::Update(diff)) => {
                self.apply_update(&room, session.id, &diff).await?;
                Ok(Vec::new())
            }
            Message::Awareness(update) => {
                self.apply_awareness(&room, session.id, &update).await?;
                Ok(Vec::new())
            }
        }
    }

    /// Apply a diff to the room document and publish whatever it added.
    ///
    /// Returns the number of ops integrated.
    async fn apply_update(
        &self,
        room: &Room,
        origin: SessionId,
        diff: &[u8],
    ) -> Result<usize, RelayError> {
        let mut state = room.state.lock().await;
        let before = state.document.state_vector().clone();
        let outcome = state.document.apply_remote(diff)?;
        if outcome.integrated == 0 {
            log::trace!(
                "Update from {origin} added nothing to room {:?} ({} pending)",
                room.id(),
                outcome.pending
            );
            return Ok(0);
        }
        // Re-encode from the document: this also carries ops released
        // from the pending queue by this diff.
        let update = state.document.diff_since(&before);
        let receivers = room.broadcast.publish(Some(origin), Message::update(update).encode());
        log::debug!(
            "Room {:?}: integrated {} op(s) from {origin}, fanned out to {}",
            room.id(),
            outcome.integrated,
            receivers.saturating_sub(1)
        );
        Ok(outcome.integrated)
    }

    async fn apply_awareness(
        &self,
        room: &Room,
        origin: SessionId,
        update: &[u8],
    ) -> Result<AwarenessChanges, RelayError> {
        let entries = decode_update(update)?;
        let now = Instant::now();

        let mut guard = room.state.lock().await;
        let state = &mut *guard;
        let mut changes = AwarenessChanges::default();
        for entry in entries {
            state.awareness.apply_entry(entry, now, &mut changes);
        }
        // The latest announcer controls a client id, so a reconnecting
        // client's old session cannot remove its fresh presence.
        let announced: Vec<ClientId> = changes.added.iter().chain(&changes.updated).copied().collect();
        for (session, controlled) in state.sessions.iter_mut() {
            if *session == origin {
                controlled.extend(&announced);
                for notice in &changes.removed {
                    controlled.remove(&notice.client);
                }
            } else {
                for client in &announced {
                    controlled.remove(client);
                }
            }
        }
        // The payload is forwarded as received.
        room.broadcast
            .publish(Some(origin), Message::awareness(update.to_vec()).encode());
        log::trace!(
            "Room {:?}: awareness from {origin} (+{} ~{} -{})",
            room.id(),
            changes.added.len(),
            changes.updated.len(),
            changes.removed.len()
        );
        Ok(changes)
    }

    /// Full state for a session whose receiver lagged behind.
    pub async fn resync(&self, session: &Session, skipped: u64) -> Result<Vec<Vec<u8>>, RelayError> {
        let room = self.room(session).await?;
        room.broadcast.record_lag(skipped);
        log::warn!(
            "Session {} lagged by {skipped} frame(s) in room {:?}; resyncing",
            session.id,
            room.id()
        );
        let state = room.state.lock().await;
        let mut frames = vec![Message::step2(state.document.encode_state_as_update()).encode()];
        if !state.awareness.is_empty() {
            frames.push(Message::awareness(state.awareness.encode_full()).encode());
        }
        Ok(frames)
    }

    /// Leave the room, removing the awareness records the session
    /// announced and notifying the remaining sessions.
    ///
    /// The room document is kept even when no session remains.
    pub async fn disconnect(&self, mut session: Session) -> Vec<RemovalNotice> {
        session.state = SessionState::Closed;
        let Some(room) = self.registry.get(&session.room_id).await else {
            return Vec::new();
        };

        let mut guard = room.state.lock().await;
        let state = &mut *guard;
        let mut clients: Vec<_> = state
            .sessions
            .remove(&session.id)
            .unwrap_or_default()
            .into_iter()
            .collect();
        clients.sort_unstable();
        let notices: Vec<RemovalNotice> = clients
            .into_iter()
            .filter_map(|client| state.awareness.remove(client))
            .collect();
        if !notices.is_empty() {
            room.broadcast.publish(
                Some(session.id),
                Message::awareness(encode_removals(&notices)).encode(),
            );
        }
        let remaining = state.sessions.len();
        drop(guard);

        log::info!(
            "Session {} left room {:?} ({} awareness removal(s), {remaining} remaining)",
            session.id,
            room.id(),
            notices.len()
        );
        notices
    }

    /// Remove awareness records silent for longer than the timeout in
    /// every room, publishing one removal frame per affected room.
    pub async fn sweep(&self, now: Instant) -> Vec<RemovalNotice> {
        let mut removed = Vec::new();
        for room in self.registry.rooms().await {
            let mut guard = room.state.lock().await;
            let state = &mut *guard;
            let notices = state.awareness.sweep_expired(now, self.awareness_timeout);
            if notices.is_empty() {
                continue;
            }
            for controlled in state.sessions.values_mut() {
                for notice in &notices {
                    controlled.remove(&notice.client);
                }
            }
            room.broadcast
                .publish(None, Message::awareness(encode_removals(&notices)).encode());
            drop(guard);

            log::info!(
                "Room {:?}: {} awareness record(s) timed out",
                room.id(),
                notices.len()
            );
            removed.extend(notices);
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep(Instant::now()).await;
            }
        })
    }

    async fn room(&self, session: &Session) -> Result<Arc<Room>, RelayError> {
        self.registry
            .get(&session.room_id)
            .await
            .ok_or_else(|| RelayError::UnknownRoom(session.room_id.clone()))
    }
}
