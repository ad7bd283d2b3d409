//! Fan-out of encoded frames to every session of a room.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers.
//! Each session gets an independent receiver buffering up to `capacity`
//! frames; a session falling further behind observes `Lagged` and is
//! resynchronised by the relay instead of silently missing updates.
//!
//! Frames are tagged with the session they came from so that a receiver
//! can skip its own traffic (no echo).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Identifier of one connection to the relay.
pub type SessionId = Uuid;

/// One published frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Session that caused the frame; `None` for relay-originated frames
    /// such as timeout removals, which every session receives.
    pub origin: Option<SessionId>,
    pub frame: Arc<Vec<u8>>,
}

impl Envelope {
    /// Whether the session `session` should forward this frame.
    pub fn is_for(&self, session: SessionId) -> bool {
        self.origin != Some(session)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Frames skipped by lagging receivers.
    pub messages_lagged: u64,
    pub subscribers: usize,
}

/// Atomic stats so that `publish` never takes a lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// Broadcast channel of a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per receiver before it
    /// starts lagging. Must be non-zero.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Publish `frame` to every subscriber.
    ///
    /// Returns the number of receivers, including the origin's own (which
    /// filters the frame out on delivery).
    pub fn publish(&self, origin: Option<SessionId>, frame: Vec<u8>) -> usize {
        let envelope = Arc::new(Envelope {
            origin,
            frame: Arc::new(frame),
        });
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error: the room may be empty.
        self.sender.send(envelope).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }

    /// Account for `skipped` frames lost by a lagging receiver.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

impl std::fmt::Debug for BroadcastGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastGroup")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
