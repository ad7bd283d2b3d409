//! Room registry: room id → (Document, AwarenessStore, sessions).
//!
//! Rooms are created lazily by the first connection and kept for the
//! lifetime of the process. Every mutation of a room happens under its
//! own mutex; no lock spans two rooms.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use loom_core::{AwarenessStore, ClientId, Document, DocumentSnapshot};

use crate::broadcast::{BroadcastGroup, SessionId};

/// Client id under which the room's authoritative document would author
/// edits. The relay never edits, so it never appears in a state vector.
pub const RELAY_CLIENT_ID: ClientId = 0;

/// Mutable state of a room, guarded by [`Room::state`].
#[derive(Debug)]
pub struct RoomState {
    pub document: Document,
    pub awareness: AwarenessStore,
    /// Live sessions and the awareness client ids each one announced.
    pub sessions: HashMap<SessionId, HashSet<ClientId>>,
}

impl RoomState {
    fn new() -> Self {
        Self {
            document: Document::new(RELAY_CLIENT_ID),
            awareness: AwarenessStore::new(),
            sessions: HashMap::new(),
        }
    }
}

/// One collaboration room.
#[derive(Debug)]
pub struct Room {
    id: String,
    /// Held for one apply-then-publish step so that publish order equals
    /// apply order.
    pub state: Mutex<RoomState>,
    pub broadcast: BroadcastGroup,
}

impl Room {
    pub fn new(id: impl Into<String>, broadcast_capacity: usize) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(RoomState::new()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn text(&self) -> String {
        self.state.lock().await.document.text()
    }
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    broadcast_capacity: usize,
}

impl RoomRegistry {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
        }
    }

    /// Fetch the room `id`, creating it if absent.
    ///
    /// Concurrent callers for the same new id all receive the same room.
    pub async fn get_or_create(&self, id: &str) -> Arc<Room> {
        // Fast path: read lock
        if let Some(room) = self.rooms.read().await.get(id) {
            return room.clone();
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(id) {
            return room.clone();
        }

        let room = Arc::new(Room::new(id, self.broadcast_capacity));
        rooms.insert(id.to_string(), room.clone());
        log::info!("Created room {id:?}");
        room
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(id).cloned()
    }

    /// Snapshot of every room, for the awareness sweeper.
    pub async fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Diagnostic summary of every room document, sorted by room id.
    pub async fn snapshots(&self) -> Vec<(String, DocumentSnapshot)> {
        let mut snapshots = Vec::new();
        for room in self.rooms().await {
            let snapshot = room.state.lock().await.document.snapshot();
            snapshots.push((room.id().to_string(), snapshot));
        }
        snapshots.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        snapshots
    }
}

impl std::fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRegistry")
            .field("broadcast_capacity", &self.broadcast_capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_same_room() {
        let registry = RoomRegistry::new(16);
        let a = registry.get_or_create("notes").await;
        let b = registry.get_or_create("notes").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 1);
        assert_eq!(a.id(), "notes");
    }

    #[tokio::test]
    async fn test_concurrent_creation_is_atomic() {
        let registry = Arc::new(RoomRegistry::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create("race").await })
            })
            .collect();

        let mut rooms = Vec::new();
        for handle in handles {
            rooms.push(handle.await.unwrap());
        }
        assert!(rooms.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let registry = RoomRegistry::new(16);
        let a = registry.get_or_create("a").await;
        let b = registry.get_or_create("b").await;

        let mut editor = Document::new(7);
        editor.insert(0, "only in a").unwrap();
        a.state
            .lock()
            .await
            .document
            .apply_remote(&editor.encode_state_as_update())
            .unwrap();

        assert_eq!(a.text().await, "only in a");
        assert_eq!(b.text().await, "");
        assert_eq!(registry.room_ids().await, vec!["a".to_string(), "b".to_string()]);

        let snapshots = registry.snapshots().await;
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].0, "a");
        assert_eq!(snapshots[0].1.text, "only in a");
        assert_eq!(snapshots[1].1.state_vector, loom_core::StateVector::new());
    }

    #[tokio::test]
    async fn test_get_missing() {
        let registry = RoomRegistry::new(16);
        assert!(registry.get("nope").await.is_none());
        registry.get_or_create("yes").await;
        assert!(registry.get("yes").await.is_some());
        assert_eq!(registry.rooms().await.len(), 1);
    }
}
