//! WebSocket sync client for connecting to the relay.
//!
//! Provides:
//! - Connection lifecycle and the two-step handshake
//! - A local [`Document`] kept in sync with the room
//! - Awareness (cursor/selection) publishing with a monotonic clock
//!
//! Edits made while disconnected stay in the local document and reach the
//! room on the next handshake: the relay's Step1 is answered with a diff
//! of everything it lacks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use loom_core::awareness::{encode_removals, encode_update};
use loom_core::{
    ApplyOutcome, AwarenessChanges, AwarenessEntry, AwarenessStore, ClientId, Document,
    DocumentError, OpId, StateVector,
};

use crate::protocol::{Message, ProtocolError, SyncMessage};

const CHANNEL_CAPACITY: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, handshake in progress.
    Connected,
    /// The relay's Step2 was applied.
    Synced,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    /// Initial state received from the relay.
    Synced,
    /// A remote diff changed the local document.
    RemoteUpdate(ApplyOutcome),
    /// Remote presence changed.
    Awareness(AwarenessChanges),
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// State shared with the connection tasks.
struct Shared {
    client_id: ClientId,
    document: Mutex<Document>,
    awareness: Mutex<AwarenessStore>,
    awareness_clock: AtomicU64,
    state: RwLock<ConnectionState>,
    events: mpsc::Sender<SyncEvent>,
}

impl Shared {
    /// Never waits: an event that does not fit is dropped so that an
    /// undrained receiver cannot stall the connection.
    fn emit(&self, event: SyncEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::warn!("Client {}: event queue full, dropping {event:?}", self.client_id);
            }
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Apply one frame from the relay, returning the reply to send, if any.
    async fn handle_frame(&self, frame: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        match Message::decode(frame)? {
            Message::Sync(SyncMessage::Step1(sv)) => {
                let diff = self.document.lock().await.diff_since_encoded(&sv)?;
                log::debug!("Client {}: answering Step1 with {} bytes", self.client_id, diff.len());
                Ok(Some(Message::step2(diff).encode()))
            }
            Message::Sync(SyncMessage::Step2(diff)) => {
                let outcome = self.document.lock().await.apply_remote(&diff)?;
                if !outcome.is_noop() {
                    self.emit(SyncEvent::RemoteUpdate(outcome));
                }
                self.set_state(ConnectionState::Synced).await;
                self.emit(SyncEvent::Synced);
                Ok(None)
            }
            Message::Sync(SyncMessage::Update(diff)) => {
                let outcome = self.document.lock().await.apply_remote(&diff)?;
                if !outcome.is_noop() {
                    self.emit(SyncEvent::RemoteUpdate(outcome));
                }
                Ok(None)
            }
            Message::Awareness(update) => {
                let changes = self
                    .awareness
                    .lock()
                    .await
                    .apply_update(&update, Instant::now())?;
                if !changes.is_empty() {
                    self.emit(SyncEvent::Awareness(changes));
                }
                Ok(None)
            }
        }
    }
}

/// The sync client.
///
/// Take the event receiver with [`take_event_rx`](Self::take_event_rx)
/// and drain it; events that find it full are dropped.
pub struct SyncClient {
    shared: Arc<Shared>,
    room: String,
    server_url: String,
    awareness_renewal: Option<Duration>,
    has_connected: bool,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    /// A client editing `room` on the relay at `server_url` (`ws://host:port`).
    pub fn new(client_id: ClientId, server_url: impl Into<String>, room: impl Into<String>) -> Self {
        let (events, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                client_id,
                document: Mutex::new(Document::new(client_id)),
                awareness: Mutex::new(AwarenessStore::new()),
                awareness_clock: AtomicU64::new(0),
                state: RwLock::new(ConnectionState::Disconnected),
                events,
            }),
            room: room.into(),
            server_url: server_url.into(),
            awareness_renewal: None,
            has_connected: false,
            outgoing_tx: None,
            event_rx: Some(event_rx),
        }
    }

    /// Re-publish the local awareness state every `interval` while
    /// connected, keeping it alive on the relay. Pick an interval well
    /// below the relay's awareness timeout.
    pub fn with_awareness_renewal(mut self, interval: Duration) -> Self {
        self.awareness_renewal = Some(interval);
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.room)
    }

    /// Connect and start the handshake.
    ///
    /// Spawns the writer and reader tasks; returns once the socket is open.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.shared.set_state(ConnectionState::Connecting).await;
        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.url()).await {
            Ok(connected) => connected,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected).await;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        // Writer task: ends, closing the socket, once every strong sender
        // is gone.
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(WsMessage::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        let step1 = Message::step1(self.shared.document.lock().await.encode_state_vector());
        out_tx
            .send(step1.encode())
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        self.shared.set_state(ConnectionState::Connected).await;
        self.shared.emit(SyncEvent::Connected);
        log::info!("Client {} connected to {}", self.shared.client_id, self.url());

        // The relay removed our presence at `clock + 1` when the previous
        // connection closed; step past that clock before announcing again.
        if self.has_connected {
            self.shared.awareness_clock.fetch_add(1, Ordering::SeqCst);
        }
        self.has_connected = true;

        // Announce presence set while offline.
        if let Some(state) = self.local_awareness().await {
            let frame = self.next_awareness_frame(state).await;
            let _ = out_tx.send(frame).await;
        }

        // Reader task: holds only a weak sender so that `disconnect` can
        // close the socket.
        let shared = self.shared.clone();
        let replies = out_tx.downgrade();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Binary(data)) => match shared.handle_frame(&data).await {
                        Ok(Some(reply)) => {
                            if let Some(tx) = replies.upgrade() {
                                let _ = tx.send(reply).await;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("Client {}: dropped frame: {e}", shared.client_id),
                    },
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            // Connection lost
            shared.set_state(ConnectionState::Disconnected).await;
            shared.emit(SyncEvent::Disconnected);
            log::info!("Client {} disconnected", shared.client_id);
        });

        if let Some(interval) = self.awareness_renewal {
            self.spawn_renewal(interval, out_tx.downgrade());
        }

        self.outgoing_tx = Some(out_tx);
        Ok(())
    }

    fn spawn_renewal(&self, interval: Duration, outgoing: mpsc::WeakSender<Vec<u8>>) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tx) = outgoing.upgrade() else {
                    return;
                };
                let state = shared
                    .awareness
                    .lock()
                    .await
                    .get(shared.client_id)
                    .map(|r| r.state.clone());
                if let Some(state) = state {
                    let frame = awareness_frame(&shared, state).await;
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    /// Close the connection. The local document is kept.
    pub async fn disconnect(&mut self) {
        // Dropping the last strong sender stops the writer, which closes
        // the socket; the reader then reports `Disconnected`.
        self.outgoing_tx = None;
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx.send(frame).await.map_err(|_| ProtocolError::ConnectionClosed),
            // Offline: the next handshake carries the change.
            None => Ok(()),
        }
    }

    /// Send the ops authored since `before`.
    async fn publish_since(&self, before: &StateVector) -> Result<(), ProtocolError> {
        let diff = self.shared.document.lock().await.diff_since(before);
        self.send(Message::update(diff).encode()).await
    }

    /// Insert `text` at visible position `pos` and send the change.
    pub async fn insert(&self, pos: usize, text: &str) -> Result<Vec<OpId>, ClientError> {
        let (before, ids) = {
            let mut doc = self.shared.document.lock().await;
            let before = doc.state_vector().clone();
            (before, doc.insert(pos, text)?)
        };
        self.publish_since(&before).await?;
        Ok(ids)
    }

    /// Delete `count` characters at visible position `pos` and send the change.
    pub async fn delete(&self, pos: usize, count: usize) -> Result<Vec<OpId>, ClientError> {
        let (before, ids) = {
            let mut doc = self.shared.document.lock().await;
            let before = doc.state_vector().clone();
            (before, doc.delete_range(pos, count)?)
        };
        self.publish_since(&before).await?;
        Ok(ids)
    }

    pub async fn set_language(&self, language: &str) -> Result<OpId, ClientError> {
        let (before, id) = {
            let mut doc = self.shared.document.lock().await;
            let before = doc.state_vector().clone();
            (before, doc.set_language(language))
        };
        self.publish_since(&before).await?;
        Ok(id)
    }

    /// Publish this client's presence.
    pub async fn set_awareness(&self, state: Value) -> Result<(), ClientError> {
        let frame = self.next_awareness_frame(state).await;
        Ok(self.send(frame).await?)
    }

    /// Withdraw this client's presence.
    pub async fn clear_awareness(&self) -> Result<(), ClientError> {
        let notice = self.shared.awareness.lock().await.remove(self.shared.client_id);
        let Some(notice) = notice else {
            return Ok(());
        };
        self.shared.awareness_clock.store(notice.clock, Ordering::SeqCst);
        Ok(self.send(Message::awareness(encode_removals(&[notice])).encode()).await?)
    }

    async fn next_awareness_frame(&self, state: Value) -> Vec<u8> {
        awareness_frame(&self.shared, state).await
    }

    async fn local_awareness(&self) -> Option<Value> {
        let awareness = self.shared.awareness.lock().await;
        awareness.get(self.shared.client_id).map(|r| r.state.clone())
    }

    pub async fn text(&self) -> String {
        self.shared.document.lock().await.text()
    }

    pub async fn language(&self) -> Option<String> {
        self.shared.document.lock().await.language().map(str::to_string)
    }

    /// Run `f` against the local document.
    pub async fn with_document<T>(&self, f: impl FnOnce(&Document) -> T) -> T {
        f(&*self.shared.document.lock().await)
    }

    /// Presence of every known client, this one included.
    pub async fn awareness_states(&self) -> Vec<(ClientId, Value)> {
        let awareness = self.shared.awareness.lock().await;
        awareness
            .clients()
            .into_iter()
            .filter_map(|c| awareness.get(c).map(|r| (c, r.state.clone())))
            .collect()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.client_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Record `state` locally under the next clock and encode it for the relay.
async fn awareness_frame(shared: &Shared, state: Value) -> Vec<u8> {
    let clock = shared.awareness_clock.fetch_add(1, Ordering::SeqCst) + 1;
    shared
        .awareness
        .lock()
        .await
        .set_local(shared.client_id, clock, state.clone(), Instant::now());
    let entry = AwarenessEntry {
        client: shared.client_id,
        clock,
        state: Some(state),
    };
    Message::awareness(encode_update(&[entry])).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new(7, "ws://localhost:1234/", "notes");
        assert_eq!(client.client_id(), 7);
        assert_eq!(client.room(), "notes");
        assert_eq!(client.server_url(), "ws://localhost:1234/");
        assert_eq!(client.url(), "ws://localhost:1234/notes");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(1, "ws://localhost:1234", "notes");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.text().await, "");
        assert!(client.awareness_states().await.is_empty());
    }

    #[tokio::test]
    async fn test_offline_edits_stay_local() {
        let client = SyncClient::new(1, "ws://localhost:1234", "notes");
        client.insert(0, "hello").await.unwrap();
        client.delete(0, 1).await.unwrap();
        client.set_language("rust").await.unwrap();
        assert_eq!(client.text().await, "ello");
        assert_eq!(client.language().await.as_deref(), Some("rust"));
        assert!(matches!(
            client.insert(99, "x").await,
            Err(ClientError::Document(DocumentError::OutOfRange { .. }))
        ));
        assert_eq!(client.with_document(|doc| doc.state_vector().get(1)).await, 7);
    }

    #[tokio::test]
    async fn test_awareness_clock_increases() {
        let client = SyncClient::new(3, "ws://localhost:1234", "notes");
        client.set_awareness(json!({"cursor": 1})).await.unwrap();
        client.set_awareness(json!({"cursor": 2})).await.unwrap();
        assert_eq!(client.awareness_states().await, vec![(3, json!({"cursor": 2}))]);

        client.clear_awareness().await.unwrap();
        assert!(client.awareness_states().await.is_empty());
        // A later state must outrank the removal.
        client.set_awareness(json!({"cursor": 3})).await.unwrap();
        assert_eq!(client.awareness_states().await, vec![(3, json!({"cursor": 3}))]);
    }

    #[tokio::test]
    async fn test_handle_frames() {
        let client = SyncClient::new(2, "ws://localhost:1234", "notes");
        let shared = &client.shared;

        let reply = shared.handle_frame(&Message::step1(vec![0]).encode()).await.unwrap();
        assert!(matches!(
            Message::decode(&reply.unwrap()).unwrap(),
            Message::Sync(SyncMessage::Step2(_))
        ));

        let mut remote = Document::new(9);
        remote.insert(0, "hi").unwrap();
        let step2 = Message::step2(remote.encode_state_as_update()).encode();
        assert_eq!(shared.handle_frame(&step2).await.unwrap(), None);
        assert_eq!(client.text().await, "hi");
        assert_eq!(client.connection_state().await, ConnectionState::Synced);

        assert!(shared.handle_frame(&[0, 2, 3, 1, 1, 1]).await.is_err());
        assert_eq!(client.text().await, "hi");
    }

    #[tokio::test]
    async fn test_undrained_events_do_not_block() {
        let client = SyncClient::new(2, "ws://localhost:1234", "notes");
        let mut remote = Document::new(9);
        let frames: Vec<Vec<u8>> = (0..CHANNEL_CAPACITY + 10)
            .map(|pos| {
                let before = remote.state_vector().clone();
                remote.insert(pos, "x").unwrap();
                Message::update(remote.diff_since(&before)).encode()
            })
            .collect();

        tokio::time::timeout(Duration::from_secs(5), async {
            for frame in &frames {
                client.shared.handle_frame(frame).await.unwrap();
            }
        })
        .await
        .expect("frame handling waited on the event queue");
        assert_eq!(client.text().await.len(), CHANNEL_CAPACITY + 10);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(1, "ws://localhost:1234", "notes");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut client = SyncClient::new(1, format!("ws://127.0.0.1:{port}"), "notes");
        assert!(matches!(client.connect().await, Err(ClientError::Connect(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
