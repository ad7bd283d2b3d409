//! WebSocket relay server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/<room>
//!             ├── Session ── Relay ── RoomRegistry ── Room (room id)
//! Client B ──┘                                         ├── Document
//!                                                      ├── AwarenessStore
//!                                                      └── BroadcastGroup
//!                                                              │
//!                                                   ┌──────────┼──────────┐
//!                                                   ▼          ▼          ▼
//!                                                Client A   Client B   Client C
//! ```
//!
//! Each connection runs in its own task and pumps two sources: frames from
//! its socket, handed to the [`Relay`], and frames published to its room,
//! forwarded to the socket. A single sweeper task expires silent
//! awareness records in every room.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::registry::RoomRegistry;
use crate::relay::{
    Delivery, Relay, Session, DEFAULT_AWARENESS_TIMEOUT, DEFAULT_MAX_FRAME_BYTES,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per session before it lags and gets resynced
    pub broadcast_capacity: usize,
    /// Silence after which an awareness record is removed
    pub awareness_timeout: Duration,
    /// Period of the awareness sweeper
    pub sweep_interval: Duration,
    /// Larger messages are refused by the WebSocket layer
    pub max_frame_bytes: usize,
    /// Room used when the request path is empty
    pub default_room: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            broadcast_capacity: 256,
            awareness_timeout: DEFAULT_AWARENESS_TIMEOUT,
            sweep_interval: Duration::from_secs(5),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            default_room: "default".to_string(),
        }
    }
}

impl ServerConfig {
    /// WebSocket limits matching `max_frame_bytes`, so oversized messages
    /// are refused before they are buffered.
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_frame_bytes))
            .max_frame_size(Some(self.max_frame_bytes))
    }

    /// Room addressed by a request path such as `/my-room`.
    pub fn room_for_path(&self, path: &str) -> String {
        match path.trim_start_matches('/') {
            "" => self.default_room.clone(),
            room => room.to_string(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
    rejected_frames: AtomicU64,
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    relay: Arc<Relay>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.broadcast_capacity));
        let relay = Relay::new(registry)
            .with_awareness_timeout(config.awareness_timeout)
            .with_max_frame_bytes(config.max_frame_bytes);
        Self {
            config,
            relay: Arc::new(relay),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        let sweeper = self.relay.clone().spawn_sweeper(self.config.sweep_interval);
        let result = self.accept_loop(listener).await;
        sweeper.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, relay, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: Arc<Relay>,
        stats: Arc<AtomicServerStats>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let mut path = String::new();
        let capture_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            capture_path,
            Some(config.websocket_config()),
        )
        .await?;
        let room_id = config.room_for_path(&path);
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection from {addr} for room {room_id:?}");

        let (mut session, initial) = relay.connect(&room_id).await;
        let result = Self::pump(
            &relay,
            &stats,
            addr,
            &mut session,
            initial,
            &mut ws_sender,
            &mut ws_receiver,
        )
        .await;

        // Runs however the pump ended.
        relay.disconnect(session).await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn pump<W, R>(
        relay: &Relay,
        stats: &AtomicServerStats,
        addr: SocketAddr,
        session: &mut Session,
        initial: Vec<Vec<u8>>,
        ws_sender: &mut W,
        ws_receiver: &mut R,
    ) -> Result<(), BoxError>
    where
        W: Sink<Message, Error = WsError> + Unpin,
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        for frame in initial {
            ws_sender.send(Message::Binary(frame.into())).await?;
        }

        loop {
            let mut lagged = None;
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            stats.total_frames.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                            match relay.handle_frame(session, &data).await {
                                Ok(replies) => {
                                    for reply in replies {
                                        ws_sender.send(Message::Binary(reply.into())).await?;
                                    }
                                }
                                Err(e) => {
                                    stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Dropped frame from {addr}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                    }
                }

                delivery = session.next_delivery() => {
                    match delivery {
                        Delivery::Frame(frame) => {
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                        Delivery::Lagged(n) => lagged = Some(n),
                        Delivery::Closed => break,
                    }
                }
            }

            if let Some(skipped) = lagged {
                for frame in relay.resync(session, skipped).await? {
                    ws_sender.send(Message::Binary(frame.into())).await?;
                }
            }
        }
        Ok(())
    }

    /// Lock-free snapshot of the counters plus the current room count.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_frames: self.stats.total_frames.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            rejected_frames: self.stats.rejected_frames.load(Ordering::Relaxed),
            active_rooms: self.relay.registry().room_count().await,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        self.relay.registry()
    }
}
