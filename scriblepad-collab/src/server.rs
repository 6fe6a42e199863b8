//! WebSocket relay server.
//!
//! ```text
//! Client A ──┐                      ┌── DocumentStore (RocksDB, optional)
//!            ├── RelayServer ── RelayHub ── RelayRoom ── BroadcastGroup
//! Client B ──┘   (accept loop,                                │
//!                 one task per                     ┌──────────┼──────────┐
//!                 connection)                      ▼          ▼          ▼
//!                                               Client A   Client B   Client C
//! ```
//!
//! The first message on a connection must be `PeerJoined`; it names the
//! room. Everything after that is routed through the hub.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::Envelope;
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::relay::{RelayHub, RelayRoom};
use crate::storage::{DocumentStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast buffer per peer, in messages
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1999".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_updates: u64,
    pub persisted_snapshots: u64,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct RelayServer {
    config: ServerConfig,
    hub: Arc<RelayHub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Create a server, opening the store if `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(DocumentStore::open(store_config)?))
            }
            None => None,
        };
        let hub = Arc::new(RelayHub::new(&config, store));
        Ok(Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        Self {
            hub: Arc::new(RelayHub::new(&config, None)),
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<RelayHub>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut member: Option<(Arc<RelayRoom>, Uuid)> = None;
        let result = Self::relay_messages(ws_stream, addr, &hub, &stats, &mut member).await;

        if let Some((room, peer_id)) = member {
            hub.leave(&room, peer_id).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    /// Pump messages until the socket closes. `member` is set once the
    /// peer has joined, so the caller can remove it afterwards.
    async fn relay_messages(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        hub: &RelayHub,
        stats: &RwLock<ServerStats>,
        member: &mut Option<(Arc<RelayRoom>, Uuid)>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut receiver: Option<broadcast::Receiver<Envelope>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };

                        match member.clone() {
                            None if sync_msg.msg_type == MessageType::PeerJoined => {
                                let info = sync_msg
                                    .peer_info()
                                    .unwrap_or_else(|_| PeerInfo::anonymous(sync_msg.peer_id));
                                let peer_id = info.peer_id;
                                match hub.join(&sync_msg.room, info).await {
                                    Ok(joined) => {
                                        receiver = Some(joined.receiver);
                                        *member = Some((joined.room, peer_id));
                                        for initial in joined.initial {
                                            ws_sender.send(Message::Binary(initial.encode()?.into())).await?;
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!("Rejected {addr}: {e}");
                                        ws_sender.close().await?;
                                        return Ok(());
                                    }
                                }
                            }
                            None => {
                                log::debug!("Ignoring {:?} from {addr} before join", sync_msg.msg_type);
                            }
                            Some((room, peer_id)) => {
                                if sync_msg.peer_id != peer_id {
                                    log::warn!("Dropping message from {addr} with foreign peer id");
                                    continue;
                                }
                                for reply in hub.handle(&room, &sync_msg) {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                },

                envelope = next_envelope(&mut receiver) => match envelope {
                    Ok(envelope) => {
                        // Don't echo back to sender
                        if member.as_ref().is_some_and(|(_, peer)| *peer == envelope.sender) {
                            continue;
                        }
                        ws_sender.send(Message::Binary(envelope.bytes.to_vec().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer at {addr} lagged by {n} messages");
                        if let Some((room, _)) = member.as_ref() {
                            room.broadcast().record_dropped(n);
                            ws_sender.send(Message::Binary(room.catch_up().encode()?.into())).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let hub = self.hub.stats().await;
        stats.active_rooms = hub.active_rooms;
        stats.persisted_updates = hub.persisted_updates;
        stats.persisted_snapshots = hub.persisted_snapshots;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }
}

async fn next_envelope(
    receiver: &mut Option<broadcast::Receiver<Envelope>>,
) -> Result<Envelope, broadcast::error::RecvError> {
    match receiver {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
