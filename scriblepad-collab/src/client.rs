//! WebSocket transport to a [`RelayServer`](crate::server::RelayServer).
//!
//! A background driver task owns the socket:
//! ```text
//!            ┌──────────── connect_async ◄────────────┐
//!            ▼                                        │ backoff
//! Connecting ──ok──► Connected ──socket lost──► Reconnecting
//!     │                  │
//!     │                  └─ PeerJoined, replay offline queue, emit Connected
//!     └──────────── Close command ──► orderly close, stop
//! ```
//! Updates sent while the socket is down wait in an [`OfflineQueue`];
//! awareness sent while down is dropped.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::protocol::{PeerInfo, SyncMessage};
use crate::transport::{
    inbound_event, outbound_message, ConnectionState, OfflineQueue, Outbound, Transport,
    TransportError, TransportEvent,
};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL; the room is appended as a path segment.
    pub url: String,
    /// First reconnect delay; doubles per failed attempt.
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Updates kept while disconnected.
    pub offline_queue_capacity: usize,
    pub ping_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:1999".to_string(),
            reconnect_min: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            offline_queue_capacity: 10_000,
            ping_interval: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.reconnect_min
            .saturating_mul(factor)
            .min(self.reconnect_max)
    }
}

enum WsCommand {
    Send(Outbound),
    Close(oneshot::Sender<()>),
}

enum SessionEnd {
    /// Socket dropped; reconnect.
    Lost,
    /// Close requested; stop.
    Closed,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    config: ClientConfig,
    replica_id: Uuid,
    state: Arc<Mutex<ConnectionState>>,
    commands: Mutex<Option<mpsc::UnboundedSender<WsCommand>>>,
}

impl WsTransport {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            replica_id: Uuid::new_v4(),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            commands: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Transport for WsTransport {
    fn replica_id(&self) -> Uuid {
        self.replica_id
    }

    /// Starts the driver and returns at once; the socket is opened in the
    /// background and retried until [`Transport::disconnect`].
    fn connect(
        &self,
        room: String,
        info: PeerInfo,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>> {
        Box::pin(async move {
            let mut commands = self.commands.lock();
            if commands.is_some() {
                return Err(TransportError::AlreadyConnected);
            }
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            *commands = Some(command_tx);
            drop(commands);

            let driver = WsDriver {
                url: format!("{}/{}", self.config.url.trim_end_matches('/'), room),
                config: self.config.clone(),
                room,
                info,
                state: self.state.clone(),
                events: event_tx,
                queue: OfflineQueue::new(self.config.offline_queue_capacity),
                next_seq: 0,
            };
            tokio::spawn(driver.run(command_rx));
            Ok(event_rx)
        })
    }

    fn send(&self, message: Outbound) -> Result<(), TransportError> {
        match self.commands.lock().as_ref() {
            Some(tx) => tx
                .send(WsCommand::Send(message))
                .map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(tx) = self.commands.lock().take() else {
                return;
            };
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(WsCommand::Close(ack_tx)).is_ok() {
                let _ = ack_rx.await;
            }
            *self.state.lock() = ConnectionState::Disconnected;
        })
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

struct WsDriver {
    url: String,
    config: ClientConfig,
    room: String,
    info: PeerInfo,
    state: Arc<Mutex<ConnectionState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    queue: OfflineQueue,
    next_seq: u64,
}

impl WsDriver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WsCommand>) {
        let mut attempt = 0u32;
        loop {
            self.set_state(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            let connect = tokio_tungstenite::connect_async(self.url.clone());
            tokio::pin!(connect);
            let result = loop {
                tokio::select! {
                    result = &mut connect => break result,
                    command = commands.recv() => {
                        if !self.offline_command(command) {
                            return;
                        }
                    }
                }
            };

            match result {
                Ok((socket, _)) => {
                    attempt = 0;
                    match self.session(socket, &mut commands).await {
                        SessionEnd::Closed => {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        SessionEnd::Lost => {
                            log::warn!("Connection to {} lost", self.url);
                            self.set_state(ConnectionState::Reconnecting);
                            self.emit(TransportEvent::Disconnected);
                        }
                    }
                }
                Err(e) => log::warn!("Failed to connect to {}: {e}", self.url),
            }

            attempt += 1;
            let delay = self.config.backoff(attempt);
            log::debug!("Reconnecting in {delay:?} (attempt {attempt})");
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = commands.recv() => {
                        if !self.offline_command(command) {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Handle a command while no socket is open. `false` means stop.
    fn offline_command(&mut self, command: Option<WsCommand>) -> bool {
        match command {
            Some(WsCommand::Send(Outbound::Update(payload))) => {
                self.next_seq += 1;
                if !self.queue.enqueue(self.next_seq, payload) {
                    log::warn!("Offline queue full; update will be recovered on resync");
                }
                true
            }
            Some(WsCommand::Send(_)) => true,
            Some(WsCommand::Close(ack)) => {
                let _ = ack.send(());
                false
            }
            None => false,
        }
    }

    async fn session(
        &mut self,
        socket: Socket,
        commands: &mut mpsc::UnboundedReceiver<WsCommand>,
    ) -> SessionEnd {
        let (mut writer, mut reader) = socket.split();

        let joined = match SyncMessage::peer_joined(&self.room, &self.info).and_then(|m| m.encode()) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode join message: {e}");
                return SessionEnd::Lost;
            }
        };
        if writer.send(Message::Binary(joined.into())).await.is_err() {
            return SessionEnd::Lost;
        }

        self.set_state(ConnectionState::Connected);
        log::info!("Connected to {}", self.url);
        self.emit(TransportEvent::Connected);

        let queued = self.queue.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates", queued.len());
        }
        for (seq, payload) in queued {
            let msg = SyncMessage::update(self.info.peer_id, &self.room, payload);
            let sent = match msg.encode() {
                Ok(bytes) => writer.send(Message::Binary(bytes.into())).await.is_ok(),
                Err(_) => true,
            };
            if !sent {
                self.queue.enqueue(seq, msg.payload);
                return SessionEnd::Lost;
            }
        }

        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );

        loop {
            tokio::select! {
                incoming = reader.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                        Ok(msg) => {
                            if msg.peer_id == self.info.peer_id {
                                continue;
                            }
                            if let Some(event) = inbound_event(msg) {
                                self.emit(event);
                            }
                        }
                        Err(e) => log::warn!("Failed to decode relay message: {e}"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if writer.send(Message::Pong(data)).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                },

                command = commands.recv() => match command {
                    Some(WsCommand::Send(message)) => {
                        let queued_update = match &message {
                            Outbound::Update(payload) => Some(payload.clone()),
                            _ => None,
                        };
                        let bytes = match outbound_message(self.info.peer_id, &self.room, message)
                            .and_then(|m| m.encode())
                        {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                log::warn!("Failed to encode outbound message: {e}");
                                continue;
                            }
                        };
                        if writer.send(Message::Binary(bytes.into())).await.is_err() {
                            if let Some(payload) = queued_update {
                                self.next_seq += 1;
                                self.queue.enqueue(self.next_seq, payload);
                            }
                            return SessionEnd::Lost;
                        }
                    }
                    Some(WsCommand::Close(ack)) => {
                        // Earlier sends were awaited, so they precede the close frame.
                        let _ = writer.close().await;
                        log::info!("Disconnected from {}", self.url);
                        let _ = ack.send(());
                        return SessionEnd::Closed;
                    }
                    None => {
                        let _ = writer.close().await;
                        return SessionEnd::Closed;
                    }
                },

                _ = ping.tick() => {
                    let Ok(bytes) = SyncMessage::ping(self.info.peer_id).encode() else {
                        continue;
                    };
                    if writer.send(Message::Binary(bytes.into())).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}
