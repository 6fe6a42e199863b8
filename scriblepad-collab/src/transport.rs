//! Replica-side connection to a relay.
//!
//! A [`Transport`] ships [`Outbound`] messages to the relay and yields
//! [`TransportEvent`]s from it. Implementations:
//! - [`LoopbackTransport`]: drives an in-process [`RelayHub`] directly
//! - [`WsTransport`](crate::client::WsTransport): WebSocket with reconnect
//!
//! Both queue document updates made while disconnected in an
//! [`OfflineQueue`] and replay them on reconnect. Awareness sent while
//! disconnected is dropped; the session re-announces it on `Connected`.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::broadcast::Envelope;
use crate::protocol::{AwarenessState, MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::relay::{RelayError, RelayHub, RelayRoom};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Messages a replica sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Our state vector; the relay answers with what we lack.
    SyncRequest(Vec<u8>),
    /// A document update (or a diff answering the relay's request).
    Update(Vec<u8>),
    Awareness {
        clock: u64,
        state: Option<AwarenessState>,
    },
}

/// What a transport reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// The relay's state vector; answer with `Outbound::Update(diff)`.
    SyncRequest(Vec<u8>),
    /// The relay's diff answering our `SyncRequest`.
    SyncResponse(Vec<u8>),
    Update(Vec<u8>),
    Awareness {
        peer: Uuid,
        clock: u64,
        state: Option<AwarenessState>,
    },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("relay rejected join: {0}")]
    Rejected(#[from] RelayError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub trait Transport: Send + Sync {
    /// Id this replica is known by on the relay.
    fn replica_id(&self) -> Uuid;

    /// Join `room`. Events arrive on the returned receiver until
    /// [`Transport::disconnect`]; transient drops are reported as
    /// `Disconnected`/`Connected` pairs.
    fn connect(
        &self,
        room: String,
        info: PeerInfo,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>>;

    /// Queue a message. Never blocks.
    fn send(&self, message: Outbound) -> Result<(), TransportError>;

    /// Flush queued messages, leave the room and stop.
    fn disconnect(&self) -> BoxFuture<'_, ()>;

    fn state(&self) -> ConnectionState;
}

/// Offline queue for updates made while disconnected.
///
/// Queued updates are replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    seq: u64,
    payload: Vec<u8>,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. `false` when full.
    pub fn enqueue(&mut self, seq: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate {
            seq,
            payload,
            queued_at: Instant::now(),
        });
        true
    }

    /// Drain all queued updates in order.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|u| (u.seq, u.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }

    /// How long the oldest update has been waiting.
    pub fn oldest_age(&self) -> Option<std::time::Duration> {
        self.queue.front().map(|u| u.queued_at.elapsed())
    }
}

/// Wire form of an outbound message.
pub(crate) fn outbound_message(
    peer: Uuid,
    room: &str,
    message: Outbound,
) -> Result<SyncMessage, ProtocolError> {
    Ok(match message {
        Outbound::SyncRequest(sv) => SyncMessage::sync_step1(peer, room, sv),
        Outbound::Update(update) => SyncMessage::update(peer, room, update),
        Outbound::Awareness { clock, state } => {
            SyncMessage::awareness(peer, room, clock, state.as_ref())?
        }
    })
}

/// Event for an inbound message, if it is one a replica cares about.
pub(crate) fn inbound_event(msg: SyncMessage) -> Option<TransportEvent> {
    match msg.msg_type {
        MessageType::SyncStep1 => Some(TransportEvent::SyncRequest(msg.payload)),
        MessageType::SyncStep2 => Some(TransportEvent::SyncResponse(msg.payload)),
        MessageType::Update => Some(TransportEvent::Update(msg.payload)),
        MessageType::Awareness => match msg.awareness_state() {
            Ok(state) => Some(TransportEvent::Awareness {
                peer: msg.peer_id,
                clock: msg.clock,
                state,
            }),
            Err(e) => {
                log::warn!("Dropping bad awareness from {}: {e}", msg.peer_id);
                None
            }
        },
        MessageType::PeerJoined => match msg.peer_info() {
            Ok(info) => Some(TransportEvent::PeerJoined(info)),
            Err(_) => Some(TransportEvent::PeerJoined(PeerInfo::anonymous(msg.peer_id))),
        },
        MessageType::PeerLeft => Some(TransportEvent::PeerLeft(msg.peer_id)),
        MessageType::Ping | MessageType::Pong => None,
    }
}

// ─── Loopback ─────────────────────────────────────────────────────────

enum Command {
    Send(Outbound),
    Interrupt,
    Resume,
    Close(oneshot::Sender<()>),
}

/// Transport that talks to an in-process [`RelayHub`].
///
/// [`interrupt`](Self::interrupt) and [`resume`](Self::resume) simulate a
/// dropped and restored connection.
pub struct LoopbackTransport {
    hub: Arc<RelayHub>,
    replica_id: Uuid,
    state: Arc<Mutex<ConnectionState>>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    queue_capacity: usize,
}

impl LoopbackTransport {
    pub fn new(hub: Arc<RelayHub>) -> Self {
        Self {
            hub,
            replica_id: Uuid::new_v4(),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            commands: Mutex::new(None),
            queue_capacity: 10_000,
        }
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// Drop the connection, as if the network went away.
    pub fn interrupt(&self) {
        self.command(Command::Interrupt);
    }

    /// Reconnect after [`interrupt`](Self::interrupt).
    pub fn resume(&self) {
        self.command(Command::Resume);
    }

    fn command(&self, command: Command) -> bool {
        match self.commands.lock().as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }
}

impl Transport for LoopbackTransport {
    fn replica_id(&self) -> Uuid {
        self.replica_id
    }

    fn connect(
        &self,
        room: String,
        info: PeerInfo,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>> {
        Box::pin(async move {
            if self.commands.lock().is_some() {
                return Err(TransportError::AlreadyConnected);
            }
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (command_tx, command_rx) = mpsc::unbounded_channel();

            let mut driver = LoopbackDriver {
                hub: self.hub.clone(),
                room,
                info,
                state: self.state.clone(),
                events: event_tx,
                queue: OfflineQueue::new(self.queue_capacity),
                link: None,
                next_seq: 0,
            };
            driver.establish().await?;
            *self.commands.lock() = Some(command_tx);
            tokio::spawn(driver.run(command_rx));
            Ok(event_rx)
        })
    }

    fn send(&self, message: Outbound) -> Result<(), TransportError> {
        if self.command(Command::Send(message)) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(tx) = self.commands.lock().take() else {
                return;
            };
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(Command::Close(ack_tx)).is_ok() {
                let _ = ack_rx.await;
            }
        })
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

struct Link {
    room: Arc<RelayRoom>,
    receiver: tokio::sync::broadcast::Receiver<Envelope>,
}

struct LoopbackDriver {
    hub: Arc<RelayHub>,
    room: String,
    info: PeerInfo,
    state: Arc<Mutex<ConnectionState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    queue: OfflineQueue,
    link: Option<Link>,
    next_seq: u64,
}

impl LoopbackDriver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send(message)) => self.send(message),
                    Some(Command::Interrupt) => self.drop_link().await,
                    Some(Command::Resume) => {
                        if let Err(e) = self.establish().await {
                            log::warn!("Loopback reconnect failed: {e}");
                        }
                    }
                    Some(Command::Close(ack)) => {
                        self.drop_link().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.drop_link().await;
                        break;
                    }
                },
                envelope = next_envelope(&mut self.link) => self.deliver(envelope).await,
            }
        }
    }

    async fn establish(&mut self) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Ok(());
        }
        *self.state.lock() = ConnectionState::Connecting;
        let joined = match self.hub.join(&self.room, self.info.clone()).await {
            Ok(joined) => joined,
            Err(e) => {
                *self.state.lock() = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        self.link = Some(Link {
            room: joined.room,
            receiver: joined.receiver,
        });
        *self.state.lock() = ConnectionState::Connected;
        self.emit(TransportEvent::Connected);
        for msg in joined.initial {
            if let Some(event) = inbound_event(msg) {
                self.emit(event);
            }
        }

        let queued = self.queue.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates", queued.len());
        }
        for (_, payload) in queued {
            self.send(Outbound::Update(payload));
        }
        Ok(())
    }

    async fn drop_link(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        self.hub.leave(&link.room, self.info.peer_id).await;
        *self.state.lock() = ConnectionState::Disconnected;
        self.emit(TransportEvent::Disconnected);
    }

    fn send(&mut self, message: Outbound) {
        let Some(link) = &self.link else {
            if let Outbound::Update(payload) = message {
                self.next_seq += 1;
                if !self.queue.enqueue(self.next_seq, payload) {
                    log::warn!("Offline queue full; update will be recovered on resync");
                }
            }
            return;
        };
        let msg = match outbound_message(self.info.peer_id, &self.room, message) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to encode outbound message: {e}");
                return;
            }
        };
        let replies = self.hub.handle(&link.room, &msg);
        for reply in replies {
            if let Some(event) = inbound_event(reply) {
                self.emit(event);
            }
        }
    }

    async fn deliver(&mut self, envelope: Result<Envelope, RecvError>) {
        match envelope {
            Ok(envelope) => {
                if envelope.sender == self.info.peer_id {
                    return;
                }
                match SyncMessage::decode(&envelope.bytes) {
                    Ok(msg) => {
                        if let Some(event) = inbound_event(msg) {
                            self.emit(event);
                        }
                    }
                    Err(e) => log::warn!("Dropping undecodable relay message: {e}"),
                }
            }
            Err(RecvError::Lagged(n)) => {
                log::warn!("Peer {} lagged by {n} messages", self.info.peer_id);
                if let Some(link) = &self.link {
                    link.room.broadcast().record_dropped(n);
                    if let Some(event) = inbound_event(link.room.catch_up()) {
                        self.emit(event);
                    }
                }
            }
            Err(RecvError::Closed) => self.drop_link().await,
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_envelope(link: &mut Option<Link>) -> Result<Envelope, RecvError> {
    match link {
        Some(link) => link.receiver.recv().await,
        None => std::future::pending().await,
    }
}
