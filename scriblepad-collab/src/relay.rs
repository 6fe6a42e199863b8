//! In-process relay: rooms, authoritative state, fan-out.
//!
//! ```text
//! Peer A ──┐                         ┌── DocumentStore (optional)
//!          ├── RelayHub ── RelayRoom ┤     snapshot + deltas
//! Peer B ──┘       │          │      └── BroadcastGroup ──► A, B, …
//!                  │          └── last awareness per peer
//!                  └── rooms: name → Arc<RelayRoom>
//! ```
//!
//! The hub is transport-agnostic: the WebSocket server and the loopback
//! transport both drive it through [`RelayHub::join`], [`RelayHub::handle`]
//! and [`RelayHub::leave`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use scriblepad_core::DocumentError;

use crate::broadcast::{BroadcastGroup, Envelope};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::server::ServerConfig;
use crate::storage::DocumentStore;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("room {room} is full ({max} peers)")]
    RoomFull { room: String, max: usize },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Persistence counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub active_rooms: usize,
    pub persisted_updates: u64,
    pub persisted_snapshots: u64,
}

#[derive(Debug, Clone)]
struct PeerAwareness {
    clock: u64,
    /// Last non-removal message, replayed to peers that join later.
    message: Option<SyncMessage>,
}

/// One room: authoritative yrs doc, broadcast group, awareness cache.
pub struct RelayRoom {
    name: String,
    doc: Mutex<Doc>,
    broadcast: BroadcastGroup,
    awareness: Mutex<HashMap<Uuid, PeerAwareness>>,
}

impl RelayRoom {
    fn new(name: &str, broadcast_capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            doc: Mutex::new(Doc::new()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            awareness: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let doc = self.doc.lock();
        let txn = doc.transact();
        txn.state_vector().encode_v1()
    }

    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(remote_sv)?;
        let doc = self.doc.lock();
        let txn = doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    pub fn encode_state(&self) -> Vec<u8> {
        let doc = self.doc.lock();
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update)?;
        let doc = self.doc.lock();
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }

    /// Full state for a peer whose receiver lagged and lost updates.
    pub fn catch_up(&self) -> SyncMessage {
        SyncMessage::sync_step2(Uuid::nil(), &self.name, self.encode_state())
    }

    /// Record an awareness message. `false` if its clock is stale.
    fn record_awareness(&self, msg: &SyncMessage, removal: bool) -> bool {
        let mut awareness = self.awareness.lock();
        if let Some(known) = awareness.get(&msg.peer_id) {
            if msg.clock <= known.clock {
                return false;
            }
        }
        awareness.insert(
            msg.peer_id,
            PeerAwareness {
                clock: msg.clock,
                message: (!removal).then(|| msg.clone()),
            },
        );
        true
    }

    /// Current awareness of every peer except `exclude`.
    fn awareness_messages(&self, exclude: Uuid) -> Vec<SyncMessage> {
        self.awareness
            .lock()
            .iter()
            .filter(|(peer, _)| **peer != exclude)
            .filter_map(|(_, entry)| entry.message.clone())
            .collect()
    }

    /// Forget `peer`, returning the removal to announce if it still had
    /// a live state.
    fn take_awareness(&self, peer: Uuid) -> Option<u64> {
        let entry = self.awareness.lock().remove(&peer)?;
        entry.message.map(|_| entry.clock + 1)
    }
}

/// A successful join.
pub struct Joined {
    pub room: Arc<RelayRoom>,
    pub receiver: broadcast::Receiver<Envelope>,
    /// Messages to deliver to the joining peer before anything else.
    pub initial: Vec<SyncMessage>,
}

pub struct RelayHub {
    rooms: RwLock<HashMap<String, Arc<RelayRoom>>>,
    store: Option<Arc<DocumentStore>>,
    max_peers_per_room: usize,
    broadcast_capacity: usize,
    persisted_updates: AtomicU64,
    persisted_snapshots: AtomicU64,
}

impl RelayHub {
    pub fn new(config: &ServerConfig, store: Option<Arc<DocumentStore>>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            max_peers_per_room: config.max_peers_per_room,
            broadcast_capacity: config.broadcast_capacity,
            persisted_updates: AtomicU64::new(0),
            persisted_snapshots: AtomicU64::new(0),
        }
    }

    /// Hub without persistence.
    pub fn in_memory() -> Self {
        Self::new(&ServerConfig::default(), None)
    }

    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.store.as_ref()
    }

    /// Add `info` to `room_name`, opening the room if needed.
    pub async fn join(&self, room_name: &str, info: PeerInfo) -> Result<Joined, RelayError> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(room_name) {
            Some(room) => room.clone(),
            None => {
                let room = Arc::new(self.open_room(room_name));
                rooms.insert(room_name.to_string(), room.clone());
                room
            }
        };

        if room.broadcast.peer_count().await >= self.max_peers_per_room
            && !room.broadcast.has_peer(&info.peer_id).await
        {
            return Err(RelayError::RoomFull {
                room: room_name.to_string(),
                max: self.max_peers_per_room,
            });
        }

        let receiver = room.broadcast.add_peer(info.clone()).await;
        let initial = room.awareness_messages(info.peer_id);
        room.broadcast.broadcast(&SyncMessage::peer_joined(room_name, &info)?)?;

        log::info!("Peer {} ({}) joined room {room_name}", info.name, info.peer_id);
        Ok(Joined {
            room,
            receiver,
            initial,
        })
    }

    /// Process one message from `peer`'s connection. Returns the direct
    /// replies for that peer; fan-out happens here.
    pub fn handle(&self, room: &RelayRoom, msg: &SyncMessage) -> Vec<SyncMessage> {
        match msg.msg_type {
            MessageType::SyncStep1 => match room.encode_diff(&msg.payload) {
                Ok(diff) => vec![
                    SyncMessage::sync_step2(Uuid::nil(), &room.name, diff),
                    SyncMessage::sync_step1(Uuid::nil(), &room.name, room.state_vector()),
                ],
                Err(e) => {
                    log::warn!("Bad state vector from {} in room {}: {e}", msg.peer_id, room.name);
                    Vec::new()
                }
            },

            // A client answering our SyncStep1 sends its diff as SyncStep2.
            MessageType::Update | MessageType::SyncStep2 => {
                if let Err(e) = room.apply_update(&msg.payload) {
                    log::warn!("Dropping bad update from {} in room {}: {e}", msg.peer_id, room.name);
                    return Vec::new();
                }
                self.persist_update(&room.name, &msg.payload);
                let update = SyncMessage::update(msg.peer_id, &room.name, msg.payload.clone());
                if let Err(e) = room.broadcast.broadcast(&update) {
                    log::warn!("Failed to fan out update in room {}: {e}", room.name);
                }
                Vec::new()
            }

            MessageType::Awareness => {
                let removal = match msg.awareness_state() {
                    Ok(state) => state.is_none(),
                    Err(e) => {
                        log::warn!("Bad awareness payload from {}: {e}", msg.peer_id);
                        return Vec::new();
                    }
                };
                if room.record_awareness(msg, removal) {
                    log::trace!("Awareness from {} (clock {}) in room {}", msg.peer_id, msg.clock, room.name);
                    if let Err(e) = room.broadcast.broadcast(msg) {
                        log::warn!("Failed to fan out awareness in room {}: {e}", room.name);
                    }
                }
                Vec::new()
            }

            MessageType::Ping => vec![SyncMessage::pong(msg.peer_id)],

            MessageType::PeerJoined | MessageType::PeerLeft | MessageType::Pong => {
                log::debug!("Ignoring {:?} from {}", msg.msg_type, msg.peer_id);
                Vec::new()
            }
        }
    }

    /// Remove `peer` from `room`, announcing its departure. An emptied room
    /// is persisted and dropped.
    pub async fn leave(&self, room: &RelayRoom, peer: Uuid) {
        let mut rooms = self.rooms.write().await;
        if room.broadcast.remove_peer(&peer).await.is_none() {
            return;
        }

        if let Some(clock) = room.take_awareness(peer) {
            match SyncMessage::awareness(peer, &room.name, clock, None) {
                Ok(removal) => {
                    let _ = room.broadcast.broadcast(&removal);
                }
                Err(e) => log::warn!("Failed to encode awareness removal: {e}"),
            }
        }
        let _ = room.broadcast.broadcast(&SyncMessage::peer_left(peer, &room.name));
        log::info!("Peer {peer} left room {}", room.name);

        if room.broadcast.peer_count().await == 0 {
            self.persist_snapshot(room);
            rooms.remove(&room.name);
            log::info!("Room {} closed (empty)", room.name);
        }
    }

    pub async fn room(&self, name: &str) -> Option<Arc<RelayRoom>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            active_rooms: self.room_count().await,
            persisted_updates: self.persisted_updates.load(Ordering::Relaxed),
            persisted_snapshots: self.persisted_snapshots.load(Ordering::Relaxed),
        }
    }

    fn open_room(&self, name: &str) -> RelayRoom {
        let room = RelayRoom::new(name, self.broadcast_capacity);
        let Some(store) = &self.store else {
            log::info!("Opened room {name}");
            return room;
        };

        let mut stored = match store.load_snapshot(name) {
            Ok(snapshot) => snapshot.into_iter().collect::<Vec<_>>(),
            Err(e) => {
                log::warn!("Failed to load snapshot for room {name}: {e}");
                Vec::new()
            }
        };
        match store.load_updates(name) {
            Ok(updates) => stored.extend(updates.into_iter().map(|(_, u)| u)),
            Err(e) => log::warn!("Failed to load updates for room {name}: {e}"),
        }

        let mut applied = 0usize;
        for update in &stored {
            match room.apply_update(update) {
                Ok(()) => applied += 1,
                Err(e) => log::warn!("Skipping stored update for room {name}: {e}"),
            }
        }
        log::info!("Opened room {name} ({applied} stored updates)");
        room
    }

    fn persist_update(&self, room: &str, update: &[u8]) {
        let Some(store) = &self.store else {
            return;
        };
        match store.append_update(room, update) {
            Ok(_) => {
                self.persisted_updates.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::error!("Failed to persist update for room {room}: {e}"),
        }
    }

    fn persist_snapshot(&self, room: &RelayRoom) {
        let Some(store) = &self.store else {
            return;
        };
        match store.compact(&room.name, &room.encode_state()) {
            Ok(folded) => {
                self.persisted_snapshots.fetch_add(1, Ordering::Relaxed);
                log::info!("Persisted snapshot for room {} ({folded} updates folded)", room.name);
            }
            Err(e) => log::error!("Failed to persist snapshot for room {}: {e}", room.name),
        }
    }
}
