//! Binary protocol between replicas and the relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room     │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ ≤64 chars│ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake, client first:
//! ```text
//! client                               relay
//!   │── PeerJoined(PeerInfo) ───────────►│
//!   │── SyncStep1(client sv) ───────────►│
//!   │◄──────────── SyncStep2(diff) ──────│   first SyncStep2 = "synced"
//!   │◄──────────── SyncStep1(relay sv) ──│
//!   │── Update(diff for relay) ─────────►│
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector; the receiver answers with what the sender lacks
    SyncStep1 = 1,
    /// Yrs state diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental document update
    Update = 3,
    /// Ephemeral per-replica state (presence)
    Awareness = 4,
    /// Peer joined notification
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Peer identity announced when joining a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// `#rrggbb`
    pub color: String,
}

impl PeerInfo {
    pub fn new(peer_id: Uuid, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: color.into(),
        }
    }

    /// Anonymous placeholder for a peer that sent no usable info.
    pub fn anonymous(peer_id: Uuid) -> Self {
        Self::new(peer_id, "Anonymous", "#888888")
    }
}

/// The `user` field a replica publishes in its ephemeral state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceProfile {
    pub name: String,
    pub color: String,
}

/// Ephemeral state of one replica.
///
/// A replica that has connected but not yet published a profile has
/// `user == None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwarenessState {
    pub user: Option<PresenceProfile>,
}

impl AwarenessState {
    pub fn with_user(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            user: Some(PresenceProfile {
                name: name.into(),
                color: color.into(),
            }),
        }
    }
}

/// Top-level protocol message.
///
/// `clock` is the awareness clock for `Awareness` messages and zero
/// otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    /// Create a document update message.
    pub fn update(peer_id: Uuid, room: &str, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, room, 0, yrs_update)
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, room: &str, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, 0, state_diff)
    }

    /// Create an awareness message. `None` removes the peer's state.
    pub fn awareness(
        peer_id: Uuid,
        room: &str,
        clock: u64,
        state: Option<&AwarenessState>,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(MessageType::Awareness, peer_id, room, clock, payload))
    }

    /// Create a peer joined notification.
    pub fn peer_joined(room: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, room, 0, payload))
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, room: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room, 0, Vec::new())
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse awareness payload.
    pub fn awareness_state(&self) -> Result<Option<AwarenessState>, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (state, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(state)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
