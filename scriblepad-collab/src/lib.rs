//! # scriblepad-collab — Sessions, relay and persistence for Scriblepad
//!
//! Binds a [`scriblepad_core::SharedDocument`] to a room: local cache
//! first, then the relay over a [`Transport`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   Transport    ┌─────────────┐
//! │  Session    │ ◄────────────► │  RelayHub   │  (in-process, or behind
//! │ (per room)  │  Binary Proto  │  (central)  │   RelayServer over WS)
//! └──────┬──────┘                └──────┬──────┘
//!        │                              │
//!        ▼                              ▼
//! ┌─────────────┐                ┌─────────────┐
//! │ LocalCache  │                │ yrs Doc     │
//! │ (Rocks/mem) │                │ (authority) │
//! └─────────────┘                └──────┬──────┘
//!                                       │
//!                               ┌───────┴───────┐
//!                               │ BroadcastGroup│
//!                               │ (fan-out)     │
//!                               └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`] — Per-room fan-out with bounded buffers
//! - [`relay`] — Room hub: authoritative state, awareness cache, persistence
//! - [`server`] — WebSocket relay server
//! - [`transport`] — Transport trait, offline queue, loopback transport
//! - [`client`] — WebSocket transport with reconnect
//! - [`awareness`] — Ephemeral per-replica state with clocks and expiry
//! - [`presence`] — User list projected from awareness
//! - [`storage`] — Local cache trait, RocksDB and in-memory stores
//! - [`session`] — Session lifecycle and sync signals

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use awareness::{AwarenessChange, AwarenessTable, AwarenessUpdate};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use client::{ClientConfig, WsTransport};
pub use presence::{PresenceAggregator, PresenceUser};
pub use protocol::{
    AwarenessState, MessageType, PeerInfo, PresenceProfile, ProtocolError, SyncMessage,
};
pub use relay::{HubStats, RelayError, RelayHub, RelayRoom};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{
    Session, SessionConfig, SessionError, SessionServices, SessionStatus, SyncSignal,
};
pub use storage::{
    CacheError, DocumentStore, LocalCache, MemoryCache, RocksCache, RoomMetadata, StoreConfig,
    StoreError,
};
pub use transport::{
    ConnectionState, LoopbackTransport, OfflineQueue, Outbound, Transport, TransportError,
    TransportEvent,
};
