//! # scriblepad-core — Replicated pad model and reconciliation
//!
//! Everything one replica needs to co-edit a pad, minus the network.
//!
//! ## Architecture
//!
//! ```text
//!   keystrokes          history panel       lock screen        chat panel
//!       │                    │                   │                  │
//!       ▼                    ▼                   ▼                  ▼
//! ┌──────────────┐   ┌────────────────┐   ┌─────────────┐   ┌─────────────┐
//! │EditorReconcil│   │ VersionManager │   │ AccessGate  │   │ ChatChannel │
//! │ (title/body) │   │ (cap 50)       │   │ (tri-state) │   │ (unread)    │
//! └──────┬───────┘   └───────┬────────┘   └──────┬──────┘   └──────┬──────┘
//!        │                   │                   │                 │
//!        └───────────────────┴─────────┬─────────┴─────────────────┘
//!                                      ▼
//!                            ┌──────────────────┐
//!                            │  SharedDocument  │ ──► DocumentEvent (EventBus)
//!                            │  (yrs Doc)       │
//!                            └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`] — the replicated containers and their change events
//! - [`events`] — typed publish/subscribe with drop-to-unsubscribe tokens
//! - [`diff`] — prefix/suffix text diffing
//! - [`editor`] — local buffer ⇄ text container reconciliation
//! - [`versions`] — snapshot policy, retention and restore
//! - [`access`] — password gate over the `passwordHash` metadata entry
//! - [`chat`] — append-only chat log with unread bookkeeping
//! - [`identity`] — session-scoped display name and color
//! - [`room`] — room identifiers
//! - [`export`] — text and Markdown downloads
//! - [`clock`] — wall-clock abstraction and time labels

pub mod access;
pub mod chat;
pub mod clock;
pub mod diff;
pub mod document;
pub mod editor;
pub mod error;
pub mod events;
pub mod export;
pub mod identity;
pub mod room;
pub mod versions;

// Re-exports for convenience
pub use access::{AccessError, AccessGate, AccessState, PasswordHasher, Sha256Hasher};
pub use chat::{ChatChannel, ChatMessage};
pub use clock::{Clock, ManualClock, SystemClock};
pub use diff::{DiffStrategy, TextEdit};
pub use document::{ChangeOrigin, DocumentEvent, ListKind, OriginId, SharedDocument, TextField};
pub use editor::{EditOutcome, EditorOptions, EditorReconciler, LocalBuffer};
pub use error::DocumentError;
pub use events::{EventBus, Subscription};
pub use export::{ExportFormat, ExportedFile};
pub use identity::{IdentityStore, UserIdentity};
pub use room::{RoomId, RoomIdError};
pub use versions::{Version, VersionManager, MAX_VERSIONS};
