//! Password gate stored inside the replicated metadata.
//!
//! ```text
//!            set_password (any replica)
//!   Open ─────────────────────────────► Locked ──verify ok──► Unlocked
//!    ▲                                    │  ▲                   │
//!    │                                    └──┘ verify fails      │
//!    └──────────────── remove_password (after verify) ───────────┘
//! ```
//!
//! The hash lives under `metadata.passwordHash`; whether this replica has
//! unlocked is kept in memory only. Every replica verifies independently,
//! which hides a pad from casual viewers but is not access control: a client
//! that skips the gate can read the document.

use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::document::{DocumentEvent, OriginId, SharedDocument};
use crate::error::DocumentError;
use crate::events::{EventBus, Subscription};

/// Metadata key holding the password hash.
pub const PASSWORD_HASH_KEY: &str = "passwordHash";
pub const MIN_PASSWORD_LENGTH: usize = 4;

const SALT_LENGTH: usize = 16;
const HASH_SCHEME: &str = "sha256";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessState {
    /// No password set.
    Open,
    /// Password set and not verified on this replica.
    Locked,
    /// Password verified on this replica.
    Unlocked,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("Please enter a password")]
    EmptyPassword,
    #[error("Password must be at least {min} characters")]
    TooShort { min: usize },
    #[error("Passwords do not match")]
    Mismatch,
    #[error("Incorrect password")]
    IncorrectPassword,
    #[error("Unlock the pad before changing its password")]
    Locked,
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// One-way password hashing with a matching verifier.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, plain: &str) -> String;
    fn verify(&self, plain: &str, stored: &str) -> bool;
}

/// Salted SHA-256, stored as `sha256$<salt hex>$<digest hex>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl Sha256Hasher {
    fn digest(salt: &[u8], plain: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(plain.as_bytes());
        hasher.finalize().to_vec()
    }
}

impl PasswordHasher for Sha256Hasher {
    fn hash(&self, plain: &str) -> String {
        let mut salt = [0u8; SALT_LENGTH];
        rand::rng().fill(&mut salt);
        let digest = Self::digest(&salt, plain);
        format!("{HASH_SCHEME}${}${}", hex::encode(salt), hex::encode(digest))
    }

    fn verify(&self, plain: &str, stored: &str) -> bool {
        let mut parts = stored.splitn(3, '$');
        let (Some(scheme), Some(salt), Some(expected)) = (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        if scheme != HASH_SCHEME {
            return false;
        }
        let (Ok(salt), Ok(expected)) = (hex::decode(salt), hex::decode(expected)) else {
            return false;
        };
        Self::digest(&salt, plain).ct_eq(&expected).into()
    }
}

/// Check a new password and its confirmation before anything is written.
pub fn validate_new_password(plain: &str, confirm: &str) -> Result<(), AccessError> {
    if plain.trim().is_empty() {
        return Err(AccessError::EmptyPassword);
    }
    if plain.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AccessError::TooShort {
            min: MIN_PASSWORD_LENGTH,
        });
    }
    if plain != confirm {
        return Err(AccessError::Mismatch);
    }
    Ok(())
}

fn derive_state(stored: Option<&str>, unlocked_hash: Option<&str>) -> AccessState {
    match stored {
        None | Some("") => AccessState::Open,
        Some(hash) if unlocked_hash == Some(hash) => AccessState::Unlocked,
        Some(_) => AccessState::Locked,
    }
}

struct GateLocal {
    /// The stored hash this replica verified against. A different hash
    /// showing up (password changed elsewhere) locks the gate again.
    unlocked_hash: Option<String>,
    last_error: Option<AccessError>,
    state: AccessState,
}

impl GateLocal {
    /// Recompute the state; returns it if it changed.
    fn refresh(&mut self, stored: Option<&str>) -> Option<AccessState> {
        if stored.map_or(true, str::is_empty) {
            self.unlocked_hash = None;
        }
        let next = derive_state(stored, self.unlocked_hash.as_deref());
        (next != self.state).then(|| {
            self.state = next;
            next
        })
    }
}

pub struct AccessGate {
    document: Arc<SharedDocument>,
    hasher: Arc<dyn PasswordHasher>,
    origin: OriginId,
    local: Arc<Mutex<GateLocal>>,
    changes: EventBus<AccessState>,
    _subscription: Subscription,
}

impl AccessGate {
    pub fn new(document: Arc<SharedDocument>, hasher: Arc<dyn PasswordHasher>) -> Self {
        let origin = document.new_origin();
        let stored = document.metadata(PASSWORD_HASH_KEY);
        let local = Arc::new(Mutex::new(GateLocal {
            unlocked_hash: None,
            last_error: None,
            state: derive_state(stored.as_deref(), None),
        }));
        let changes: EventBus<AccessState> = EventBus::new();

        let sub_local = local.clone();
        let sub_changes = changes.clone();
        let subscription = document.subscribe(move |event| {
            let DocumentEvent::MetadataChanged { key, value, .. } = event else {
                return;
            };
            if key != PASSWORD_HASH_KEY {
                return;
            }
            let changed = sub_local.lock().refresh(value.as_deref());
            if let Some(state) = changed {
                log::info!("Access state changed to {state:?}");
                sub_changes.publish(&state);
            }
        });

        Self {
            document,
            hasher,
            origin,
            local,
            changes,
            _subscription: subscription,
        }
    }

    pub fn state(&self) -> AccessState {
        self.local.lock().state
    }

    pub fn is_protected(&self) -> bool {
        self.state() != AccessState::Open
    }

    /// Protect the pad. The writer is unlocked; every other replica becomes
    /// locked until it verifies.
    pub fn set_password(&self, plain: &str, confirm: &str) -> Result<(), AccessError> {
        let result = self.try_set_password(plain, confirm);
        self.record(&result);
        result
    }

    fn try_set_password(&self, plain: &str, confirm: &str) -> Result<(), AccessError> {
        validate_new_password(plain, confirm)?;
        if self.state() == AccessState::Locked {
            return Err(AccessError::Locked);
        }

        let hash = self.hasher.hash(plain);
        // Mark the new hash as ours before it lands, so the change event
        // derives Unlocked rather than Locked.
        self.local.lock().unlocked_hash = Some(hash.clone());
        self.document.set_metadata(PASSWORD_HASH_KEY, &hash, self.origin)?;
        log::info!("Password set");
        Ok(())
    }

    /// Check `plain` against the stored hash. On failure the gate stays as
    /// it was and [`last_error`](Self::last_error) is set.
    pub fn verify(&self, plain: &str) -> bool {
        if plain.is_empty() {
            self.local.lock().last_error = Some(AccessError::EmptyPassword);
            return false;
        }

        let stored = self.document.metadata(PASSWORD_HASH_KEY).unwrap_or_default();
        // An absent hash reports the same error as a wrong password.
        if stored.is_empty() || !self.hasher.verify(plain, &stored) {
            self.local.lock().last_error = Some(AccessError::IncorrectPassword);
            return false;
        }

        let changed = {
            let mut local = self.local.lock();
            local.unlocked_hash = Some(stored.clone());
            local.last_error = None;
            local.refresh(Some(&stored))
        };
        if let Some(state) = changed {
            log::info!("Pad unlocked");
            self.changes.publish(&state);
        }
        true
    }

    /// Remove protection. Requires the current password.
    pub fn remove_password(&self, plain: &str) -> Result<(), AccessError> {
        if !self.verify(plain) {
            return Err(self
                .last_error()
                .unwrap_or(AccessError::IncorrectPassword));
        }
        let result = self
            .document
            .remove_metadata(PASSWORD_HASH_KEY, self.origin)
            .map(|_| ())
            .map_err(AccessError::from);
        self.record(&result);
        if result.is_ok() {
            log::info!("Password removed");
        }
        result
    }

    /// User-visible message from the last failed operation.
    pub fn last_error(&self) -> Option<AccessError> {
        self.local.lock().last_error.clone()
    }

    pub fn clear_error(&self) {
        self.local.lock().last_error = None;
    }

    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&AccessState) + Send + Sync + 'static,
    {
        self.changes.subscribe(handler)
    }

    fn record(&self, result: &Result<(), AccessError>) {
        self.local.lock().last_error = result.as_ref().err().cloned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ChangeOrigin;

    fn gate(doc: &Arc<SharedDocument>) -> AccessGate {
        AccessGate::new(doc.clone(), Arc::new(Sha256Hasher))
    }

    /// Second replica of `doc`, kept in sync by copying full state.
    fn replica_of(doc: &SharedDocument) -> Arc<SharedDocument> {
        let other = Arc::new(SharedDocument::new());
        other.apply_update(&doc.encode_state(), ChangeOrigin::Remote).unwrap();
        other
    }

    fn sync(from: &SharedDocument, to: &SharedDocument) {
        let diff = from.encode_diff(&to.state_vector()).unwrap();
        to.apply_update(&diff, ChangeOrigin::Remote).unwrap();
    }

    #[test]
    fn test_hasher_round_trip() {
        let hasher = Sha256Hasher;
        let stored = hasher.hash("abcd");
        assert!(stored.starts_with("sha256$"));
        assert!(hasher.verify("abcd", &stored));
        assert!(!hasher.verify("abce", &stored));
    }

    #[test]
    fn test_hasher_salts_each_hash() {
        let hasher = Sha256Hasher;
        assert_ne!(hasher.hash("same"), hasher.hash("same"));
    }

    #[test]
    fn test_hasher_rejects_malformed() {
        let hasher = Sha256Hasher;
        assert!(!hasher.verify("x", ""));
        assert!(!hasher.verify("x", "md5$00$00"));
        assert!(!hasher.verify("x", "sha256$zz$zz"));
        assert!(!hasher.verify("x", "sha256$00"));
    }

    #[test]
    fn test_validation_messages() {
        assert_eq!(validate_new_password("  ", "  "), Err(AccessError::EmptyPassword));
        assert_eq!(
            validate_new_password("abc", "abc"),
            Err(AccessError::TooShort { min: 4 })
        );
        assert_eq!(validate_new_password("abcd", "abce"), Err(AccessError::Mismatch));
        assert!(validate_new_password("abcd", "abcd").is_ok());
        assert_eq!(
            AccessError::TooShort { min: 4 }.to_string(),
            "Password must be at least 4 characters"
        );
        assert_eq!(AccessError::IncorrectPassword.to_string(), "Incorrect password");
    }

    #[test]
    fn test_new_pad_is_open() {
        let doc = Arc::new(SharedDocument::new());
        assert_eq!(gate(&doc).state(), AccessState::Open);
    }

    #[test]
    fn test_writer_is_unlocked_after_setting() {
        let doc = Arc::new(SharedDocument::new());
        let g = gate(&doc);
        g.set_password("abcd", "abcd").unwrap();
        assert_eq!(g.state(), AccessState::Unlocked);
        assert!(doc.metadata(PASSWORD_HASH_KEY).is_some());
    }

    #[test]
    fn test_invalid_password_writes_nothing() {
        let doc = Arc::new(SharedDocument::new());
        let g = gate(&doc);
        assert_eq!(g.set_password("abc", "abc"), Err(AccessError::TooShort { min: 4 }));
        assert_eq!(g.last_error(), Some(AccessError::TooShort { min: 4 }));
        assert!(doc.metadata(PASSWORD_HASH_KEY).is_none());
        assert_eq!(g.state(), AccessState::Open);
    }

    #[test]
    fn test_other_replica_locks_then_verifies() {
        let doc = Arc::new(SharedDocument::new());
        let writer = gate(&doc);
        let other_doc = replica_of(&doc);
        let reader = gate(&other_doc);

        writer.set_password("abcd", "abcd").unwrap();
        sync(&doc, &other_doc);
        assert_eq!(reader.state(), AccessState::Locked);

        assert!(!reader.verify("xyz1"));
        assert_eq!(reader.state(), AccessState::Locked);
        assert_eq!(reader.last_error(), Some(AccessError::IncorrectPassword));

        assert!(reader.verify("abcd"));
        assert_eq!(reader.state(), AccessState::Unlocked);
        assert_eq!(reader.last_error(), None);
    }

    #[test]
    fn test_set_verify_remove_cycle() {
        let doc = Arc::new(SharedDocument::new());
        let g = gate(&doc);
        g.set_password("abcd", "abcd").unwrap();

        assert!(g.verify("abcd"));
        assert!(!g.verify("wxyz"));

        assert_eq!(g.remove_password("nope"), Err(AccessError::IncorrectPassword));
        assert!(doc.metadata(PASSWORD_HASH_KEY).is_some());

        g.remove_password("abcd").unwrap();
        assert!(doc.metadata(PASSWORD_HASH_KEY).is_none());
        assert_eq!(g.state(), AccessState::Open);

        // A replica joining afterwards sees an open pad.
        let fresh = replica_of(&doc);
        assert_eq!(gate(&fresh).state(), AccessState::Open);
    }

    #[test]
    fn test_verify_on_open_pad_fails_generically() {
        let doc = Arc::new(SharedDocument::new());
        let g = gate(&doc);
        assert!(!g.verify("anything"));
        assert_eq!(g.last_error(), Some(AccessError::IncorrectPassword));
        assert_eq!(g.state(), AccessState::Open);
    }

    #[test]
    fn test_locked_replica_cannot_replace_password() {
        let doc = Arc::new(SharedDocument::new());
        let writer = gate(&doc);
        let other_doc = replica_of(&doc);
        let reader = gate(&other_doc);

        writer.set_password("abcd", "abcd").unwrap();
        sync(&doc, &other_doc);
        assert_eq!(reader.set_password("hijack", "hijack"), Err(AccessError::Locked));
    }

    #[test]
    fn test_password_changed_elsewhere_relocks() {
        let doc = Arc::new(SharedDocument::new());
        let a = gate(&doc);
        let other_doc = replica_of(&doc);
        let b = gate(&other_doc);

        a.set_password("first", "first").unwrap();
        sync(&doc, &other_doc);
        assert!(b.verify("first"));

        a.set_password("second", "second").unwrap();
        sync(&doc, &other_doc);
        assert_eq!(b.state(), AccessState::Locked);
        assert_eq!(a.state(), AccessState::Unlocked);
    }

    #[test]
    fn test_removal_elsewhere_opens_everyone() {
        let doc = Arc::new(SharedDocument::new());
        let a = gate(&doc);
        let other_doc = replica_of(&doc);
        let b = gate(&other_doc);

        a.set_password("abcd", "abcd").unwrap();
        sync(&doc, &other_doc);
        a.remove_password("abcd").unwrap();
        sync(&doc, &other_doc);
        assert_eq!(b.state(), AccessState::Open);
    }

    #[test]
    fn test_state_change_notifications() {
        let doc = Arc::new(SharedDocument::new());
        let g = gate(&doc);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = g.on_change(move |s| sink.lock().push(*s));

        g.set_password("abcd", "abcd").unwrap();
        g.remove_password("abcd").unwrap();
        assert_eq!(*seen.lock(), vec![AccessState::Unlocked, AccessState::Open]);
    }
}
