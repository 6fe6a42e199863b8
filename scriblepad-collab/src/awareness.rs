//! Ephemeral per-replica state ("awareness").
//!
//! ```text
//! set_local_state() ──► clock+1 ──► AwarenessUpdate ──► transport
//!                                                          │
//! apply_remote(peer, clock, state) ◄── relay fan-out ◄─────┘
//!        │   (ignored unless clock is newer; None removes)
//!        ▼
//!   AwarenessChange { added, updated, removed } ──► PresenceAggregator
//! ```
//!
//! Nothing here is persisted. Remote entries disappear when their replica
//! says so, when the relay reports it gone, when they are not renewed
//! within the timeout, or when our own connection drops.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use scriblepad_core::events::{EventBus, Subscription};

use crate::protocol::AwarenessState;

/// What changed in one call, by replica id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<Uuid>,
    pub updated: Vec<Uuid>,
    pub removed: Vec<Uuid>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Local state stamped with its clock, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub clock: u64,
    pub state: Option<AwarenessState>,
}

#[derive(Debug, Clone)]
struct Entry {
    state: AwarenessState,
    clock: u64,
    last_seen: Instant,
}

#[derive(Default)]
struct TableInner {
    local_clock: u64,
    local: Option<AwarenessState>,
    remote: HashMap<Uuid, Entry>,
    /// Last clock of each removed replica, so a delayed older state
    /// cannot resurrect it. Pruned by [`AwarenessTable::expire`].
    tombstones: HashMap<Uuid, Tombstone>,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    clock: u64,
    removed_at: Instant,
}

pub struct AwarenessTable {
    local_id: Uuid,
    inner: Mutex<TableInner>,
    changes: EventBus<AwarenessChange>,
}

impl AwarenessTable {
    pub fn new(local_id: Uuid) -> Self {
        Self {
            local_id,
            inner: Mutex::new(TableInner::default()),
            changes: EventBus::new(),
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn local_state(&self) -> Option<AwarenessState> {
        self.inner.lock().local.clone()
    }

    /// Replace the local state. `None` withdraws it (used on teardown).
    pub fn set_local_state(&self, state: Option<AwarenessState>) -> AwarenessUpdate {
        let (update, change) = {
            let mut inner = self.inner.lock();
            inner.local_clock += 1;
            let mut change = AwarenessChange::default();
            match (&inner.local, &state) {
                (None, Some(_)) => change.added.push(self.local_id),
                (Some(_), None) => change.removed.push(self.local_id),
                (Some(old), Some(new)) if old != new => change.updated.push(self.local_id),
                _ => {}
            }
            inner.local = state.clone();
            (
                AwarenessUpdate {
                    clock: inner.local_clock,
                    state,
                },
                change,
            )
        };
        self.publish(change);
        update
    }

    /// Bump the clock on the unchanged local state so peers keep it alive.
    /// `None` when there is nothing to renew.
    pub fn renew_local(&self) -> Option<AwarenessUpdate> {
        let mut inner = self.inner.lock();
        let state = inner.local.clone()?;
        inner.local_clock += 1;
        Some(AwarenessUpdate {
            clock: inner.local_clock,
            state: Some(state),
        })
    }

    /// Merge a state received from `peer`. Returns whether anything changed.
    pub fn apply_remote(
        &self,
        peer: Uuid,
        clock: u64,
        state: Option<AwarenessState>,
        now: Instant,
    ) -> bool {
        if peer == self.local_id {
            return false;
        }
        let change = {
            let mut inner = self.inner.lock();
            let known = inner
                .remote
                .get(&peer)
                .map(|e| e.clock)
                .or_else(|| inner.tombstones.get(&peer).map(|t| t.clock));
            if known.is_some_and(|known| clock <= known) {
                log::trace!("Ignoring stale awareness from {peer} (clock {clock})");
                return false;
            }

            let mut change = AwarenessChange::default();
            match state {
                Some(state) => {
                    inner.tombstones.remove(&peer);
                    let previous = inner.remote.insert(
                        peer,
                        Entry {
                            state: state.clone(),
                            clock,
                            last_seen: now,
                        },
                    );
                    match previous {
                        None => change.added.push(peer),
                        Some(old) if old.state != state => change.updated.push(peer),
                        Some(_) => {}
                    }
                }
                None => {
                    inner.tombstones.insert(
                        peer,
                        Tombstone {
                            clock,
                            removed_at: now,
                        },
                    );
                    if inner.remote.remove(&peer).is_some() {
                        change.removed.push(peer);
                    }
                }
            }
            change
        };
        let changed = !change.is_empty();
        self.publish(change);
        changed
    }

    /// Forget a peer the relay reported gone.
    pub fn remove_remote(&self, peer: Uuid) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.remote.remove(&peer) {
                Some(entry) => {
                    inner.tombstones.insert(
                        peer,
                        Tombstone {
                            clock: entry.clock,
                            removed_at: Instant::now(),
                        },
                    );
                    true
                }
                None => false,
            }
        };
        if removed {
            self.publish(AwarenessChange {
                removed: vec![peer],
                ..AwarenessChange::default()
            });
        }
        removed
    }

    /// Drop every remote entry; called when our connection goes away.
    pub fn clear_remote(&self) -> Vec<Uuid> {
        let removed: Vec<Uuid> = {
            let mut inner = self.inner.lock();
            inner.tombstones.clear();
            inner.remote.drain().map(|(id, _)| id).collect()
        };
        if !removed.is_empty() {
            self.publish(AwarenessChange {
                removed: removed.clone(),
                ..AwarenessChange::default()
            });
        }
        removed
    }

    /// Remove remote entries not renewed within `timeout`, and forget
    /// removals older than that.
    pub fn expire(&self, now: Instant, timeout: Duration) -> Vec<Uuid> {
        let expired: Vec<Uuid> = {
            let mut inner = self.inner.lock();
            inner
                .tombstones
                .retain(|_, t| now.saturating_duration_since(t.removed_at) <= timeout);
            let stale: Vec<Uuid> = inner
                .remote
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                inner.remote.remove(id);
            }
            stale
        };
        if !expired.is_empty() {
            log::debug!("Expired {} idle awareness entries", expired.len());
            self.publish(AwarenessChange {
                removed: expired.clone(),
                ..AwarenessChange::default()
            });
        }
        expired
    }

    /// All known states, the local one included.
    pub fn states(&self) -> HashMap<Uuid, AwarenessState> {
        let inner = self.inner.lock();
        let mut states: HashMap<Uuid, AwarenessState> = inner
            .remote
            .iter()
            .map(|(id, e)| (*id, e.state.clone()))
            .collect();
        if let Some(local) = &inner.local {
            states.insert(self.local_id, local.clone());
        }
        states
    }

    pub fn remote_count(&self) -> usize {
        self.inner.lock().remote.len()
    }

    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&AwarenessChange) + Send + Sync + 'static,
    {
        self.changes.subscribe(handler)
    }

    /// Unregister every change handler.
    pub fn clear_listeners(&self) {
        self.changes.clear();
    }

    fn publish(&self, change: AwarenessChange) {
        if !change.is_empty() {
            self.changes.publish(&change);
        }
    }
}
