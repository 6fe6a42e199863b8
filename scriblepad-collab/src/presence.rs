//! Who is here: a de-duplicated user list projected from awareness.
//!
//! The list is rebuilt from scratch on every awareness change. Replicas
//! that have not published a `user` yet are left out. Two users may share
//! a name or color; they never share a replica id.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use scriblepad_core::events::{EventBus, Subscription};

use crate::awareness::AwarenessTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUser {
    pub name: String,
    pub color: String,
    pub replica_id: Uuid,
}

impl PresenceUser {
    pub fn initials(&self) -> String {
        initials(&self.name)
    }
}

/// First two characters of a name, uppercased.
pub fn initials(name: &str) -> String {
    name.chars().take(2).flat_map(char::to_uppercase).collect()
}

/// Sorted by replica id so the order is stable between rebuilds.
fn project(table: &AwarenessTable) -> Vec<PresenceUser> {
    let by_id: BTreeMap<Uuid, PresenceUser> = table
        .states()
        .into_iter()
        .filter_map(|(replica_id, state)| {
            state.user.map(|user| {
                (
                    replica_id,
                    PresenceUser {
                        name: user.name,
                        color: user.color,
                        replica_id,
                    },
                )
            })
        })
        .collect();
    by_id.into_values().collect()
}

pub struct PresenceAggregator {
    users: Arc<Mutex<Vec<PresenceUser>>>,
    changes: EventBus<Vec<PresenceUser>>,
    _subscription: Subscription,
}

impl PresenceAggregator {
    pub fn new(table: Arc<AwarenessTable>) -> Self {
        let users = Arc::new(Mutex::new(project(&table)));
        let changes: EventBus<Vec<PresenceUser>> = EventBus::new();

        let sub_users = users.clone();
        let sub_changes = changes.clone();
        let weak_table = Arc::downgrade(&table);
        let subscription = table.on_change(move |_| {
            let Some(table) = weak_table.upgrade() else {
                return;
            };
            let next = project(&table);
            let changed = {
                let mut users = sub_users.lock();
                if *users == next {
                    false
                } else {
                    *users = next.clone();
                    true
                }
            };
            if changed {
                sub_changes.publish(&next);
            }
        });

        Self {
            users,
            changes,
            _subscription: subscription,
        }
    }

    pub fn users(&self) -> Vec<PresenceUser> {
        self.users.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.users.lock().len()
    }

    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Vec<PresenceUser>) + Send + Sync + 'static,
    {
        self.changes.subscribe(handler)
    }
}
