//! Typed publish/subscribe with explicit unsubscribe tokens.
//!
//! Every observable component in the crate exposes an [`EventBus`]. A
//! subscriber receives a [`Subscription`] that unregisters the handler when
//! dropped, so tearing a component down is a matter of dropping its tokens.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct BusInner<E> {
    handlers: Mutex<Vec<(u64, Handler<E>)>>,
    next_id: AtomicU64,
}

/// A multi-subscriber event channel.
///
/// Handlers run synchronously on the publishing thread, in subscription
/// order. The handler list is snapshotted before dispatch, so a handler may
/// subscribe, unsubscribe, or publish again without deadlocking.
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler. It stays registered until the returned token is
    /// dropped or [`Subscription::unsubscribe`] is called.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push((id, Arc::new(handler)));

        let weak: Weak<BusInner<E>> = Arc::downgrade(&self.inner);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handlers.lock().retain(|(hid, _)| *hid != id);
                }
            })),
        }
    }

    /// Deliver an event to every registered handler.
    pub fn publish(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self
            .inner
            .handlers
            .lock()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Unregister every handler. Outstanding tokens become no-ops.
    pub fn clear(&self) {
        self.inner.handlers.lock().clear();
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Token returned by [`EventBus::subscribe`].
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unregister the handler now.
    pub fn unsubscribe(mut self) {
        self.run_detach();
    }

    fn run_detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}
