//! In-process change notification.
//!
//! The sync engine signals "pins changed, re-read the store" without saying
//! what changed. Subscribers register a callback and get back a handle;
//! dropping the handle (or calling [`ChangeSubscription::unsubscribe`])
//! detaches the callback. A callback unsubscribed while a dispatch is in
//! flight is skipped for the remainder of that dispatch.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Handler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler)>>,
}

impl Registry {
    fn contains(&self, id: u64) -> bool {
        self.handlers.lock().iter().any(|(hid, _)| *hid == id)
    }

    fn remove(&self, id: u64) {
        self.handlers.lock().retain(|(hid, _)| *hid != id);
    }
}

/// Fan-out notifier for pin set changes.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    registry: Arc<Registry>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. It stays registered until the returned handle is
    /// dropped or explicitly unsubscribed.
    pub fn on_change<F>(&self, handler: F) -> ChangeSubscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.lock_push(id, Arc::new(handler));
        ChangeSubscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Invoke every currently registered callback.
    ///
    /// Handlers run outside the registry lock, so a handler may subscribe or
    /// unsubscribe (itself included) without deadlocking.
    pub fn notify(&self) {
        let snapshot: Vec<(u64, Handler)> = self.registry.handlers.lock().clone();
        for (id, handler) in snapshot {
            // Re-check membership so a handler removed mid-dispatch is
            // not invoked after its unsubscription.
            if self.registry.contains(id) {
                handler();
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.registry.handlers.lock().len()
    }
}

impl Registry {
    fn lock_push(&self, id: u64, handler: Handler) {
        self.handlers.lock().push((id, handler));
    }
}

/// Live subscription to a [`ChangeNotifier`]. Unsubscribes on drop.
pub struct ChangeSubscription {
    registry: Weak<Registry>,
    id: u64,
}

impl ChangeSubscription {
    /// Detach the callback now instead of waiting for drop.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
