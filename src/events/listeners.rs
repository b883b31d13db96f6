//! Snapshot-on-notify callback registry.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

/// Opaque identity of a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    entries: Vec<(ListenerId, Callback<T>)>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

/// An ordered set of callbacks for one kind of value.
///
/// `notify` copies the current callbacks before invoking them, so callbacks
/// may add or remove registrations (their own included) while being
/// notified. Such changes take effect from the next `notify`.
pub struct Listeners<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }
}

impl<T: 'static> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}

impl<T: 'static> Listeners<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback.
    pub fn add<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.registry.lock();
            let id = ListenerId(registry.next_id);
            registry.next_id += 1;
            registry.entries.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            id,
            remove: Arc::new(move |id| {
                if let Some(registry) = weak.upgrade() {
                    registry.lock().entries.retain(|(entry, _)| *entry != id);
                }
            }),
        }
    }

    /// Invoke every currently registered callback once with `value`.
    ///
    /// Returns how many callbacks were invoked.
    pub fn notify(&self, value: &T) -> usize {
        let snapshot: Vec<Callback<T>> = self
            .registry
            .lock()
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in &snapshot {
            callback(value);
        }
        snapshot.len()
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    /// Whether no callbacks are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by a subscribe call.
///
/// Dropping the handle leaves the callback registered; call
/// [`Subscription::unsubscribe`] to remove it. Unsubscribing is idempotent.
#[derive(Clone)]
pub struct Subscription {
    id: ListenerId,
    remove: Arc<dyn Fn(ListenerId) + Send + Sync>,
}

impl Subscription {
    /// Identity of the registered callback.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the callback. Safe to call more than once.
    pub fn unsubscribe(&self) {
        (self.remove)(self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
