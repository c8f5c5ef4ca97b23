//! Flags-updated notifications.
use std::sync::{Arc, Mutex, Weak};

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
}

/// An ordered list of callbacks invoked whenever the visible flags change.
#[derive(Default)]
pub struct Subscribers {
    registry: Arc<Mutex<Registry>>,
}

impl Subscribers {
    pub fn new() -> Subscribers {
        Subscribers::default()
    }

    /// Register `callback`. It is not invoked until the next [`notify`](Subscribers::notify).
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        let mut registry = self
            .registry
            .lock()
            .expect("thread holding subscribers lock should not panic");
        let id = registry.next_id;
        registry.next_id += 1;
        registry.callbacks.push((id, Arc::new(callback)));

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Invoke every callback in subscription order.
    ///
    /// Callbacks run on the calling thread after the lock is released, so they may subscribe or
    /// unsubscribe.
    pub fn notify(&self) {
        let callbacks: Vec<Callback> = self
            .registry
            .lock()
            .expect("thread holding subscribers lock should not panic")
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            callback();
        }
    }

    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .expect("thread holding subscribers lock should not panic")
            .callbacks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`Subscribers::subscribe`].
///
/// Dropping the handle keeps the callback registered; call
/// [`unsubscribe`](Subscription::unsubscribe) to remove it.
#[derive(Debug)]
#[must_use = "dropping a Subscription does not unsubscribe; keep it to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Remove the callback. Does nothing if the subscriber list is gone.
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        registry
            .lock()
            .expect("thread holding subscribers lock should not panic")
            .callbacks
            .retain(|(id, _)| *id != self.id);
    }
}
