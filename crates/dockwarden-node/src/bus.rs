//! Callback fan-out.
//!
//! Listeners are plain closures. A panicking listener is logged and the
//! remaining listeners still receive the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::error;

/// A registered listener.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Fan-out of events to registered callbacks.
pub struct EventBus<T> {
    listeners: RwLock<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: 'static> EventBus<T> {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener.
    pub fn subscribe(self: &Arc<Self>, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Arc::new(callback)));

        let bus: Weak<Self> = Arc::downgrade(self);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(bus) = bus.upgrade() {
                    bus.listeners.write().retain(|(listener, _)| *listener != id);
                }
            })),
        }
    }

    /// Deliver an event to every listener and return how many completed.
    pub fn publish(&self, event: &T) -> usize {
        let listeners: Vec<Callback<T>> = self.listeners.read().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        let mut delivered = 0;
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_ok() {
                delivered += 1;
            } else {
                error!("Event listener panicked");
            }
        }
        delivered
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Returns true if nobody is listening.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the listener.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivers_to_all_and_unsubscribes() {
        let bus = EventBus::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let s1 = {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |n| {
                seen.fetch_add(*n as usize, Ordering::SeqCst);
            })
        };
        let _s2 = {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |n| {
                seen.fetch_add(*n as usize * 10, Ordering::SeqCst);
            })
        };

        assert_eq!(bus.publish(&1), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 11);

        s1.unsubscribe();
        assert_eq!(bus.len(), 1);
        bus.publish(&1);
        assert_eq!(seen.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let bus = EventBus::<&'static str>::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        let _bad = bus.subscribe(|_| panic!("listener bug"));
        let _good = {
            let delivered = Arc::clone(&delivered);
            bus.subscribe(move |_| {
                delivered.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert_eq!(bus.publish(&"event"), 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_after_bus_dropped_is_harmless() {
        let bus = EventBus::<u8>::new();
        let sub = bus.subscribe(|_| {});
        drop(bus);
        sub.unsubscribe();
    }
}
