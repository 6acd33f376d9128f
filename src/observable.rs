//! Change-notifying values.
//!
//! [`Observable`] holds a single value and notifies its listeners only when a
//! `set` actually changes it (value equality). Every derived field of a
//! [`RoomSession`](crate::RoomSession) and the platform states are exposed
//! this way so dependent code reacts to transitions instead of diffing
//! snapshots.
//!
//! Listeners run synchronously on the thread that calls `set`, in
//! subscription order. A listener may read any observable, but must not call
//! `set` on the observable that is notifying it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Locks a std mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by `subscribe`/`listen`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// A shared listener callback.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered listener list shared by [`Observable`] and [`EventHub`](crate::event::EventHub).
pub(crate) struct Listeners<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Callback<T>)>>,
}

impl<T> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Adds `callback` unless the very same `Arc` is already registered, in
    /// which case the existing id is returned.
    pub(crate) fn add(&self, callback: Callback<T>) -> ListenerId {
        let mut entries = lock(&self.entries);
        if let Some((id, _)) = entries.iter().find(|(_, cb)| Arc::ptr_eq(cb, &callback)) {
            return *id;
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        entries.push((id, callback));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Invokes every listener in subscription order. The list is copied first
    /// so listeners may subscribe or unsubscribe while being notified.
    pub(crate) fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = lock(&self.entries)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in snapshot {
            callback(value);
        }
    }
}

/// A value that notifies listeners on every distinct transition.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use lobby_sync::Observable;
///
/// let slots = Observable::new(4_u32);
/// let fired = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&fired);
/// slots.subscribe(move |_| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
///
/// assert!(!slots.set(4)); // unchanged, no notification
/// assert!(slots.set(3));
/// assert_eq!(fired.load(Ordering::SeqCst), 1);
/// ```
pub struct Observable<T> {
    value: Mutex<T>,
    /// Serializes set-and-notify so transitions reach listeners in the order they happened.
    notify: Mutex<()>,
    listeners: Listeners<T>,
}

impl<T: Clone + PartialEq> Observable<T> {
    /// Creates an observable holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            notify: Mutex::new(()),
            listeners: Listeners::new(),
        }
    }

    /// Returns a copy of the current value.
    pub fn get(&self) -> T {
        lock(&self.value).clone()
    }

    /// Runs `f` against the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&lock(&self.value))
    }

    /// Stores `value` and notifies listeners if it differs from the current one.
    ///
    /// Returns `true` when the value changed.
    pub fn set(&self, value: T) -> bool {
        let _ordering = lock(&self.notify);
        {
            let mut current = lock(&self.value);
            if *current == value {
                return false;
            }
            *current = value.clone();
        }
        self.listeners.notify(&value);
        true
    }

    /// Registers a listener called with the new value after every change.
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.listeners.add(Arc::new(callback))
    }

    /// Registers a shared listener. Subscribing the same `Arc` twice is a
    /// no-op that returns the original id.
    pub fn subscribe_shared(&self, callback: Callback<T>) -> ListenerId {
        self.listeners.add(callback)
    }

    /// Removes a listener. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<T: Clone + PartialEq + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("value", &*lock(&self.value))
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &T| sink.lock().unwrap().push(v.clone()))
    }

    #[test]
    fn notifies_only_on_distinct_transitions() {
        let value = Observable::new(0_i32);
        let (seen, callback) = recorder::<i32>();
        value.subscribe(callback);

        let sets = [0, 1, 1, 1, 2, 2, 1, 1, 0, 0];
        let transitions = sets
            .iter()
            .fold((0, 0), |(prev, count), &v| (v, count + usize::from(v != prev)))
            .1;
        for v in sets {
            value.set(v);
        }

        assert_eq!(seen.lock().unwrap().len(), transitions);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 1, 0]);
        assert_eq!(value.get(), 0);
    }

    #[test]
    fn listeners_fire_in_subscription_order() {
        let value = Observable::new(String::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            value.subscribe(move |_| order.lock().unwrap().push(tag));
        }

        value.set("changed".to_string());

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn subscribe_shared_is_idempotent() {
        let value = Observable::new(false);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let callback: Callback<bool> = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let a = value.subscribe_shared(Arc::clone(&callback));
        let b = value.subscribe_shared(callback);
        assert_eq!(a, b);
        assert_eq!(value.listener_count(), 1);

        value.set(true);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let value = Observable::new(1_u8);
        let (seen, callback) = recorder::<u8>();
        let id = value.subscribe(callback);

        assert!(value.unsubscribe(id));
        assert!(!value.unsubscribe(id));
        value.set(2);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn listener_can_read_value_during_notification() {
        let value = Arc::new(Observable::new(10_u32));
        let reader = Arc::clone(&value);
        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        value.subscribe(move |_| {
            *sink.lock().unwrap() = Some(reader.get());
        });

        value.set(11);
        assert_eq!(*observed.lock().unwrap(), Some(11));
    }

    #[test]
    fn late_subscriber_only_sees_latest_value() {
        let value = Observable::new(0_u32);
        value.set(1);
        value.set(2);

        let (seen, callback) = recorder::<u32>();
        value.subscribe(callback);
        assert_eq!(value.get(), 2);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn concurrent_setters_deliver_every_transition() {
        let value = Arc::new(Observable::new(0_u64));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        value.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (1..=4_u64)
            .map(|t| {
                let value = Arc::clone(&value);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        value.set(t * 1000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every set writes a value no other set writes, so each one is a transition.
        assert_eq!(count.load(Ordering::SeqCst), 400);
    }
}
