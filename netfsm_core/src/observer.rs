//! Ordered observer lists.
//!
//! Observers fire in registration order. The list is snapshotted before
//! firing, so a callback that subscribes or unsubscribes (itself or another
//! observer) affects the next notification, never the current one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Handle returned by [`Observers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct Observers<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(SubscriptionId, Callback<E>)>>,
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Callback<E>)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push((id, Arc::new(callback)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn notify(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .entries()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in snapshot {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_in_registration_order() {
        let observers = Observers::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            observers.subscribe(move |value: &u32| log.lock().unwrap().push((tag, *value)));
        }
        observers.notify(&7);

        assert_eq!(
            *log.lock().unwrap(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[test]
    fn test_unsubscribe_during_notify_does_not_skip() {
        let observers = Arc::new(Observers::<()>::new());
        let hits = Arc::new(Mutex::new(Vec::new()));
        let second_id = Arc::new(Mutex::new(None));

        {
            let observers_ref = Arc::clone(&observers);
            let hits = Arc::clone(&hits);
            let second_id = Arc::clone(&second_id);
            observers.subscribe(move |_| {
                hits.lock().unwrap().push(1);
                if let Some(id) = *second_id.lock().unwrap() {
                    observers_ref.unsubscribe(id);
                }
            });
        }
        {
            let hits = Arc::clone(&hits);
            let id = observers.subscribe(move |_| hits.lock().unwrap().push(2));
            *second_id.lock().unwrap() = Some(id);
        }

        observers.notify(&());
        assert_eq!(*hits.lock().unwrap(), vec![1, 2]);

        observers.notify(&());
        assert_eq!(*hits.lock().unwrap(), vec![1, 2, 1]);
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn test_unsubscribe_unknown_returns_false() {
        let observers = Observers::<()>::new();
        let id = observers.subscribe(|_| {});
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        assert!(observers.is_empty());
    }
}
