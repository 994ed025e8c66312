//! Readiness change fan-out

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

pub type ReadinessListener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
pub struct ReadinessListeners {
    next_id: Mutex<u64>,
    listeners: Mutex<BTreeMap<u64, ReadinessListener>>,
}

impl ReadinessListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token to pass to `unsubscribe`.
    pub fn subscribe(&self, listener: ReadinessListener) -> u64 {
        let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        *next += 1;
        let id = *next;
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, listener);
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    /// Call every listener; a panicking listener does not stop the rest.
    pub fn notify(&self, ready: bool) {
        let snapshot: Vec<(u64, ReadinessListener)> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, l)| (*id, l.clone()))
            .collect();

        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(ready))).is_err() {
                warn!(
                    component = "readiness",
                    event = "readiness.listener_panicked",
                    listener_id = id,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn panicking_listener_is_isolated() {
        let listeners = ReadinessListeners::new();
        let calls = Arc::new(AtomicUsize::new(0));

        listeners.subscribe(Arc::new(|_| panic!("listener bug")));
        let counter = calls.clone();
        listeners.subscribe(Arc::new(move |ready| {
            assert!(ready);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.notify(true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribed_listener_is_not_called() {
        let listeners = ReadinessListeners::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = listeners.subscribe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(listeners.unsubscribe(id));
        assert!(!listeners.unsubscribe(id));
        listeners.notify(false);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
