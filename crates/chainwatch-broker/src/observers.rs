//! Typed observer registries.
//!
//! One registry per concern (disconnects, errors, incoming envelopes, …)
//! with explicit subscribe/unsubscribe handles. Dropping the handle removes
//! the observer, so listener lists cannot grow without bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// A set of observers interested in values of type `T`.
pub struct ObserverSet<T> {
    entries: Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<T>>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for ObserverSet<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<T> Default for ObserverSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObserverSet<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register an observer. The returned handle unsubscribes on drop.
    pub fn subscribe(&self) -> (ObserverHandle, mpsc::UnboundedReceiver<T>)
    where
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().insert(id, tx);

        let entries = self.entries.clone();
        let handle = ObserverHandle {
            unsubscribe: Some(Box::new(move || {
                entries.lock().unwrap().remove(&id);
            })),
        };
        (handle, rx)
    }

    /// Number of live observers.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> ObserverSet<T> {
    /// Deliver `value` to every observer. Observers whose receiver was
    /// dropped are pruned.
    pub fn emit(&self, value: T) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, tx| tx.send(value.clone()).is_ok());
    }
}

/// Subscription handle; dropping it removes the observer from its set.
pub struct ObserverHandle {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle").finish()
    }
}
