//! Fan-out of session streams to any number of live subscribers
//!
//! Each subscriber owns a bounded queue. Publishing never blocks: a subscriber
//! whose queue is full, or whose receiver was dropped, is removed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Queue depth of each subscriber
pub const SUBSCRIBER_DEPTH: usize = 10;

struct Registry<T> {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<T>>,
}

/// Registry of subscriber queues
pub struct EventHub<T> {
    registry: Arc<Mutex<Registry<T>>>,
    depth: usize,
}

impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            depth: self.depth,
        }
    }
}

impl<T: Clone + Send + 'static> Default for EventHub<T> {
    fn default() -> Self {
        Self::new(SUBSCRIBER_DEPTH)
    }
}

impl<T: Clone + Send + 'static> EventHub<T> {
    /// Hub whose subscribers each queue up to `depth` values
    pub fn new(depth: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                subscribers: HashMap::new(),
            })),
            depth: depth.max(1),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscriber; it only sees values published from now on
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(self.depth);
        let mut registry = self.registry();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);
        debug!(id, "subscriber added");
        (id, rx)
    }

    /// Returns false if `id` was not subscribed
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.registry().subscribers.remove(&id).is_some()
    }

    /// Live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.registry().subscribers.len()
    }

    /// Offer `value` to every subscriber and return how many accepted it
    pub fn publish(&self, value: &T) -> usize {
        let mut registry = self.registry();
        let mut delivered = 0;
        registry.subscribers.retain(|id, tx| match tx.try_send(value.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(id, "subscriber queue full, dropping subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(id, "subscriber gone");
                false
            }
        });
        delivered
    }

    /// Forward everything received on `source` to the subscribers until it closes
    pub fn pump(&self, mut source: mpsc::Receiver<T>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(value) = source.recv().await {
                hub.publish(&value);
            }
        })
    }
}
