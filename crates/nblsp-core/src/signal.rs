//! Observer primitive used between documents, managers and adapters.
//!
//! ## Learning: Observer Pattern in Rust
//!
//! Callback-based observers need shared mutable references to listeners,
//! which fights the borrow checker. A `Signal<T>` instead keeps one
//! unbounded `tokio::sync::mpsc` sender per subscriber: emitting clones the
//! event into every live channel, and each subscriber drains its own.
//!
//! Delivery is lossless. A subscriber that falls behind buffers events
//! instead of missing them, so a rebuild that opens hundreds of foreign
//! documents reaches every listener intact.
//!
//! Only events emitted *after* `subscribe()` are delivered, so owners
//! subscribe while constructing themselves, before anything can emit.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// A typed, multi-subscriber event channel.
pub struct Signal<T: Clone> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T: Clone> Signal<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emits an event to all current subscribers and returns how many
    /// received it. Dropped subscribers are forgotten.
    pub fn emit(&self, event: T) -> usize {
        let mut subscribers = self.subscribers();
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
        subscribers.len()
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> SignalReceiver<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers().push(sender);
        SignalReceiver { receiver }
    }

    /// Returns the number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        let mut subscribers = self.subscribers();
        subscribers.retain(|sender| !sender.is_closed());
        subscribers.len()
    }
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<T: Clone> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("receivers", &self.subscribers().len())
            .finish()
    }
}

/// Receiving end of a [`Signal`].
pub struct SignalReceiver<T: Clone> {
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T: Clone> SignalReceiver<T> {
    /// Waits for the next event. Returns `None` once the signal is dropped
    /// and everything it emitted has been received.
    pub async fn next(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Returns an already emitted event without waiting.
    pub fn try_next(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Drains every event emitted so far.
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}
