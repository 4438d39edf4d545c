//! Bounded hand-off queue between the table producer and a column writer.
//!
//! [`ZeroCopyQueue`] moves ownership of each item from producer to consumer;
//! nothing is cloned. `put` blocks while the queue is full, which is the
//! backpressure that keeps memory bounded when storage is slower than
//! decoding. After [`ZeroCopyQueue::close`] the consumer drains what is left
//! and then sees `None`.

#[cfg(test)]
mod tests;

use std::sync::Mutex;

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;

/// Errors returned by [`ZeroCopyQueue::put`]. Both hand the item back.
#[derive(Error)]
pub enum QueueError<T> {
    /// The queue was closed before the item was accepted.
    #[error("queue is closed")]
    Closed(T),

    /// The consumer side is gone.
    #[error("queue consumer disconnected")]
    Disconnected(T),
}

impl<T> QueueError<T> {
    /// Recovers the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(item) | Self::Disconnected(item) => item,
        }
    }
}

impl<T> std::fmt::Debug for QueueError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed(_) => f.write_str("Closed(..)"),
            Self::Disconnected(_) => f.write_str("Disconnected(..)"),
        }
    }
}

/// Bounded FIFO with explicit close.
///
/// Shared by reference (typically through an `Arc`) between exactly one
/// producer and one consumer, although any number of either is safe.
pub struct ZeroCopyQueue<T> {
    /// `None` once closed; dropping the last sender ends the stream.
    sender: Mutex<Option<Sender<T>>>,
    receiver: Receiver<T>,
    capacity: usize,
}

impl<T> ZeroCopyQueue<T> {
    /// Creates a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = channel::bounded(capacity);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            capacity,
        }
    }

    /// Hands `item` to the consumer, blocking while the queue is full.
    pub fn put(&self, item: T) -> Result<(), QueueError<T>> {
        // Send outside the lock so a blocked producer never stalls close().
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match sender {
            None => Err(QueueError::Closed(item)),
            Some(sender) => sender
                .send(item)
                .map_err(|e| QueueError::Disconnected(e.into_inner())),
        }
    }

    /// Takes the next item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub fn get(&self) -> Option<T> {
        self.receiver.recv().ok()
    }

    /// Takes the next item if one is ready.
    pub fn try_get(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Stops accepting items. Queued items stay available to `get`.
    ///
    /// Idempotent.
    pub fn close(&self) {
        let mut guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take();
    }

    pub fn is_closed(&self) -> bool {
        match self.sender.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
