use crate::reading::Reading;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Pending readings shared by the MQTT handler (producer) and the flusher (consumer).
///
/// The lock is held for a push or a `mem::take` only, never across storage I/O.
#[derive(Debug)]
pub struct IngestBuffer {
    pending: Mutex<VecDeque<Reading>>,
    capacity: Option<usize>,
}

impl IngestBuffer {
    pub fn unbounded() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            capacity: None,
        }
    }

    /// Caps the queue; once full, each append evicts the oldest pending reading.
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: Some(capacity),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Adds `reading` to the tail. Returns the evicted reading when the cap was hit.
    pub fn append(&self, reading: Reading) -> Option<Reading> {
        let mut pending = self.lock();
        let evicted = match self.capacity {
            Some(cap) if pending.len() >= cap => pending.pop_front(),
            _ => None,
        };
        pending.push_back(reading);
        evicted
    }

    /// Swaps in an empty queue and hands back everything that was pending, in
    /// insertion order.
    pub fn drain(&self) -> Vec<Reading> {
        let taken = std::mem::take(&mut *self.lock());
        Vec::from(taken)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panic while holding the lock cannot leave the deque half-updated, so a
    // poisoned guard is still usable.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Reading>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for IngestBuffer {
    fn default() -> Self {
        Self::unbounded()
    }
}
