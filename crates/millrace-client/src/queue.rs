//! Offline outbound queue.
//!
//! Payloads composed while the transport is not `Open` wait here and drain
//! FIFO on (re)entering `Open`, before any newer caller-submitted payload —
//! preserving causal order from the caller's perspective. Bounded: beyond
//! capacity the oldest entry is dropped.

use std::collections::VecDeque;

use millrace_core::message::Payload;
use tracing::warn;

/// FIFO of payloads awaiting an open connection.
pub struct MessageQueue {
    items: VecDeque<Payload>,
    capacity: usize,
    dropped: u64,
}

impl MessageQueue {
    /// Create a queue bounded at `capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append a payload, dropping the oldest when full.
    pub fn push(&mut self, payload: Payload) {
        if self.items.len() == self.capacity {
            let _ = self.items.pop_front();
            self.dropped += 1;
            warn!(capacity = self.capacity, "offline queue full, dropped oldest payload");
        }
        self.items.push_back(payload);
    }

    /// Peek at the oldest queued payload.
    #[must_use]
    pub fn front(&self) -> Option<&Payload> {
        self.items.front()
    }

    /// Remove and return the oldest queued payload.
    pub fn pop(&mut self) -> Option<Payload> {
        self.items.pop_front()
    }

    /// Number of queued payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Payloads dropped due to overflow.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(nonce: u64) -> Payload {
        Payload::Ping { nonce }
    }

    #[test]
    fn drains_fifo() {
        let mut q = MessageQueue::new(10);
        q.push(ping(1));
        q.push(ping(2));
        q.push(ping(3));

        assert_eq!(q.pop(), Some(ping(1)));
        assert_eq!(q.pop(), Some(ping(2)));
        assert_eq!(q.pop(), Some(ping(3)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn front_does_not_remove() {
        let mut q = MessageQueue::new(10);
        q.push(ping(1));
        assert_eq!(q.front(), Some(&ping(1)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut q = MessageQueue::new(2);
        q.push(ping(1));
        q.push(ping(2));
        q.push(ping(3));

        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.pop(), Some(ping(2)));
        assert_eq!(q.pop(), Some(ping(3)));
    }

    #[test]
    fn zero_capacity_clamped() {
        let mut q = MessageQueue::new(0);
        q.push(ping(1));
        assert_eq!(q.len(), 1);
        q.push(ping(2));
        assert_eq!(q.pop(), Some(ping(2)));
    }

    #[test]
    fn empty_queue() {
        let q = MessageQueue::new(4);
        assert!(q.is_empty());
        assert_eq!(q.front(), None);
        assert_eq!(q.dropped_count(), 0);
    }
}
