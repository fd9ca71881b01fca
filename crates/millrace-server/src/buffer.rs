//! Per-session replay buffer.
//!
//! A bounded FIFO of the most recent serialized outbound frames for one
//! session. A client reattaching within the idle grace window gets the
//! buffer replayed before any live frame; a client absent longer than the
//! buffer's effective window loses the oldest frames — documented lossy
//! replay, not an error.

use std::collections::VecDeque;
use std::sync::Arc;

/// Bounded FIFO of recent outbound frames for one session.
pub struct SessionBuffer {
    frames: VecDeque<Arc<String>>,
    capacity: usize,
    evicted: u64,
}

impl SessionBuffer {
    /// Create a buffer retaining at most `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    /// Append a frame, evicting the oldest when full. O(1) amortized.
    pub fn append(&mut self, frame: Arc<String>) {
        if self.frames.len() == self.capacity {
            let _ = self.frames.pop_front();
            self.evicted += 1;
        }
        self.frames.push_back(frame);
    }

    /// Iterate buffered frames in insertion order without removing them.
    ///
    /// Replay is non-destructive so a second simultaneously-attaching
    /// connection receives the identical backlog.
    pub fn replay(&self) -> impl Iterator<Item = &Arc<String>> {
        self.frames.iter()
    }

    /// Number of buffered frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total frames evicted due to overflow.
    #[must_use]
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
