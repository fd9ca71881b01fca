//! Physical connection state.
//!
//! One [`Connection`] per attached `WebSocket`. The registry owns it for
//! its whole lifetime; it is bound to exactly one session at construction
//! and never rebound.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use millrace_core::ids::{ConnectionId, SessionId};
use millrace_core::message::Frame;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Result of offering a frame to a connection's outbound queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Enqueued for the write task.
    Delivered,
    /// The queue was full; this copy was dropped.
    Dropped,
    /// The write task is gone — the connection is dead.
    Disconnected,
}

/// One physical transport attached to a session.
pub struct Connection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// The owning session. Fixed at handshake.
    pub session_id: SessionId,
    /// Send channel to this connection's socket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Last inbound traffic (any frame, including pings).
    last_seen: Mutex<Instant>,
    /// Frames dropped due to a full outbound queue.
    dropped_frames: AtomicU64,
}

impl Connection {
    /// Create a connection bound to `session_id`.
    #[must_use]
    pub fn new(id: ConnectionId, session_id: SessionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            session_id,
            tx,
            connected_at: now,
            last_seen: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Offer an already-serialized frame to the outbound queue.
    pub fn send_raw(&self, frame: Arc<String>) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Disconnected,
        }
    }

    /// Serialize and send a frame, bypassing the session buffer.
    ///
    /// Used for `pong` replies and per-connection `error` frames, which
    /// must never appear in another connection's replay.
    pub fn send_frame(&self, frame: &Frame) -> Delivery {
        match frame.to_json() {
            Ok(json) => self.send_raw(Arc::new(json)),
            Err(e) => {
                tracing::error!(conn_id = %self.id, error = %e, "failed to serialize frame");
                Delivery::Dropped
            }
        }
    }

    /// Record inbound traffic for staleness tracking.
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound traffic.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Frames dropped on this connection due to backpressure.
    #[must_use]
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Connection age.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
