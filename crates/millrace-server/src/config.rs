//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the millrace server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Outbound frames retained per session for replay (default 100).
    pub session_buffer_size: usize,
    /// Interval between server-initiated `keepalive` frames, in seconds.
    pub keepalive_interval_secs: u64,
    /// How long a session may sit with no connections before eviction,
    /// in seconds.
    pub idle_grace_secs: u64,
    /// A connection with no inbound traffic for this long is reaped,
    /// in seconds.
    pub stale_connection_secs: u64,
    /// Interval between registry sweep passes, in seconds.
    pub sweep_interval_secs: u64,
    /// Per-connection outbound queue bound.
    pub max_send_queue: usize,
    /// Max `WebSocket` message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            session_buffer_size: 100,
            keepalive_interval_secs: 30,
            idle_grace_secs: 60,
            stale_connection_secs: 90,
            sweep_interval_secs: 15,
            max_send_queue: 256,
            max_message_size: 1024 * 1024, // 1 MB
        }
    }
}

impl ServerConfig {
    /// Keepalive interval as a [`Duration`].
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Idle-session grace period as a [`Duration`].
    #[must_use]
    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }

    /// Stale-connection timeout as a [`Duration`].
    #[must_use]
    pub fn stale_connection(&self) -> Duration {
        Duration::from_secs(self.stale_connection_secs)
    }

    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
