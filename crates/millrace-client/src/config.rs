//! Client transport configuration.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Jitter fraction: each delay is stretched by up to this share of
    /// itself, spreading reconnection storms across many clients.
    pub jitter: f64,
    /// Maximum number of attempts before giving up (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Deterministic delay for a given attempt number (0-indexed),
    /// capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as f64) as u64)
    }

    /// [`Self::delay_for_attempt`] stretched by a random share of itself
    /// (up to the jitter fraction), still capped at `max_delay`.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.mul_f64(rand::rng().random_range(0.0..=self.jitter));
        (base + spread).min(self.max_delay)
    }
}

/// Configuration for [`crate::transport::ClientTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interval between `ping` frames while `Open`.
    pub heartbeat_interval: Duration,
    /// A matching `pong` must arrive within this window or the connection
    /// is treated as dead, even without a socket-level error.
    pub heartbeat_timeout: Duration,
    /// Bound on connect + `connected`-frame handshake.
    pub handshake_timeout: Duration,
    /// Offline queue bound (oldest dropped beyond this).
    pub queue_capacity: usize,
    /// Inbound event channel bound.
    pub event_capacity: usize,
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            queue_capacity: 256,
            event_capacity: 64,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_defaults() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.max_attempts.is_none());
    }

    #[test]
    fn first_attempt_uses_initial_delay() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn delay_capped_at_max() {
        let config = ReconnectConfig::default();
        // 2^10 seconds would be ~17 minutes; capped to 30s.
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(30), Duration::from_secs(30));
    }

    #[test]
    fn delays_non_decreasing_up_to_cap() {
        let config = ReconnectConfig::default();
        let mut prev = Duration::ZERO;
        for attempt in 0..20 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay >= prev, "delay shrank at attempt {attempt}");
            assert!(delay <= config.max_delay);
            prev = delay;
        }
    }

    #[test]
    fn jittered_delay_within_bounds() {
        let config = ReconnectConfig::default();
        for attempt in 0..8 {
            let base = config.delay_for_attempt(attempt);
            for _ in 0..50 {
                let jittered = config.jittered_delay(attempt);
                assert!(jittered >= base, "jitter must never shorten the delay");
                assert!(jittered <= base.mul_f64(1.0 + config.jitter).min(config.max_delay));
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let config = ReconnectConfig {
            jitter: 0.0,
            ..ReconnectConfig::default()
        };
        assert_eq!(config.jittered_delay(2), config.delay_for_attempt(2));
    }

    #[test]
    fn jittered_delay_never_exceeds_cap() {
        let config = ReconnectConfig {
            jitter: 0.5,
            ..ReconnectConfig::default()
        };
        for _ in 0..50 {
            assert!(config.jittered_delay(12) <= config.max_delay);
        }
    }

    #[test]
    fn transport_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(config.queue_capacity, 256);
    }
}
