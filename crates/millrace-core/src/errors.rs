//! Error hierarchy for the millrace gateway.
//!
//! Built on [`thiserror`]:
//!
//! - [`MillraceError`]: top-level enum covering all error domains
//! - [`RoutingError`]: malformed or misdirected inbound frames
//! - [`GeneratorError`]: failures from the external text engine
//! - [`TransportError`]: client-side connection lifecycle failures
//!
//! Routing errors are answered on the offending connection only; generator
//! errors terminate a single query's stream; transport errors are absorbed
//! by the client's reconnect machine and surface only as state changes.

use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// MillraceError — top-level
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level error type.
#[derive(Debug, Error)]
pub enum MillraceError {
    /// Inbound frame could not be routed.
    #[error("{0}")]
    Routing(#[from] RoutingError),

    /// The external generator failed.
    #[error("{0}")]
    Generator(#[from] GeneratorError),

    /// Client transport failure.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// Socket bind / accept failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// RoutingError
// ─────────────────────────────────────────────────────────────────────────────

/// An inbound frame the router cannot dispatch.
///
/// Never fatal to the session: the offending connection gets an `error`
/// frame and everything else proceeds.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Text that does not parse as any known frame.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A server→client kind arriving as client input.
    #[error("frame type `{kind}` is not valid client input")]
    NotClientInput {
        /// The offending wire tag.
        kind: &'static str,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// GeneratorError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure from the external text-generation engine.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GeneratorError {
    /// The engine reported a failure starting or continuing a stream.
    #[error("generation failed: {message}")]
    Failed {
        /// Engine-provided description.
        message: String,
        /// Whether resubmitting the query may succeed.
        retryable: bool,
    },

    /// The stream was cancelled cooperatively.
    #[error("generation cancelled")]
    Cancelled,
}

impl GeneratorError {
    /// Failure with a description; assumed not retryable.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether resubmitting the query may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed { retryable, .. } => *retryable,
            Self::Cancelled => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TransportError
// ─────────────────────────────────────────────────────────────────────────────

/// Client-side connection lifecycle failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// TCP / WebSocket upgrade failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The server did not complete the handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The server's first frame was not a valid `connected`.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The transport has reached its terminal state.
    #[error("transport closed")]
    Closed,
}
