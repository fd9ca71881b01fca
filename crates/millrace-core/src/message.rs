//! The wire protocol.
//!
//! Both directions exchange a single unit: the [`Frame`] — a session-scoped
//! envelope around a closed [`Payload`] union. The union is internally
//! tagged (`"type"`), so an unknown inbound type is a deserialization error
//! handled by the router, never a stringly-typed runtime comparison.
//!
//! Frames are immutable once constructed; the timestamp is assigned at
//! creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{QueryId, SessionId};

// ─────────────────────────────────────────────────────────────────────────────
// Payload — closed tagged union of message kinds
// ─────────────────────────────────────────────────────────────────────────────

/// The type-specific body of a [`Frame`].
///
/// Client→server kinds: `query`, `ping`, `disconnect`. Everything else is
/// server→client. The router rejects server→client kinds arriving inbound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Handshake acknowledgement carrying the (possibly server-assigned)
    /// session ID in the envelope.
    Connected,

    /// Submit a query for streaming generation.
    Query {
        /// Client-chosen identifier correlating the response stream.
        query_id: QueryId,
        /// The natural-language query text.
        query_text: String,
    },

    /// Generation for a query has begun.
    QueryStart {
        /// The query this stream belongs to.
        query_id: QueryId,
    },

    /// One generated text fragment.
    Chunk {
        /// The query this fragment belongs to.
        query_id: QueryId,
        /// The fragment text.
        content: String,
    },

    /// Terminal: the query's stream finished successfully.
    Complete {
        /// The query that finished.
        query_id: QueryId,
    },

    /// Terminal for a query, or a routing error when `query_id` is absent.
    Error {
        /// The query that failed, if the error is query-scoped.
        #[serde(skip_serializing_if = "Option::is_none")]
        query_id: Option<QueryId>,
        /// Human-readable description.
        message: String,
    },

    /// Client-initiated liveness probe.
    Ping {
        /// Echoed back verbatim in the `pong`.
        nonce: u64,
    },

    /// Reply to a `ping`, carrying the same nonce.
    Pong {
        /// The probed nonce.
        nonce: u64,
    },

    /// Client requests a graceful close.
    Disconnect,

    /// Server-initiated idle-channel signal.
    Keepalive,
}

impl Payload {
    /// Wire tag for logging and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Query { .. } => "query",
            Self::QueryStart { .. } => "query_start",
            Self::Chunk { .. } => "chunk",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Disconnect => "disconnect",
            Self::Keepalive => "keepalive",
        }
    }

    /// Whether this kind is valid as client→server input.
    #[must_use]
    pub fn is_client_input(&self) -> bool {
        matches!(
            self,
            Self::Query { .. } | Self::Ping { .. } | Self::Disconnect
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame — session-scoped envelope
// ─────────────────────────────────────────────────────────────────────────────

/// One wire message: payload plus session scope and creation time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Owning session. Present on every frame after the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Assigned when the frame is constructed.
    pub timestamp: DateTime<Utc>,
    /// The type-specific body.
    #[serde(flatten)]
    pub payload: Payload,
}

impl Frame {
    /// Construct a frame, stamping the current time.
    #[must_use]
    pub fn new(session_id: Option<SessionId>, payload: Payload) -> Self {
        Self {
            session_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Handshake acknowledgement for `session_id`.
    #[must_use]
    pub fn connected(session_id: SessionId) -> Self {
        Self::new(Some(session_id), Payload::Connected)
    }

    /// `query_start` for a query on a session.
    #[must_use]
    pub fn query_start(session_id: SessionId, query_id: QueryId) -> Self {
        Self::new(Some(session_id), Payload::QueryStart { query_id })
    }

    /// One fragment of a query's response.
    #[must_use]
    pub fn chunk(session_id: SessionId, query_id: QueryId, content: impl Into<String>) -> Self {
        Self::new(
            Some(session_id),
            Payload::Chunk {
                query_id,
                content: content.into(),
            },
        )
    }

    /// Successful terminal for a query.
    #[must_use]
    pub fn complete(session_id: SessionId, query_id: QueryId) -> Self {
        Self::new(Some(session_id), Payload::Complete { query_id })
    }

    /// Error frame, query-scoped when `query_id` is given.
    #[must_use]
    pub fn error(
        session_id: Option<SessionId>,
        query_id: Option<QueryId>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            session_id,
            Payload::Error {
                query_id,
                message: message.into(),
            },
        )
    }

    /// Reply to a `ping`.
    #[must_use]
    pub fn pong(session_id: SessionId, nonce: u64) -> Self {
        Self::new(Some(session_id), Payload::Pong { nonce })
    }

    /// Server idle-channel signal.
    #[must_use]
    pub fn keepalive(session_id: SessionId) -> Self {
        Self::new(Some(session_id), Payload::Keepalive)
    }

    /// Serialize to the wire representation.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a frame from the wire representation.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
