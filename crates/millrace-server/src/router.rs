//! Inbound frame dispatch.
//!
//! [`MessageRouter::route`] parses one text frame from a connection and
//! dispatches it by exhaustive match over [`Payload`] — the closed union
//! makes an unknown wire tag a parse error, not a runtime string
//! comparison. Routing failures are answered on the offending connection
//! only and never disturb the session's other connections.

use std::sync::Arc;

use metrics::counter;
use millrace_core::errors::RoutingError;
use millrace_core::message::{Frame, Payload};
use tracing::{debug, instrument, warn};

use crate::connection::Connection;
use crate::metrics::ROUTING_ERRORS_TOTAL;
use crate::registry::ConnectionRegistry;
use crate::streamer::QueryStreamer;

/// What the session loop should do after a frame is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteAction {
    /// Keep reading from the socket.
    Continue,
    /// The client asked for a graceful close.
    Close,
}

/// Dispatches inbound frames to the streamer and registry.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    streamer: Arc<QueryStreamer>,
}

impl MessageRouter {
    /// Create a router over a registry and streamer.
    pub fn new(registry: Arc<ConnectionRegistry>, streamer: Arc<QueryStreamer>) -> Self {
        Self { registry, streamer }
    }

    /// Route one inbound text frame from `connection`.
    #[instrument(skip_all, fields(conn_id = %connection.id, session_id = %connection.session_id))]
    pub async fn route(&self, connection: &Arc<Connection>, text: &str) -> RouteAction {
        connection.mark_alive();

        let frame = match Frame::from_json(text) {
            Ok(f) => f,
            Err(e) => {
                let err = RoutingError::Malformed(e.to_string());
                self.reject(connection, &err);
                return RouteAction::Continue;
            }
        };

        debug!(kind = frame.payload.kind(), "routing frame");
        match frame.payload {
            Payload::Query {
                query_id,
                query_text,
            } => {
                let _ = self
                    .streamer
                    .start(connection.session_id.clone(), query_id, query_text)
                    .await;
                RouteAction::Continue
            }

            Payload::Ping { nonce } => {
                // Direct reply: pongs never enter the session buffer.
                let _ = connection
                    .send_frame(&Frame::pong(connection.session_id.clone(), nonce));
                RouteAction::Continue
            }

            Payload::Disconnect => {
                let cancelled = self.registry.cancel_jobs(&connection.session_id).await;
                debug!(cancelled, "client disconnecting gracefully");
                RouteAction::Close
            }

            // Server→client kinds are not valid input.
            Payload::Connected
            | Payload::QueryStart { .. }
            | Payload::Chunk { .. }
            | Payload::Complete { .. }
            | Payload::Error { .. }
            | Payload::Pong { .. }
            | Payload::Keepalive => {
                let err = RoutingError::NotClientInput {
                    kind: frame.payload.kind(),
                };
                self.reject(connection, &err);
                RouteAction::Continue
            }
        }
    }

    /// Answer a routing error on the offending connection only.
    fn reject(&self, connection: &Arc<Connection>, err: &RoutingError) {
        counter!(ROUTING_ERRORS_TOTAL).increment(1);
        warn!(conn_id = %connection.id, error = %err, "rejecting inbound frame");
        let frame = Frame::error(
            Some(connection.session_id.clone()),
            None,
            err.to_string(),
        );
        let _ = connection.send_frame(&frame);
    }
}
