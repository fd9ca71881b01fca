//! WebSocket session lifecycle — one connected client from upgrade through
//! disconnect.
//!
//! Handshake: the client may request a prior session via `?session_id=`;
//! otherwise a fresh one is assigned. The `connected` frame goes out first,
//! then the connection registers — so a resuming client sees `connected`,
//! the buffered replay, then live frames, in that order.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use millrace_core::ids::{ConnectionId, SessionId};
use millrace_core::message::Frame;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::router::RouteAction;
use crate::server::AppState;

/// Run a WebSocket session for a connected client.
///
/// 1. Resolves the session (requested or fresh) and sends `connected`
/// 2. Registers the connection — buffered frames replay here
/// 3. Forwards outbound frames and periodic `keepalive`s via a write task
/// 4. Dispatches inbound text frames through the router
/// 5. Unregisters on disconnect
#[instrument(skip_all, fields(session_id, conn_id))]
pub async fn run_ws_session(
    socket: WebSocket,
    requested_session: Option<SessionId>,
    state: AppState,
) {
    let resumed = requested_session.is_some();
    let session_id = requested_session.unwrap_or_default();
    let conn_id = ConnectionId::new();
    let _ = tracing::Span::current().record("session_id", session_id.as_str());
    let _ = tracing::Span::current().record("conn_id", conn_id.as_str());

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Handshake acknowledgement precedes registration so the replay never
    // outruns it.
    let connected = Frame::connected(session_id.clone());
    match connected.to_json() {
        Ok(json) => {
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                debug!("client went away during handshake");
                return;
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize handshake frame");
            return;
        }
    }

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(state.config.max_send_queue);
    let connection = Arc::new(Connection::new(
        conn_id.clone(),
        session_id.clone(),
        send_tx,
    ));

    let connection_start = Instant::now();
    info!(resumed, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    state.registry.register(Arc::clone(&connection)).await;

    // Write task: forwards outbound frames, emits keepalives on idle ticks,
    // closes on server shutdown.
    let keepalive_interval = state.config.keepalive_interval();
    let keepalive_session = session_id.clone();
    let shutdown = state.shutdown.token();
    let writer = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(keepalive_interval);
        keepalive.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                frame = send_rx.recv() => {
                    match frame {
                        Some(text) => {
                            if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = keepalive.tick() => {
                    let frame = Frame::keepalive(keepalive_session.clone());
                    let Ok(json) = frame.to_json() else { break };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                () = shutdown.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Read loop: dispatch inbound frames through the router.
    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(ref t) => Some(t.to_string()),
            Message::Binary(ref data) => match std::str::from_utf8(data) {
                Ok(s) => Some(s.to_owned()),
                Err(_) => {
                    warn!(len = data.len(), "dropping non-UTF8 binary frame");
                    None
                }
            },
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                connection.mark_alive();
                None
            }
        };

        let Some(text) = text else { continue };

        if state.router.route(&connection, &text).await == RouteAction::Close {
            break;
        }
    }

    info!("client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());

    state.registry.unregister(&session_id, &conn_id).await;
    writer.abort();
}

#[cfg(test)]
mod tests {
    // The session loop needs a live WebSocket and is exercised end-to-end
    // in tests/integration.rs. Unit coverage here pins the handshake frame
    // shape the loop emits.

    use millrace_core::ids::SessionId;
    use millrace_core::message::{Frame, Payload};

    #[test]
    fn handshake_frame_shape() {
        let frame = Frame::connected(SessionId::from("s1"));
        let json = frame.to_json().unwrap();
        assert!(json.contains(r#""type":"connected""#));
        assert!(json.contains(r#""session_id":"s1""#));
    }

    #[test]
    fn fresh_session_when_none_requested() {
        let requested: Option<SessionId> = None;
        let assigned = requested.unwrap_or_default();
        assert!(!assigned.as_str().is_empty());
    }

    #[test]
    fn keepalive_frame_shape() {
        let frame = Frame::keepalive(SessionId::from("s1"));
        match frame.payload {
            Payload::Keepalive => {}
            other => panic!("expected keepalive, got {other:?}"),
        }
    }
}
