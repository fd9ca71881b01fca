//! The reconnecting client transport.
//!
//! `Connecting → Open → Reconnecting → Closed`, driven by one task that
//! owns the socket, the heartbeat timer, the pong deadline, the backoff
//! sleep, and the offline queue. There is exactly one timer owner, so
//! reconnect attempts can never race each other, and no state needs a
//! lock.
//!
//! `Closed` is terminal and reached only by caller [`ClientTransport::close`]
//! or by exhausting a configured attempt limit. Everything else — socket
//! errors, missed pongs, failed dials — cycles through `Reconnecting` with
//! jittered exponential backoff, and is surfaced to the caller only as a
//! state change.

use std::fmt;

use futures::{SinkExt, StreamExt};
use millrace_core::errors::TransportError;
use millrace_core::ids::SessionId;
use millrace_core::message::{Frame, Payload};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::TransportConfig;
use crate::queue::MessageQueue;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const COMMAND_CAPACITY: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Public surface
// ─────────────────────────────────────────────────────────────────────────────

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    /// First dial in progress.
    Connecting,
    /// Handshake complete; frames flow.
    Open,
    /// Connection lost; dialing again with backoff.
    Reconnecting,
    /// Terminal. Caller closed, or the attempt limit was exhausted.
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What the transport surfaces to its consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The state machine moved.
    State(TransportState),
    /// A protocol frame arrived (pongs and keepalives are absorbed).
    Frame(Frame),
}

enum Command {
    Send(Payload),
    Close,
}

/// Handle to the reconnecting transport.
///
/// Cheap to hold; the work happens in the driver task. Dropping the handle
/// without [`close`](Self::close) cancels the driver.
pub struct ClientTransport {
    cmd_tx: mpsc::Sender<Command>,
    events_rx: mpsc::Receiver<TransportEvent>,
    state_rx: watch::Receiver<TransportState>,
    session_rx: watch::Receiver<Option<SessionId>>,
    cancel: CancellationToken,
    driver: Option<tokio::task::JoinHandle<()>>,
}

impl ClientTransport {
    /// Start a transport toward `url` (e.g. `ws://host:port/ws`).
    ///
    /// Returns immediately in `Connecting`; watch [`state`](Self::state) or
    /// the event stream for progress.
    #[must_use]
    pub fn connect(url: impl Into<String>, config: TransportConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(TransportState::Connecting);
        let (session_tx, session_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let driver = Driver {
            url: url.into(),
            queue: MessageQueue::new(config.queue_capacity),
            config,
            cmd_rx,
            events_tx,
            state_tx,
            session_tx,
            session_id: None,
            cancel: cancel.clone(),
            nonce: 0,
        };
        let handle = tokio::spawn(driver.run());

        Self {
            cmd_tx,
            events_rx,
            state_rx,
            session_rx,
            cancel,
            driver: Some(handle),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }

    /// Session established by the last successful handshake.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_rx.borrow().clone()
    }

    /// Submit a payload. While not `Open` it joins the offline queue and is
    /// delivered, in order, after the next successful handshake.
    pub async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        self.cmd_tx
            .send(Command::Send(payload))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Receive the next event. `None` once the driver is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events_rx.recv().await
    }

    /// Wait until the transport reaches `target`, up to `wait`.
    pub async fn wait_for(&mut self, target: TransportState, wait: std::time::Duration) -> bool {
        timeout(wait, async {
            loop {
                if *self.state_rx.borrow() == target {
                    return true;
                }
                if self.state_rx.changed().await.is_err() {
                    return *self.state_rx.borrow() == target;
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Disconnect and transition to `Closed`, cancelling any pending
    /// timers — including a backoff sleep in progress.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        let _ = self.cmd_tx.try_send(Command::Close);
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransport")
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver — the single owner of socket, timers, and queue
// ─────────────────────────────────────────────────────────────────────────────

enum Exit {
    /// Terminal close (caller request or command channel gone).
    Closed,
    /// Connection lost; go through `Reconnecting`.
    Dropped,
}

struct Driver {
    url: String,
    config: TransportConfig,
    cmd_rx: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<TransportEvent>,
    state_tx: watch::Sender<TransportState>,
    session_tx: watch::Sender<Option<SessionId>>,
    queue: MessageQueue,
    session_id: Option<SessionId>,
    cancel: CancellationToken,
    nonce: u64,
}

impl Driver {
    #[instrument(skip_all, fields(url = %self.url))]
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let cancel = self.cancel.clone();
            let dialed = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.dial() => result,
            };

            match dialed {
                Ok(ws) => {
                    attempt = 0;
                    self.set_state(TransportState::Open);
                    match self.run_open(ws).await {
                        Exit::Closed => break,
                        Exit::Dropped => {
                            if self.cancel.is_cancelled() {
                                break;
                            }
                            self.set_state(TransportState::Reconnecting);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt, "connection attempt failed");
                    if let Some(max) = self.config.reconnect.max_attempts {
                        if attempt + 1 >= max {
                            warn!(max, "attempt limit reached, giving up");
                            break;
                        }
                    }
                    self.set_state(TransportState::Reconnecting);
                    let delay = self.config.reconnect.jittered_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    if !self.backoff(delay).await {
                        break;
                    }
                }
            }
        }

        self.set_state(TransportState::Closed);
        info!("transport closed");
    }

    fn set_state(&self, state: TransportState) {
        let changed = *self.state_tx.borrow() != state;
        if changed {
            debug!(%state, "transport state change");
            let _ = self.state_tx.send(state);
            // The watch channel is authoritative; the event copy is
            // advisory and must not block the driver.
            let _ = self.events_tx.try_send(TransportEvent::State(state));
        }
    }

    /// Dial and complete the protocol handshake.
    async fn dial(&mut self) -> Result<WsStream, TransportError> {
        let url = match &self.session_id {
            Some(sid) => format!("{}?session_id={sid}", self.url),
            None => self.url.clone(),
        };

        let deadline = Instant::now() + self.config.handshake_timeout;
        let (mut ws, _resp) = match timeout_at(deadline, connect_async(url.as_str())).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            Err(_) => return Err(TransportError::HandshakeTimeout),
        };

        // The server speaks first: `connected` with the session ID.
        loop {
            let msg = match timeout_at(deadline, ws.next()).await {
                Err(_) => return Err(TransportError::HandshakeTimeout),
                Ok(None) => {
                    return Err(TransportError::Handshake(
                        "socket closed during handshake".into(),
                    ));
                }
                Ok(Some(Err(e))) => return Err(TransportError::Handshake(e.to_string())),
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Text(text) => {
                    let frame = Frame::from_json(&text)
                        .map_err(|e| TransportError::Handshake(e.to_string()))?;
                    return match frame.payload {
                        Payload::Connected => {
                            let session_id = frame.session_id.ok_or_else(|| {
                                TransportError::Handshake(
                                    "connected frame missing session_id".into(),
                                )
                            })?;
                            let resumed = self.session_id.is_some();
                            info!(session_id = %session_id, resumed, "handshake complete");
                            self.session_id = Some(session_id.clone());
                            let _ = self.session_tx.send(Some(session_id));
                            Ok(ws)
                        }
                        other => Err(TransportError::Handshake(format!(
                            "expected connected frame, got `{}`",
                            other.kind()
                        ))),
                    };
                }
                Message::Close(_) => {
                    return Err(TransportError::Handshake(
                        "server closed during handshake".into(),
                    ));
                }
                _ => {} // control frames may precede the handshake
            }
        }
    }

    /// The `Open` loop. Returns how the connection ended.
    async fn run_open(&mut self, ws: WsStream) -> Exit {
        let (mut ws_tx, mut ws_rx) = ws.split();

        // Drain the offline queue before any new caller-submitted payload.
        let backlog = self.queue.len();
        while let Some(payload) = self.queue.front().cloned() {
            let frame = Frame::new(self.session_id.clone(), payload);
            let Ok(json) = frame.to_json() else {
                let _ = self.queue.pop();
                continue;
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                // Still queued; it will retransmit after the reconnect.
                return Exit::Dropped;
            }
            let _ = self.queue.pop();
        }
        if backlog > 0 {
            debug!(backlog, "offline queue drained");
        }

        let mut ping_interval = tokio::time::interval(self.config.heartbeat_interval);
        ping_interval.tick().await; // consume the immediate first tick
        let mut pending_nonce: Option<u64> = None;
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let pong_timer = async {
                match pong_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    self.graceful_close(&mut ws_tx).await;
                    return Exit::Closed;
                }

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send(payload)) => {
                        let frame = Frame::new(self.session_id.clone(), payload.clone());
                        match frame.to_json() {
                            Ok(json) => {
                                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                    // Not delivered; keep it for the next session.
                                    self.queue.push(payload);
                                    return Exit::Dropped;
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to serialize outbound frame"),
                        }
                    }
                    Some(Command::Close) | None => {
                        self.graceful_close(&mut ws_tx).await;
                        return Exit::Closed;
                    }
                },

                _ = ping_interval.tick() => {
                    self.nonce += 1;
                    pending_nonce = Some(self.nonce);
                    pong_deadline = Some(Instant::now() + self.config.heartbeat_timeout);
                    let ping = Frame::new(
                        self.session_id.clone(),
                        Payload::Ping { nonce: self.nonce },
                    );
                    let Ok(json) = ping.to_json() else { continue };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        return Exit::Dropped;
                    }
                }

                () = pong_timer => {
                    // Detects silently-dead connections that never raised a
                    // socket error.
                    warn!(nonce = ?pending_nonce, "pong missed within heartbeat timeout");
                    return Exit::Dropped;
                }

                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match Frame::from_json(&text) {
                            Ok(frame) => {
                                match frame.payload {
                                    Payload::Pong { nonce } => {
                                        if pending_nonce == Some(nonce) {
                                            pending_nonce = None;
                                            pong_deadline = None;
                                        }
                                    }
                                    Payload::Keepalive => {} // idle-channel signal only
                                    _ => self.deliver(frame).await,
                                }
                            }
                            Err(e) => warn!(error = %e, "unparseable frame from server"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("server closed the socket");
                        return Exit::Dropped;
                    }
                    Some(Ok(_)) => {} // WS-level control frames
                    Some(Err(e)) => {
                        warn!(error = %e, "socket error");
                        return Exit::Dropped;
                    }
                }
            }
        }
    }

    /// Forward a frame to the consumer without wedging against a full
    /// channel during close.
    async fn deliver(&self, frame: Frame) {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {}
            result = self.events_tx.send(TransportEvent::Frame(frame)) => {
                if result.is_err() {
                    debug!("event receiver dropped");
                }
            }
        }
    }

    async fn graceful_close<S>(&self, ws_tx: &mut S)
    where
        S: SinkExt<Message> + Unpin,
    {
        let disconnect = Frame::new(self.session_id.clone(), Payload::Disconnect);
        if let Ok(json) = disconnect.to_json() {
            let _ = ws_tx.send(Message::Text(json.into())).await;
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    }

    /// Sleep out a backoff delay, still accepting sends (queued) and a
    /// close request. Returns `false` when the transport should stop.
    async fn backoff(&mut self, delay: std::time::Duration) -> bool {
        debug!(?delay, "backing off before reconnect");
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send(payload)) => self.queue.push(payload),
                    Some(Command::Close) | None => return false,
                },
                () = sleep_until(deadline) => return true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(TransportState::Connecting.to_string(), "connecting");
        assert_eq!(TransportState::Open.to_string(), "open");
        assert_eq!(TransportState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(TransportState::Closed.to_string(), "closed");
    }

    #[test]
    fn state_is_copy_and_eq() {
        let a = TransportState::Open;
        let b = a;
        assert_eq!(a, b);
        assert_ne!(TransportState::Open, TransportState::Closed);
    }

    #[tokio::test]
    async fn starts_in_connecting() {
        // Nothing listens on this port; the transport must still hand back
        // a handle immediately, in Connecting.
        let transport = ClientTransport::connect(
            "ws://127.0.0.1:1/ws",
            TransportConfig::default(),
        );
        assert!(matches!(
            transport.state(),
            TransportState::Connecting | TransportState::Reconnecting
        ));
        assert!(transport.session_id().is_none());
    }

    #[tokio::test]
    async fn close_is_terminal_even_while_failing_to_connect() {
        let mut transport = ClientTransport::connect(
            "ws://127.0.0.1:1/ws",
            TransportConfig::default(),
        );
        transport.close().await;
        assert_eq!(transport.state(), TransportState::Closed);
        // Sends after close are refused.
        let result = transport.send(Payload::Disconnect).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn attempt_limit_reaches_closed() {
        let config = TransportConfig {
            reconnect: crate::config::ReconnectConfig {
                initial_delay: std::time::Duration::from_millis(1),
                max_attempts: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut transport = ClientTransport::connect("ws://127.0.0.1:1/ws", config);
        assert!(
            transport
                .wait_for(TransportState::Closed, std::time::Duration::from_secs(5))
                .await,
            "attempt limit should close the transport"
        );
    }
}
