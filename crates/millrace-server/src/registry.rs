//! Session table with buffered fan-out.
//!
//! The registry is an explicit, constructed instance owned by the server
//! state — no ambient globals. Sessions live in a [`DashMap`] keyed by
//! [`SessionId`]; every per-session mutation (register, unregister, send,
//! job bookkeeping) serializes on that session's own `Mutex`, so ordering
//! within a session is preserved while independent sessions never contend.
//!
//! A session outlives its connections: when the last connection detaches
//! the entry is only stamped idle, and the sweep task evicts it after the
//! grace period — quick reconnects find their buffer intact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::{counter, gauge};
use millrace_core::ids::{ConnectionId, QueryId, SessionId};
use millrace_core::message::Frame;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::buffer::SessionBuffer;
use crate::connection::{Connection, Delivery};
use crate::metrics::{BUFFER_EVICTIONS_TOTAL, SEND_DROPS_TOTAL, SESSIONS_ACTIVE};

/// Mutable state for one session, guarded by its own lock.
struct SessionEntry {
    /// Currently-attached physical connections.
    connections: HashMap<ConnectionId, Arc<Connection>>,
    /// Replay buffer of recent outbound frames.
    buffer: SessionBuffer,
    /// Set when the last connection detaches; cleared on reattach.
    idle_since: Option<Instant>,
    /// Cancellation handles for in-flight stream jobs, keyed by query.
    jobs: HashMap<QueryId, CancellationToken>,
    /// Set by the sweeper just before the entry leaves the map. A racing
    /// register that still holds the old entry re-resolves instead of
    /// attaching to it.
    evicted: bool,
}

impl SessionEntry {
    fn new(buffer_capacity: usize) -> Self {
        Self {
            connections: HashMap::new(),
            buffer: SessionBuffer::new(buffer_capacity),
            idle_since: None,
            jobs: HashMap::new(),
            evicted: false,
        }
    }
}

/// Counters from one sweep pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Sessions evicted after exceeding the idle grace period.
    pub evicted_sessions: usize,
    /// Connections reaped for inbound silence.
    pub stale_connections: usize,
    /// Stream jobs cancelled alongside their evicted session.
    pub cancelled_jobs: usize,
}

/// Registry of sessions and their attached connections.
pub struct ConnectionRegistry {
    sessions: DashMap<SessionId, Arc<Mutex<SessionEntry>>>,
    buffer_capacity: usize,
}

impl ConnectionRegistry {
    /// Create a registry whose session buffers retain `buffer_capacity`
    /// frames.
    #[must_use]
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            buffer_capacity,
        }
    }

    fn get_entry(&self, session_id: &SessionId) -> Option<Arc<Mutex<SessionEntry>>> {
        self.sessions.get(session_id).map(|r| Arc::clone(&r))
    }

    fn get_or_create_entry(&self, session_id: &SessionId) -> Arc<Mutex<SessionEntry>> {
        if let Some(existing) = self.sessions.get(session_id) {
            return Arc::clone(&existing);
        }
        let created = Arc::new(Mutex::new(SessionEntry::new(self.buffer_capacity)));
        match self.sessions.entry(session_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(o) => Arc::clone(o.get()),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let _ = v.insert(Arc::clone(&created));
                gauge!(SESSIONS_ACTIVE).increment(1.0);
                created
            }
        }
    }

    /// Attach a connection to its session, creating the session if absent.
    ///
    /// Any buffered frames are replayed to the new connection, in original
    /// order, before it joins the live fan-out set — the
    /// reconnection-recovery guarantee. Replay goes through the
    /// connection's own queue while the session lock is held, so no live
    /// frame can interleave ahead of the backlog.
    pub async fn register(&self, connection: Arc<Connection>) {
        let session_id = connection.session_id.clone();
        loop {
            let entry = self.get_or_create_entry(&session_id);
            let mut session = entry.lock().await;
            if session.evicted {
                // Raced with the sweeper; the entry is leaving the map.
                continue;
            }
            session.idle_since = None;
            let mut replayed = 0usize;
            for frame in session.buffer.replay() {
                let _ = connection.send_raw(Arc::clone(frame));
                replayed += 1;
            }
            if replayed > 0 {
                debug!(
                    session_id = %session_id,
                    conn_id = %connection.id,
                    replayed,
                    "replayed buffered frames to reattaching connection"
                );
            }
            let _ = session
                .connections
                .insert(connection.id.clone(), connection);
            return;
        }
    }

    /// Detach a connection from its session.
    ///
    /// The session is not deleted even when this was its last connection;
    /// it is stamped idle and left for the sweeper, tolerating quick
    /// reconnects.
    pub async fn unregister(&self, session_id: &SessionId, connection_id: &ConnectionId) {
        let Some(entry) = self.get_entry(session_id) else {
            return;
        };
        let mut session = entry.lock().await;
        let _ = session.connections.remove(connection_id);
        if session.connections.is_empty() && session.idle_since.is_none() {
            session.idle_since = Some(Instant::now());
            debug!(session_id = %session_id, "session idle, awaiting reattach or eviction");
        }
    }

    /// Append a frame to the session's buffer and fan it out to every
    /// attached connection.
    ///
    /// A connection whose write task is gone is removed here — the
    /// implicit unregister; the failure never propagates to the caller.
    /// Frames for sessions that no longer exist are dropped.
    pub async fn send(&self, session_id: &SessionId, frame: &Frame) {
        let Some(entry) = self.get_entry(session_id) else {
            trace!(session_id = %session_id, kind = frame.payload.kind(), "no session, dropping frame");
            return;
        };
        let json = match frame.to_json() {
            Ok(j) => Arc::new(j),
            Err(e) => {
                tracing::error!(kind = frame.payload.kind(), error = %e, "failed to serialize frame");
                return;
            }
        };

        let mut session = entry.lock().await;
        if session.evicted {
            return;
        }
        let evicted_before = session.buffer.evicted_count();
        session.buffer.append(Arc::clone(&json));
        if session.buffer.evicted_count() > evicted_before {
            counter!(BUFFER_EVICTIONS_TOTAL).increment(1);
        }

        let mut dead = Vec::new();
        for conn in session.connections.values() {
            match conn.send_raw(Arc::clone(&json)) {
                Delivery::Delivered => {}
                Delivery::Dropped => {
                    counter!(SEND_DROPS_TOTAL).increment(1);
                    warn!(
                        session_id = %session_id,
                        conn_id = %conn.id,
                        "send queue full, dropping frame copy"
                    );
                }
                Delivery::Disconnected => dead.push(conn.id.clone()),
            }
        }
        for conn_id in dead {
            let _ = session.connections.remove(&conn_id);
            info!(session_id = %session_id, conn_id = %conn_id, "dead connection, implicit unregister");
        }
        if session.connections.is_empty() && session.idle_since.is_none() {
            session.idle_since = Some(Instant::now());
        }
    }

    /// Claim a stream-job slot for `query_id`.
    ///
    /// Returns the job's cancellation token, or `None` when a job for that
    /// query is already in flight on this session (idempotent
    /// re-submission is ignored, not queued).
    pub async fn begin_job(
        &self,
        session_id: &SessionId,
        query_id: &QueryId,
    ) -> Option<CancellationToken> {
        loop {
            let entry = self.get_or_create_entry(session_id);
            let mut session = entry.lock().await;
            if session.evicted {
                continue;
            }
            if session.jobs.contains_key(query_id) {
                return None;
            }
            let token = CancellationToken::new();
            let _ = session.jobs.insert(query_id.clone(), token.clone());
            return Some(token);
        }
    }

    /// Release the job slot for `query_id` after its terminal frame (or
    /// cancellation).
    pub async fn finish_job(&self, session_id: &SessionId, query_id: &QueryId) {
        if let Some(entry) = self.get_entry(session_id) {
            let _ = entry.lock().await.jobs.remove(query_id);
        }
    }

    /// Cancel every in-flight job on the session.
    pub async fn cancel_jobs(&self, session_id: &SessionId) -> usize {
        let Some(entry) = self.get_entry(session_id) else {
            return 0;
        };
        let mut session = entry.lock().await;
        let cancelled = session.jobs.len();
        for (query_id, token) in session.jobs.drain() {
            token.cancel();
            debug!(session_id = %session_id, query_id = %query_id, "stream job cancelled");
        }
        cancelled
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total attached connections across all sessions.
    pub async fn connection_count(&self) -> usize {
        let entries: Vec<_> = self.sessions.iter().map(|r| Arc::clone(&r)).collect();
        let mut count = 0;
        for entry in entries {
            count += entry.lock().await.connections.len();
        }
        count
    }

    /// One pass of housekeeping: reap connections with no inbound traffic
    /// for `stale_connection`, then evict sessions idle past `idle_grace`,
    /// cancelling any jobs they still own.
    pub async fn sweep(&self, idle_grace: Duration, stale_connection: Duration) -> SweepStats {
        let mut stats = SweepStats::default();
        let session_ids: Vec<SessionId> = self.sessions.iter().map(|r| r.key().clone()).collect();

        for session_id in session_ids {
            let Some(entry) = self.get_entry(&session_id) else {
                continue;
            };
            let mut session = entry.lock().await;
            if session.evicted {
                continue;
            }

            let stale: Vec<ConnectionId> = session
                .connections
                .values()
                .filter(|c| c.idle_for() > stale_connection)
                .map(|c| c.id.clone())
                .collect();
            for conn_id in stale {
                let _ = session.connections.remove(&conn_id);
                stats.stale_connections += 1;
                info!(session_id = %session_id, conn_id = %conn_id, "reaped stale connection");
            }

            if session.connections.is_empty() {
                let idle_since = *session.idle_since.get_or_insert_with(Instant::now);
                if idle_since.elapsed() >= idle_grace {
                    for (query_id, token) in session.jobs.drain() {
                        token.cancel();
                        stats.cancelled_jobs += 1;
                        debug!(session_id = %session_id, query_id = %query_id, "job cancelled with evicted session");
                    }
                    session.evicted = true;
                    let _ = self.sessions.remove(&session_id);
                    gauge!(SESSIONS_ACTIVE).decrement(1.0);
                    stats.evicted_sessions += 1;
                    info!(session_id = %session_id, "evicted idle session");
                }
            }
        }
        stats
    }

    /// Spawn the periodic sweep task. Exits when `cancel` fires.
    pub fn start_sweeper(
        registry: Arc<Self>,
        interval: Duration,
        idle_grace: Duration,
        stale_connection: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = registry.sweep(idle_grace, stale_connection).await;
                        if stats != SweepStats::default() {
                            info!(
                                evicted = stats.evicted_sessions,
                                stale = stats.stale_connections,
                                cancelled = stats.cancelled_jobs,
                                "registry sweep"
                            );
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_connection(
        conn: &str,
        session: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        let connection = Arc::new(Connection::new(
            ConnectionId::from(conn),
            SessionId::from(session),
            tx,
        ));
        (connection, rx)
    }

    fn chunk_frame(session: &str, query: &str, content: &str) -> Frame {
        Frame::chunk(SessionId::from(session), QueryId::from(query), content)
    }

    #[tokio::test]
    async fn register_creates_session() {
        let registry = ConnectionRegistry::new(10);
        let (conn, _rx) = make_connection("c1", "s1");
        registry.register(conn).await;
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn send_fans_out_to_all_session_connections() {
        let registry = ConnectionRegistry::new(10);
        let (c1, mut rx1) = make_connection("c1", "s1");
        let (c2, mut rx2) = make_connection("c2", "s1");
        let (c3, mut rx3) = make_connection("c3", "s2");
        registry.register(c1).await;
        registry.register(c2).await;
        registry.register(c3).await;

        registry
            .send(&SessionId::from("s1"), &chunk_frame("s1", "q1", "Hel"))
            .await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn reattach_replays_buffer_in_order() {
        let registry = ConnectionRegistry::new(10);
        let session = SessionId::from("s1");
        let (c1, mut rx1) = make_connection("c1", "s1");
        registry.register(c1).await;

        registry.send(&session, &chunk_frame("s1", "q1", "one")).await;
        registry.send(&session, &chunk_frame("s1", "q1", "two")).await;
        drop(rx1);
        registry
            .unregister(&session, &ConnectionId::from("c1"))
            .await;

        let (c2, mut rx2) = make_connection("c2", "s1");
        registry.register(c2).await;

        let first = rx2.try_recv().unwrap();
        let second = rx2.try_recv().unwrap();
        assert!(first.contains("one"));
        assert!(second.contains("two"));
    }

    #[tokio::test]
    async fn replay_identical_for_two_simultaneous_connections() {
        let registry = ConnectionRegistry::new(10);
        let session = SessionId::from("s1");
        let (c1, mut rx1) = make_connection("c1", "s1");
        registry.register(c1).await;
        registry.send(&session, &chunk_frame("s1", "q1", "Hel")).await;
        registry.send(&session, &chunk_frame("s1", "q1", "lo")).await;
        drop(rx1);
        registry
            .unregister(&session, &ConnectionId::from("c1"))
            .await;

        let (c2, mut rx2) = make_connection("c2", "s1");
        let (c3, mut rx3) = make_connection("c3", "s1");
        registry.register(c2).await;
        registry.register(c3).await;

        let tab_a: Vec<String> = std::iter::from_fn(|| rx2.try_recv().ok())
            .map(|f| f.to_string())
            .collect();
        let tab_b: Vec<String> = std::iter::from_fn(|| rx3.try_recv().ok())
            .map(|f| f.to_string())
            .collect();
        assert_eq!(tab_a.len(), 2);
        assert_eq!(tab_a, tab_b);
    }

    #[tokio::test]
    async fn dead_connection_implicitly_unregistered_on_send() {
        let registry = ConnectionRegistry::new(10);
        let (c1, rx1) = make_connection("c1", "s1");
        registry.register(c1).await;
        drop(rx1); // write task gone

        registry
            .send(&SessionId::from("s1"), &chunk_frame("s1", "q1", "x"))
            .await;
        assert_eq!(registry.connection_count().await, 0);
        // Session itself survives for the grace period.
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn unregister_last_connection_keeps_session() {
        let registry = ConnectionRegistry::new(10);
        let (c1, _rx) = make_connection("c1", "s1");
        registry.register(c1).await;
        registry
            .unregister(&SessionId::from("s1"), &ConnectionId::from("c1"))
            .await;
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn send_to_unknown_session_is_dropped() {
        let registry = ConnectionRegistry::new(10);
        registry
            .send(&SessionId::from("ghost"), &chunk_frame("ghost", "q", "x"))
            .await;
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn begin_job_idempotent_per_query() {
        let registry = ConnectionRegistry::new(10);
        let session = SessionId::from("s1");
        let query = QueryId::from("q1");

        let first = registry.begin_job(&session, &query).await;
        assert!(first.is_some());
        let second = registry.begin_job(&session, &query).await;
        assert!(second.is_none(), "in-flight query must not start twice");

        registry.finish_job(&session, &query).await;
        let third = registry.begin_job(&session, &query).await;
        assert!(third.is_some(), "finished query may be resubmitted");
    }

    #[tokio::test]
    async fn cancel_jobs_fires_tokens() {
        let registry = ConnectionRegistry::new(10);
        let session = SessionId::from("s1");
        let t1 = registry
            .begin_job(&session, &QueryId::from("q1"))
            .await
            .unwrap();
        let t2 = registry
            .begin_job(&session, &QueryId::from("q2"))
            .await
            .unwrap();

        let cancelled = registry.cancel_jobs(&session).await;
        assert_eq!(cancelled, 2);
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn sweep_evicts_idle_session_and_cancels_jobs() {
        let registry = ConnectionRegistry::new(10);
        let session = SessionId::from("s1");
        let (c1, _rx) = make_connection("c1", "s1");
        registry.register(c1).await;
        let token = registry
            .begin_job(&session, &QueryId::from("q1"))
            .await
            .unwrap();
        registry
            .unregister(&session, &ConnectionId::from("c1"))
            .await;

        // Grace not yet expired: nothing happens.
        let stats = registry
            .sweep(Duration::from_secs(60), Duration::from_secs(60))
            .await;
        assert_eq!(stats.evicted_sessions, 0);
        assert_eq!(registry.session_count(), 1);

        // Zero grace: evicted, job cancelled.
        let stats = registry
            .sweep(Duration::ZERO, Duration::from_secs(60))
            .await;
        assert_eq!(stats.evicted_sessions, 1);
        assert_eq!(stats.cancelled_jobs, 1);
        assert!(token.is_cancelled());
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn sweep_spares_connected_sessions() {
        let registry = ConnectionRegistry::new(10);
        let (c1, _rx) = make_connection("c1", "s1");
        registry.register(c1).await;

        let stats = registry
            .sweep(Duration::ZERO, Duration::from_secs(60))
            .await;
        assert_eq!(stats.evicted_sessions, 0);
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn sweep_reaps_stale_connections() {
        let registry = ConnectionRegistry::new(10);
        let (c1, _rx) = make_connection("c1", "s1");
        registry.register(c1).await;

        let stats = registry
            .sweep(Duration::from_secs(60), Duration::ZERO)
            .await;
        assert_eq!(stats.stale_connections, 1);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn reattach_after_eviction_starts_fresh() {
        let registry = ConnectionRegistry::new(10);
        let session = SessionId::from("s1");
        let (c1, mut rx1) = make_connection("c1", "s1");
        registry.register(c1).await;
        registry.send(&session, &chunk_frame("s1", "q1", "old")).await;
        let _ = rx1.try_recv();
        drop(rx1);
        registry
            .unregister(&session, &ConnectionId::from("c1"))
            .await;
        let _ = registry
            .sweep(Duration::ZERO, Duration::from_secs(60))
            .await;

        let (c2, mut rx2) = make_connection("c2", "s1");
        registry.register(c2).await;
        assert!(
            rx2.try_recv().is_err(),
            "evicted session's buffer must not replay"
        );
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn buffer_respects_capacity_through_send() {
        let registry = ConnectionRegistry::new(2);
        let session = SessionId::from("s1");
        let (c1, mut rx1) = make_connection("c1", "s1");
        registry.register(c1).await;
        for content in ["a", "b", "c"] {
            registry
                .send(&session, &chunk_frame("s1", "q1", content))
                .await;
        }
        while rx1.try_recv().is_ok() {}
        drop(rx1);
        registry
            .unregister(&session, &ConnectionId::from("c1"))
            .await;

        let (c2, mut rx2) = make_connection("c2", "s1");
        registry.register(c2).await;
        let replayed: Vec<String> = std::iter::from_fn(|| rx2.try_recv().ok())
            .map(|f| f.to_string())
            .collect();
        assert_eq!(replayed.len(), 2);
        assert!(replayed[0].contains('b'));
        assert!(replayed[1].contains('c'));
    }
}
