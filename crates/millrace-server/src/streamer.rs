//! Query streaming.
//!
//! One [`QueryStreamer`] bridges the external generator to the registry.
//! Each accepted query becomes a spawned, cancellable job emitting the
//! protocol sequence `query_start`, zero or more `chunk`s, then exactly one
//! terminal (`complete` or `error`) — never both, and never a `chunk` after
//! the terminal. [`JobProgress`] makes that invariant a checked state
//! instead of a convention.
//!
//! Cancellation (explicit `disconnect`, or session eviction) stops the job
//! without a terminal frame: no connection exists to receive one, and the
//! generator is released by dropping its stream.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use millrace_core::generator::Generator;
use millrace_core::ids::{QueryId, SessionId};
use millrace_core::message::Frame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::metrics::{CHUNKS_TOTAL, JOBS_ACTIVE, JOB_DURATION_SECONDS, QUERIES_TOTAL};
use crate::registry::ConnectionRegistry;

// ─────────────────────────────────────────────────────────────────────────────
// JobProgress — terminal-state guard
// ─────────────────────────────────────────────────────────────────────────────

/// A frame was emitted out of protocol order for one job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolViolation;

/// Tracks one job's position in the `query_start → chunk* → terminal`
/// sequence. A `chunk` or second terminal after the terminal frame is a
/// generator-contract violation: fatal to this job only.
#[derive(Debug, Default)]
pub struct JobProgress {
    chunks: u64,
    terminated: bool,
}

impl JobProgress {
    /// Fresh progress for a newly started job.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a chunk emission.
    pub fn chunk(&mut self) -> Result<(), ProtocolViolation> {
        if self.terminated {
            return Err(ProtocolViolation);
        }
        self.chunks += 1;
        Ok(())
    }

    /// Record the terminal emission.
    pub fn terminate(&mut self) -> Result<(), ProtocolViolation> {
        if self.terminated {
            return Err(ProtocolViolation);
        }
        self.terminated = true;
        Ok(())
    }

    /// Chunks emitted so far.
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        self.chunks
    }

    /// Whether the terminal frame has been emitted.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// QueryStreamer
// ─────────────────────────────────────────────────────────────────────────────

/// Starts and supervises one stream job per accepted query.
pub struct QueryStreamer {
    registry: Arc<ConnectionRegistry>,
    generator: Arc<dyn Generator>,
}

impl QueryStreamer {
    /// Create a streamer bound to a registry and generator.
    pub fn new(registry: Arc<ConnectionRegistry>, generator: Arc<dyn Generator>) -> Self {
        Self {
            registry,
            generator,
        }
    }

    /// Start streaming `query_text` for `query_id` on `session_id`.
    ///
    /// Returns `false` when a job for that query is already in flight on
    /// the session — re-submission is ignored, not queued.
    pub async fn start(
        &self,
        session_id: SessionId,
        query_id: QueryId,
        query_text: String,
    ) -> bool {
        let Some(cancel) = self.registry.begin_job(&session_id, &query_id).await else {
            debug!(
                session_id = %session_id,
                query_id = %query_id,
                "query already in flight, ignoring re-submission"
            );
            return false;
        };

        counter!(QUERIES_TOTAL).increment(1);
        let registry = Arc::clone(&self.registry);
        let generator = Arc::clone(&self.generator);
        let _ = tokio::spawn(run_job(
            registry,
            generator,
            session_id,
            query_id,
            query_text,
            cancel,
        ));
        true
    }
}

/// Outcome of one stream job, used as the duration histogram label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
    Violated,
}

impl JobOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Violated => "violated",
        }
    }
}

#[instrument(skip_all, fields(session_id = %session_id, query_id = %query_id))]
async fn run_job(
    registry: Arc<ConnectionRegistry>,
    generator: Arc<dyn Generator>,
    session_id: SessionId,
    query_id: QueryId,
    query_text: String,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    gauge!(JOBS_ACTIVE).increment(1.0);

    registry
        .send(
            &session_id,
            &Frame::query_start(session_id.clone(), query_id.clone()),
        )
        .await;

    let mut progress = JobProgress::new();
    let outcome = match generator.generate(&query_text).await {
        Err(e) => {
            warn!(engine = generator.name(), error = %e, "generator refused query");
            emit_error_terminal(&registry, &session_id, &query_id, &mut progress, &e.to_string())
                .await;
            JobOutcome::Failed
        }
        Ok(mut stream) => loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    // No terminal frame: nothing is attached to receive it.
                    debug!(chunks = progress.chunk_count(), "job cancelled mid-stream");
                    break JobOutcome::Cancelled;
                }
                item = stream.next() => match item {
                    Some(Ok(fragment)) => {
                        if progress.chunk().is_err() {
                            error!("generator produced a fragment after the terminal frame");
                            break JobOutcome::Violated;
                        }
                        counter!(CHUNKS_TOTAL).increment(1);
                        registry
                            .send(
                                &session_id,
                                &Frame::chunk(session_id.clone(), query_id.clone(), fragment),
                            )
                            .await;
                    }
                    Some(Err(e)) => {
                        warn!(engine = generator.name(), error = %e, "generator failed mid-stream");
                        emit_error_terminal(
                            &registry,
                            &session_id,
                            &query_id,
                            &mut progress,
                            &e.to_string(),
                        )
                        .await;
                        break JobOutcome::Failed;
                    }
                    None => {
                        if progress.terminate().is_ok() {
                            registry
                                .send(
                                    &session_id,
                                    &Frame::complete(session_id.clone(), query_id.clone()),
                                )
                                .await;
                        }
                        break JobOutcome::Completed;
                    }
                }
            }
        },
    };

    if outcome == JobOutcome::Violated {
        emit_error_terminal(
            &registry,
            &session_id,
            &query_id,
            &mut progress,
            "generator protocol violation",
        )
        .await;
    }

    registry.finish_job(&session_id, &query_id).await;
    gauge!(JOBS_ACTIVE).decrement(1.0);
    histogram!(JOB_DURATION_SECONDS, "outcome" => outcome.as_str())
        .record(started.elapsed().as_secs_f64());
    debug!(
        outcome = outcome.as_str(),
        chunks = progress.chunk_count(),
        "stream job finished"
    );
}

/// Emit the `error` terminal frame, respecting the at-most-one-terminal
/// guard.
async fn emit_error_terminal(
    registry: &ConnectionRegistry,
    session_id: &SessionId,
    query_id: &QueryId,
    progress: &mut JobProgress,
    message: &str,
) {
    if progress.terminate().is_err() {
        error!("suppressed second terminal frame for job");
        return;
    }
    registry
        .send(
            session_id,
            &Frame::error(
                Some(session_id.clone()),
                Some(query_id.clone()),
                message,
            ),
        )
        .await;
}
