//! Prometheus metrics recorder and metric name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Live sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Queries accepted total (counter).
pub const QUERIES_TOTAL: &str = "queries_total";
/// In-flight stream jobs (gauge).
pub const JOBS_ACTIVE: &str = "jobs_active";
/// Chunks fanned out total (counter).
pub const CHUNKS_TOTAL: &str = "chunks_total";
/// Stream job duration seconds (histogram, labels: outcome).
pub const JOB_DURATION_SECONDS: &str = "job_duration_seconds";
/// Frame copies dropped on full send queues (counter).
pub const SEND_DROPS_TOTAL: &str = "send_drops_total";
/// Session buffer evictions total (counter).
pub const BUFFER_EVICTIONS_TOTAL: &str = "buffer_evictions_total";
/// Routing errors answered total (counter).
pub const ROUTING_ERRORS_TOTAL: &str = "routing_errors_total";
