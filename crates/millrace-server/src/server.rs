//! `MillraceServer` — Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use millrace_core::generator::Generator;
use millrace_core::ids::SessionId;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;
use crate::session;
use crate::shutdown::ShutdownCoordinator;
use crate::streamer::QueryStreamer;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session table with buffered fan-out.
    pub registry: Arc<ConnectionRegistry>,
    /// Inbound frame dispatch.
    pub router: Arc<MessageRouter>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The millrace gateway server.
pub struct MillraceServer {
    state: AppState,
}

impl MillraceServer {
    /// Create a server over `generator`.
    pub fn new(config: ServerConfig, generator: Arc<dyn Generator>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.session_buffer_size));
        let streamer = Arc::new(QueryStreamer::new(Arc::clone(&registry), generator));
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry), streamer));

        Self {
            state: AppState {
                registry,
                router,
                config: Arc::new(config),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                start_time: Instant::now(),
                metrics: None,
            },
        }
    }

    /// Attach a Prometheus handle so `/metrics` renders.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve. Returns the bound address and the serve task.
    ///
    /// Also starts the registry sweeper; both stop when the shutdown
    /// coordinator fires.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let config = &self.state.config;
        let _sweeper = ConnectionRegistry::start_sweeper(
            Arc::clone(&self.state.registry),
            config.sweep_interval(),
            config.idle_grace(),
            config.stale_connection(),
            self.state.shutdown.token(),
        );

        let addr = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        let router = self.router();
        let shutdown = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned());
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "server exited with error");
            }
        });

        tracing::info!(addr = %local_addr, "millrace server listening");
        Ok((local_addr, handle))
    }

    /// Get the registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

/// Query parameters accepted on the `/ws` upgrade.
#[derive(Debug, Deserialize)]
struct WsParams {
    /// Prior session to resume; triggers buffered-frame replay.
    session_id: Option<String>,
}

/// GET /ws — WebSocket upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let requested = params.session_id.map(SessionId::from);
    let max_message_size = state.config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| session::run_ws_session(socket, requested, state))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.registry.connection_count().await;
    let sessions = state.registry.session_count();
    Json(health::health_check(state.start_time, connections, sessions))
}

/// GET /metrics — Prometheus text format, 404 when no recorder installed.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use millrace_core::errors::GeneratorError;
    use millrace_core::generator::FragmentStream;
    use tower::ServiceExt;

    struct NullGenerator;

    #[async_trait]
    impl Generator for NullGenerator {
        fn name(&self) -> &str {
            "null"
        }

        async fn generate(&self, _query: &str) -> Result<FragmentStream, GeneratorError> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    fn make_server() -> MillraceServer {
        MillraceServer::new(ServerConfig::default(), Arc::new(NullGenerator))
    }

    #[tokio::test]
    async fn server_with_default_config() {
        let server = make_server();
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 0);
    }

    #[test]
    fn shutdown_coordinator_accessible() {
        let server = make_server();
        assert!(!server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["active_sessions"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_404_without_recorder() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_auto_port() {
        let server = make_server();
        let (addr, _handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
    }
}
