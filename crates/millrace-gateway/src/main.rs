//! millrace gateway binary.
//!
//! Starts the WebSocket gateway with the demo generator so the streaming
//! path can be exercised end-to-end without a real text engine. Swap
//! [`demo::DemoGenerator`] for a production [`millrace_core::Generator`]
//! implementation to go live.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use millrace_server::config::ServerConfig;
use millrace_server::server::MillraceServer;

mod demo;

/// Streaming query gateway.
#[derive(Debug, Parser)]
#[command(name = "millrace-gateway", version)]
struct Args {
    /// Host to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 = auto-assign).
    #[arg(long, default_value_t = 9600)]
    port: u16,

    /// Frames retained per session for reconnect replay.
    #[arg(long, default_value_t = 100)]
    buffer_size: usize,

    /// Seconds a session may sit with no connections before eviction.
    #[arg(long, default_value_t = 60)]
    idle_grace_secs: u64,

    /// Delay between demo-generator fragments, in milliseconds.
    #[arg(long, default_value_t = 40)]
    demo_delay_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let metrics_handle = millrace_server::metrics::install_recorder();

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        session_buffer_size: args.buffer_size,
        idle_grace_secs: args.idle_grace_secs,
        ..ServerConfig::default()
    };

    let generator = Arc::new(demo::DemoGenerator::new(Duration::from_millis(
        args.demo_delay_ms,
    )));
    let server = MillraceServer::new(config, generator).with_metrics(metrics_handle);

    let (addr, handle) = server.listen().await.expect("failed to start server");
    tracing::info!(%addr, "millrace gateway ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
    server
        .shutdown()
        .graceful_shutdown(vec![handle], None)
        .await;
}
