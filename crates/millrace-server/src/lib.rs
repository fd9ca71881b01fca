//! # millrace-server
//!
//! The server half of the millrace streaming gateway.
//!
//! - `WebSocket` endpoint: one session per physical connection, with
//!   optional resume via `?session_id=`
//! - [`registry::ConnectionRegistry`]: session table with buffered fan-out
//!   and replay-on-reattach
//! - [`router::MessageRouter`]: exhaustive dispatch over inbound frames
//! - [`streamer::QueryStreamer`]: one cancellable task per query, bridging
//!   the external generator to the registry
//! - Graceful shutdown via `tokio_util::sync::CancellationToken`

#![deny(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod connection;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod streamer;

pub use config::ServerConfig;
pub use registry::ConnectionRegistry;
pub use router::MessageRouter;
pub use server::{AppState, MillraceServer};
pub use shutdown::ShutdownCoordinator;
pub use streamer::QueryStreamer;
