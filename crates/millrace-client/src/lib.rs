//! # millrace-client
//!
//! The client half of the millrace streaming gateway: a reconnecting
//! `WebSocket` transport.
//!
//! - [`transport::ClientTransport`]: `Connecting → Open → Reconnecting →
//!   Closed` state machine driven by a single task — one owner for the
//!   socket, heartbeat timer, pong deadline, and backoff sleep
//! - [`queue::MessageQueue`]: outbound frames composed while offline,
//!   drained FIFO on (re)entering `Open`
//! - [`config::ReconnectConfig`]: exponential backoff with jitter

#![deny(unsafe_code)]

pub mod config;
pub mod queue;
pub mod transport;

pub use config::{ReconnectConfig, TransportConfig};
pub use queue::MessageQueue;
pub use transport::{ClientTransport, TransportEvent, TransportState};
