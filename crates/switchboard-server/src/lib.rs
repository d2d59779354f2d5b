//! # switchboard-server
//!
//! Topic-routed message dispatch over full-duplex WebSocket connections.
//!
//! - [`registry`]: topic → handler mapping, type-erased at registration
//! - [`dispatcher`]: per-connection read-dispatch loop with hooks and error callback
//! - [`connection`]: connection state, value store and serialized outbound writes
//! - [`transport`]: frame reader/writer seam with WebSocket and in-memory halves
//! - [`server`]: axum router (GET-only upgrade, origin check, health, metrics)
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use config::ServerConfig;
pub use connection::{Connection, Request, RequestMetadata};
pub use dispatcher::{Dispatcher, DispatcherBuilder, ErrorHandler, Hook, SessionEnd};
pub use registry::{HandlerDescriptor, TopicRegistry};
pub use server::SwitchboardServer;
pub use shutdown::ShutdownCoordinator;
