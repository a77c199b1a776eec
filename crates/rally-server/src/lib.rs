//! # rally-server
//!
//! Server role of the Rally protocol over Axum WebSockets.
//!
//! - [`RallyServer`]: routes (`/ws`, `/health`, `/metrics`), registration, listen
//! - [`websocket`]: per-connection lifecycle, heartbeat, and session loop
//! - [`GroupRegistry`]: topic membership with broadcast and "emptied" callbacks
//! - [`PresenceTracker`]: reference-counted online state per identity
//! - [`Context`]: what every server function and listener receives
//! - [`config`]: `ServerConfig` loading with file merge and `RALLY_*` overrides
//! - Graceful shutdown via [`ShutdownCoordinator`]

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod context;
pub mod errors;
pub mod groups;
pub mod health;
pub mod metrics;
pub mod presence;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod websocket;

pub use auth::{AuthVerifier, StaticTokenVerifier, verifier_fn};
pub use config::{ServerConfig, load_config};
pub use context::Context;
pub use errors::ServerError;
pub use groups::{GroupMember, GroupRegistry};
pub use presence::{PresenceError, PresenceSubscription, PresenceTracker};
pub use server::RallyServer;
pub use shutdown::ShutdownCoordinator;
pub use state::ServerState;
pub use websocket::connection::{Connection, ConnectionState, DisconnectReason};
