//! # rally-client
//!
//! Client role of the Rally protocol.
//!
//! - [`RallyClient`]: connect, call server functions, emit events, register
//!   functions the server may call, listen for server events
//! - Answers every protocol `Ping` with a `Ping` so the server's heartbeat
//!   sees it as alive
//! - [`RallyClient::reconnect`] swaps the transport while keeping registered
//!   functions, listeners, and the call id sequence

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod errors;

pub use client::RallyClient;
pub use config::ClientConfig;
pub use errors::ClientError;
