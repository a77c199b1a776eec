//! # rally-rpc
//!
//! The call/response correlation engine shared by the client and server roles.
//!
//! - [`MethodRegistry`]: named functions the remote peer may call
//! - [`ListenerRegistry`]: named event listeners with stable removal handles
//! - [`PendingCalls`]: id allocation and response matching for outbound calls
//! - [`RpcPeer`]: one connection's view of all three, bound to an [`Outbox`]
//!
//! [`Outbox`]: rally_core::Outbox

#![deny(unsafe_code)]

pub mod errors;
pub mod handler;
pub mod listeners;
pub mod metrics;
pub mod params;
pub mod peer;
pub mod pending;
pub mod registry;

pub use errors::{CallError, HandlerError, UNKNOWN_ERROR};
pub use handler::{FnHandler, MethodHandler, handler_fn};
pub use listeners::{Listener, ListenerId, ListenerRegistry};
pub use peer::{Inbound, RpcPeer};
pub use pending::PendingCalls;
pub use registry::MethodRegistry;
