//! # rally-core
//!
//! Foundation types shared by both peers of the Rally protocol.
//!
//! - [`Message`]: the four wire variants (`rpc`, `rpcResponse`, `rpcEvent`, `ping`)
//! - [`Codec`] / [`JsonCodec`]: message ↔ frame conversion
//! - [`Outbox`]: bounded, closable queue of encoded frames for one transport
//! - [`ConnectionId`] and [`Identity`]: connection handles and authenticated users
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod identity;
pub mod ids;
pub mod logging;
pub mod message;
pub mod outbox;

pub use codec::{Codec, Frame, JsonCodec};
pub use errors::CodecError;
pub use identity::Identity;
pub use ids::ConnectionId;
pub use message::Message;
pub use outbox::Outbox;
