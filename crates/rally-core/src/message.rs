//! Protocol messages exchanged by both peers.
//!
//! Every frame carries exactly one [`Message`], discriminated by its `kind`
//! field:
//!
//! ```text
//! Call:     { kind: "rpc",         id, method, params: [...] }
//! Response: { kind: "rpcResponse", id, result, error?: bool }
//! Event:    { kind: "rpcEvent",    method, params: [...] }
//! Ping:     { kind: "ping" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Message {
    /// Request awaiting exactly one correlated [`Message::Response`].
    #[serde(rename = "rpc")]
    Call {
        /// Per-connection call identifier.
        id: u32,
        /// Name of the remote function.
        method: String,
        /// Positional arguments.
        #[serde(default)]
        params: Vec<Value>,
    },

    /// Reply to a prior [`Message::Call`] with the same `id`.
    #[serde(rename = "rpcResponse")]
    Response {
        /// Identifier of the call being answered.
        id: u32,
        /// Handler result, or the error message when `is_error` is set.
        #[serde(default)]
        result: Value,
        /// Whether `result` carries an error message.
        #[serde(rename = "error", default, skip_serializing_if = "is_false")]
        is_error: bool,
    },

    /// Fire-and-forget notification.
    #[serde(rename = "rpcEvent")]
    Event {
        /// Event name.
        method: String,
        /// Positional arguments.
        #[serde(default)]
        params: Vec<Value>,
    },

    /// Liveness probe. The client answers a server `Ping` with its own `Ping`.
    #[serde(rename = "ping")]
    Ping,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

impl Message {
    /// Build a call message.
    pub fn call(id: u32, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Call {
            id,
            method: method.into(),
            params,
        }
    }

    /// Build a successful response.
    pub fn success(id: u32, result: Value) -> Self {
        Self::Response {
            id,
            result,
            is_error: false,
        }
    }

    /// Build an error response carrying `message` as its result.
    pub fn failure(id: u32, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            result: Value::String(message.into()),
            is_error: true,
        }
    }

    /// Build an event message.
    pub fn event(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Event {
            method: method.into(),
            params,
        }
    }

    /// Wire name of this message's `kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Call { .. } => "rpc",
            Self::Response { .. } => "rpcResponse",
            Self::Event { .. } => "rpcEvent",
            Self::Ping => "ping",
        }
    }
}
