//! RPC error types.
//!
//! [`HandlerError`] is what a local function returns; it always travels back
//! to the caller as an error `Response`. [`CallError`] is what a local caller
//! of a remote function observes.

use thiserror::Error;

/// Message used when a handler error carries no text.
pub const UNKNOWN_ERROR: &str = "Unknown Error";

/// Error raised by a registered function.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// No function is registered under the requested name.
    #[error("Method '{method}' not found")]
    MethodNotFound {
        /// Requested method name.
        method: String,
    },

    /// The function requires an authenticated (or admin) connection.
    #[error("Not authorized")]
    NotAuthorized,

    /// Arguments missing or of the wrong shape.
    #[error("{message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// Any other failure, with the message passed through to the caller.
    #[error("{message}")]
    Failed {
        /// Human-readable message; may be empty.
        message: String,
    },
}

impl HandlerError {
    /// Failure with a free-form message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Invalid-params failure.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Text sent in the error `Response`; falls back to [`UNKNOWN_ERROR`].
    pub fn wire_message(&self) -> String {
        let message = self.to_string();
        if message.is_empty() {
            UNKNOWN_ERROR.to_owned()
        } else {
            message
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_params(err.to_string())
    }
}

/// Error observed by the caller of a remote function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The remote function failed; carries the remote message verbatim.
    #[error("{message}")]
    Remote {
        /// Message supplied by the remote peer.
        message: String,
    },

    /// The connection closed while the call was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// No transport is currently attached.
    #[error("not connected")]
    NotConnected,

    /// Every call id for this connection has been used.
    #[error("call ids exhausted for this connection")]
    IdsExhausted,
}

impl CallError {
    /// Build a remote error from a response `result` payload.
    pub fn from_result(result: &serde_json::Value) -> Self {
        let message = match result {
            serde_json::Value::String(s) if !s.is_empty() => s.clone(),
            serde_json::Value::Null | serde_json::Value::String(_) => UNKNOWN_ERROR.to_owned(),
            other => other.to_string(),
        };
        Self::Remote { message }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
