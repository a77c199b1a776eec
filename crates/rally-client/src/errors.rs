//! Client error types.

use rally_rpc::CallError;
use thiserror::Error;

/// Errors raised by [`RallyClient`](crate::RallyClient) connection management.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The WebSocket handshake failed.
    #[error("failed to connect to {url}: {source}")]
    Connect {
        /// Target URL.
        url: String,
        /// Underlying transport error.
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },
    /// The handshake did not finish within the connect timeout.
    #[error("timed out connecting to {url}")]
    Timeout {
        /// Target URL.
        url: String,
    },
    /// `connect` was called while a transport is open.
    #[error("already connected")]
    AlreadyConnected,
    /// A call failed.
    #[error(transparent)]
    Call(#[from] CallError),
}
