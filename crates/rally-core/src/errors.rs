//! Codec error types.

use thiserror::Error;

/// Errors produced while converting between [`Message`](crate::Message)s and frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A message could not be serialized into a frame.
    #[error("failed to encode message: {0}")]
    Encode(String),
    /// A frame could not be parsed into a message.
    #[error("failed to decode frame: {0}")]
    Decode(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
