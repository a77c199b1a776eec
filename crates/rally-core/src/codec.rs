//! Message codec: structured [`Message`]s to transport frames and back.

use std::sync::Arc;

use crate::errors::CodecError;
use crate::message::Message;

/// An encoded text frame, shared between every recipient of a broadcast.
pub type Frame = Arc<String>;

/// Converts messages to frames and frames to messages.
///
/// The protocol core only depends on this trait; a decode failure is treated
/// by both peers as a transport error.
pub trait Codec: Send + Sync + 'static {
    /// Encode a message into a frame.
    fn encode(&self, message: &Message) -> Result<Frame, CodecError>;

    /// Decode a received payload (text or binary frame body).
    fn decode(&self, payload: &[u8]) -> Result<Message, CodecError>;
}

/// JSON codec: one JSON object per frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, message: &Message) -> Result<Frame, CodecError> {
        serde_json::to_string(message)
            .map(Arc::new)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<Message, CodecError> {
        serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
