//! Outbound frame queue for a single transport.
//!
//! An [`Outbox`] is the sending half shared by everything that writes to one
//! connection (responses, events, broadcasts, pings). A writer task owns the
//! matching receiver and forwards frames to the socket until the outbox is
//! closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{Codec, Frame};
use crate::message::Message;

/// Cloneable sender of encoded frames with an explicit close signal.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Frame>,
    codec: Arc<dyn Codec>,
    closed: CancellationToken,
    dropped: Arc<AtomicU64>,
}

impl Outbox {
    /// Create an outbox with room for `capacity` queued frames.
    pub fn new(capacity: usize, codec: Arc<dyn Codec>) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outbox = Self {
            tx,
            codec,
            closed: CancellationToken::new(),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (outbox, rx)
    }

    /// Encode and enqueue a message.
    ///
    /// Returns `false` if encoding failed, the outbox is closed, or the queue
    /// is full. Never blocks. A [`Message::Response`] that cannot be queued
    /// closes the outbox: the remote caller would otherwise wait forever, so
    /// the transport is torn down instead.
    pub fn send(&self, message: &Message) -> bool {
        match self.codec.encode(message) {
            Ok(frame) => {
                if self.send_frame(frame) {
                    return true;
                }
                if !self.is_closed() {
                    if let Message::Response { id, .. } = message {
                        warn!(kind = message.kind(), id, "outbound queue full, closing");
                        self.close();
                    } else {
                        debug!(kind = message.kind(), "outbound queue full, message dropped");
                    }
                }
                false
            }
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "failed to encode outbound message");
                false
            }
        }
    }

    /// Enqueue an already-encoded frame.
    pub fn send_frame(&self, frame: Frame) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Encode a message once so it can be fanned out with [`Outbox::send_frame`].
    pub fn encode(&self, message: &Message) -> Option<Frame> {
        self.codec
            .encode(message)
            .inspect_err(|e| warn!(kind = message.kind(), error = %e, "failed to encode message"))
            .ok()
    }

    /// Signal the writer task to stop and reject further sends.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`Outbox::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the outbox closes.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Frames dropped because the queue was full or the writer had gone away.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Codec used to encode outbound messages.
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }
}
