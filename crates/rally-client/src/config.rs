//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`RallyClient`](crate::RallyClient).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the server's `/ws` endpoint.
    pub url: String,
    /// Outbound frames queued before new ones are dropped.
    pub send_queue_capacity: usize,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl ClientConfig {
    /// Defaults pointed at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".into(),
            send_queue_capacity: 1024,
            connect_timeout_ms: 10_000,
        }
    }
}
