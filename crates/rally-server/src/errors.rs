//! Server error types.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the listen socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Any other I/O failure.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
