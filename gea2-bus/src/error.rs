//! Bus error types.

use crate::config::ConfigError;
use gea2_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced to callers of bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request timeout")]
    Timeout,

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("bus closed")]
    Closed,

    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    /// Returns whether a fresh attempt of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::Timeout | BusError::Transport(_) | BusError::Closed
        )
    }
}
