//! Connection error types.

use thiserror::Error;

/// Errors that can occur while building or using a connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// IO error on the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Establishing the transport took longer than the connect timeout.
    #[error("connection timed out")]
    ConnectTimeout,

    /// Waiting for a reply took longer than the read timeout.
    #[error("read timed out")]
    ReadTimeout,

    /// The server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid construction parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// The requested transport is not available on this platform.
    #[error("unsupported transport: {0}")]
    Unsupported(String),
}

impl ConnectionError {
    /// Check if this error is transient and may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout | Self::ReadTimeout | Self::ConnectionClosed | Self::Io(_)
        )
    }
}
