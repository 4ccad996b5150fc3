//! Pool error types.

use kv_connection::ConnectionError;
use thiserror::Error;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No connection became available within the acquisition timeout.
    #[error("No connection available.")]
    AcquisitionTimeout(std::time::Duration),

    /// Pool is closed.
    #[error("pool is closed")]
    PoolClosed,

    /// The connection factory failed to build a connection.
    #[error("failed to create connection: {0}")]
    Connection(#[from] ConnectionError),

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Check if this error is transient and may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AcquisitionTimeout(_) => true,
            Self::Connection(err) => err.is_transient(),
            Self::PoolClosed | Self::Configuration(_) => false,
        }
    }
}
