//! Broker error types.

use thiserror::Error;

/// Broker error type.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Broker cannot accept or deliver messages right now
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Unexpected response shape from the broker
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Message body could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BrokerError {
    /// Whether a fresh connection might fix this error.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            Self::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Result type alias using BrokerError.
pub type BrokerResult<T> = Result<T, BrokerError>;
