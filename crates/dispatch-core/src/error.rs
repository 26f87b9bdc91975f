//! Core error types.

use crate::models::DeliveryStatus;
use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Endpoint URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Endpoint URL parsed but is not usable as a webhook target
    #[error("Unsupported endpoint URL: {0}")]
    UnsupportedUrl(String),

    /// A persisted value does not map onto the domain model
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// State machine transition not allowed from the current status
    #[error("Cannot {action} a {from} delivery")]
    InvalidTransition {
        from: DeliveryStatus,
        action: &'static str,
    },

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
