//! Webhook delivery error types.

use thiserror::Error;

/// Webhook delivery error type.
#[derive(Error, Debug)]
pub enum WebhookError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] dispatch_database::DatabaseError),

    /// Broker error
    #[error("Broker error: {0}")]
    Broker(#[from] dispatch_broker::BrokerError),

    /// Illegal state transition or invalid domain value
    #[error(transparent)]
    Core(#[from] dispatch_core::CoreError),

    /// Message body did not decode
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Delivery not found (or owned by another tenant)
    #[error("Delivery not found: {0}")]
    NotFound(String),

    /// The row changed between read and conditional write
    #[error("Delivery {0} was modified concurrently")]
    Conflict(String),

    /// HTTP client could not be built
    #[error("HTTP error: {0}")]
    Http(String),
}

impl WebhookError {
    /// Errors that will repeat no matter how often the message is redelivered.
    pub fn is_poison(&self) -> bool {
        matches!(self, Self::Json(_) | Self::Core(_))
    }
}

/// Result type alias using WebhookError.
pub type WebhookResult<T> = Result<T, WebhookError>;
