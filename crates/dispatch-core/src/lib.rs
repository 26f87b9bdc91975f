//! Core types, configuration, and pure policies for the dispatch service.
//!
//! Everything here is free of I/O except the worker lifecycle handle:
//!
//! - [`models`]: outbox events, endpoints, deliveries and their state machine
//! - [`events`]: event type names and broker message bodies
//! - [`signer`]: timestamped HMAC-SHA256 webhook signatures
//! - [`backoff`]: capped exponential retry delays
//! - [`retry`]: classification of an HTTP attempt outcome
//! - [`task`]: start/stop handles for background loops

pub mod backoff;
mod config;
mod error;
pub mod events;
pub mod models;
pub mod retry;
pub mod signer;
pub mod task;

pub use backoff::{
    compute_backoff, compute_backoff_duration, compute_backoff_ms, BACKOFF_BASE_MS, BACKOFF_CAP_MS,
};
pub use config::{parse_endpoint_url, DispatchConfig, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use events::{DeliverMessage, DeliveryUpdated, EventEnvelope, DELIVERY_UPDATED, DELIVER_TOPIC};
pub use models::{
    Delivery, DeliveryId, DeliveryState, DeliveryStatus, Endpoint, EndpointId, EventId,
    NewOutboxEvent, OutboxEvent, OutboxStatus, TenantId, MAX_ATTEMPTS,
};
pub use retry::{classify, should_retry, AttemptOutcome};
pub use task::{ShutdownSignal, WorkerHandle};
