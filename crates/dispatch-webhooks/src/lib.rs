//! Outbound webhook delivery.
//!
//! - [`DeliveryCreator`] turns domain events into one pending delivery per
//!   enabled endpoint
//! - [`DeliveryScheduler`] enqueues delivery attempts, now or after a delay
//! - [`DeliveryExecutor`] performs the signed POST and drives the delivery
//!   state machine (retry with backoff, fail, dead-letter)
//! - [`DueRetrySweeper`] re-enqueues anything due that a timer or crash lost
//! - [`DeliveryReplayer`] resets a delivery for another round of attempts
//!
//! Every state change is persisted together with a
//! `webhook.delivery_updated` outbox event.

mod consumer;
mod creator;
mod error;
mod executor;
mod replay;
mod scheduler;
mod sender;
mod sweeper;

#[cfg(test)]
mod tests;

pub use creator::DeliveryCreator;
pub use error::{WebhookError, WebhookResult};
pub use executor::{DeliveryExecutor, ProcessOutcome, DUE_TOLERANCE_MS};
pub use replay::{reset_delivery, DeliveryReplayer, ReplayedDelivery};
pub use scheduler::DeliveryScheduler;
pub use sender::{ReqwestTransport, WebhookRequest, WebhookTransport, USER_AGENT};
pub use sweeper::{DueRetrySweeper, SweepReport};
