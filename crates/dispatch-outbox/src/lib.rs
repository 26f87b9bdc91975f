//! Transactional outbox drain.
//!
//! Domain writers stage events with
//! [`dispatch_database::queries::insert_outbox_event`] inside their own
//! transaction. [`OutboxDrainWorker`] moves them from the table onto the
//! broker, one topic per event type.

mod drain;
mod error;

pub use drain::{DrainReport, OutboxDrainWorker};
pub use error::{OutboxError, OutboxResult};
