//! SQLite store for the dispatch service.
//!
//! This crate provides:
//! - [`AsyncDatabase`], an async executor over a dedicated SQLite thread
//! - Versioned migrations for the `outbox_events`, `endpoints` and
//!   `deliveries` tables
//! - Query functions in [`queries`], all taking `&rusqlite::Connection`
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let batch = db.call(move |conn| queries::list_pending_outbox_events(conn, 100)).await?;
//! ```
//!
//! Only SQL runs inside `db.call()`. HTTP calls, broker publishes and JSON
//! work on large payloads happen outside.

mod error;
mod executor;
mod migrations;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use queries::DeliveryFilter;
