//! Query helpers, grouped by table.
//!
//! Every function takes a plain `&Connection` so it can run inside
//! [`crate::AsyncDatabase::call`] or directly against a test connection.

mod deliveries;
mod endpoints;
mod outbox;

pub use deliveries::*;
pub use endpoints::*;
pub use outbox::*;

use crate::{DatabaseError, DatabaseResult};
use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width UTC timestamp, so text order is time order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(raw: &str) -> DatabaseResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DatabaseError::InvalidData(format!("invalid timestamp {raw:?}: {e}")))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> DatabaseResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

pub(crate) fn to_u32(value: i64, column: &str) -> DatabaseResult<u32> {
    u32::try_from(value)
        .map_err(|_| DatabaseError::InvalidData(format!("{column} out of range: {value}")))
}
