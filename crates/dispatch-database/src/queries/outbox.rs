//! Outbox event queries.

use super::{format_ts, parse_opt_ts, parse_ts, to_u32};
use crate::DatabaseResult;
use chrono::{DateTime, Utc};
use dispatch_core::{EventId, NewOutboxEvent, OutboxEvent, OutboxStatus, TenantId};
use rusqlite::{params, Connection, Row};

struct OutboxRow {
    id: String,
    tenant_id: String,
    event_type: String,
    payload: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: String,
    published_at: Option<String>,
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<OutboxRow> {
    Ok(OutboxRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        event_type: row.get(2)?,
        payload: row.get(3)?,
        status: row.get(4)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
        created_at: row.get(7)?,
        published_at: row.get(8)?,
    })
}

impl OutboxRow {
    fn into_event(self) -> DatabaseResult<OutboxEvent> {
        Ok(OutboxEvent {
            id: EventId::from(self.id),
            tenant_id: TenantId::from(self.tenant_id),
            event_type: self.event_type,
            payload: serde_json::from_str(&self.payload)?,
            status: self.status.parse::<OutboxStatus>()?,
            attempts: to_u32(self.attempts, "attempts")?,
            last_error: self.last_error,
            created_at: parse_ts(&self.created_at)?,
            published_at: parse_opt_ts(self.published_at)?,
        })
    }
}

/// Stage an event. Domain writers call this inside their own transaction.
pub fn insert_outbox_event(
    conn: &Connection,
    event: &NewOutboxEvent,
    now: DateTime<Utc>,
) -> DatabaseResult<OutboxEvent> {
    let payload = serde_json::to_string(&event.payload)?;
    conn.execute(
        "INSERT INTO outbox_events (id, tenant_id, event_type, payload, status, attempts, created_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)",
        params![
            event.id.as_str(),
            event.tenant_id.as_str(),
            event.event_type,
            payload,
            format_ts(now),
        ],
    )?;

    Ok(OutboxEvent {
        id: event.id.clone(),
        tenant_id: event.tenant_id.clone(),
        event_type: event.event_type.clone(),
        payload: event.payload.clone(),
        status: OutboxStatus::Pending,
        attempts: 0,
        last_error: None,
        created_at: now,
        published_at: None,
    })
}

/// Get an outbox event by ID.
pub fn get_outbox_event(conn: &Connection, id: &EventId) -> DatabaseResult<Option<OutboxEvent>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, tenant_id, event_type, payload, status, attempts, last_error, created_at, published_at
         FROM outbox_events WHERE id = ?1",
    )?;

    match stmt.query_row(params![id.as_str()], map_row) {
        Ok(row) => Ok(Some(row.into_event()?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Oldest pending events first, at most `limit`.
pub fn list_pending_outbox_events(
    conn: &Connection,
    limit: usize,
) -> DatabaseResult<Vec<OutboxEvent>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, tenant_id, event_type, payload, status, attempts, last_error, created_at, published_at
         FROM outbox_events
         WHERE status = 'pending'
         ORDER BY created_at ASC, rowid ASC
         LIMIT ?1",
    )?;

    let rows = stmt
        .query_map(params![limit as i64], map_row)?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(OutboxRow::into_event).collect()
}

/// Count events still waiting to be published.
pub fn count_pending_outbox_events(conn: &Connection) -> DatabaseResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox_events WHERE status = 'pending'",
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Mark a pending event published. The successful publish counts as an attempt.
///
/// Returns false if the event was not pending.
pub fn mark_outbox_event_published(
    conn: &Connection,
    id: &EventId,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_events
         SET status = 'published', attempts = attempts + 1, published_at = ?1
         WHERE id = ?2 AND status = 'pending'",
        params![format_ts(now), id.as_str()],
    )?;
    Ok(count > 0)
}

/// Record a failed publish; the event stays pending for the next drain.
pub fn record_outbox_publish_failure(
    conn: &Connection,
    id: &EventId,
    error: &str,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_events
         SET attempts = attempts + 1, last_error = ?1
         WHERE id = ?2 AND status = 'pending'",
        params![error, id.as_str()],
    )?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_insert_and_get() {
        let conn = setup();
        let now = Utc::now();
        let new = NewOutboxEvent::new("t-1", "order.created", json!({"orderId": "o-1"}));

        let inserted = insert_outbox_event(&conn, &new, now).unwrap();
        let loaded = get_outbox_event(&conn, &new.id).unwrap().unwrap();

        assert_eq!(loaded, inserted);
        assert_eq!(loaded.status, OutboxStatus::Pending);
        assert_eq!(loaded.payload["orderId"], "o-1");
        assert!(get_outbox_event(&conn, &EventId::from("missing")).unwrap().is_none());
    }

    #[test]
    fn test_list_pending_orders_by_creation_and_limits() {
        let conn = setup();
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let new = NewOutboxEvent::new("t-1", "order.updated", json!({"seq": i}));
            // Insert newest first to prove ordering comes from created_at.
            insert_outbox_event(&conn, &new, base - chrono::Duration::seconds(i)).unwrap();
            ids.push(new.id);
        }

        let batch = list_pending_outbox_events(&conn, 3).unwrap();
        let got: Vec<_> = batch.iter().map(|e| e.id.clone()).collect();
        assert_eq!(got, vec![ids[4].clone(), ids[3].clone(), ids[2].clone()]);
    }

    #[test]
    fn test_failure_then_publish_counts_attempts() {
        let conn = setup();
        let now = Utc::now();
        let new = NewOutboxEvent::new("t-1", "return.created", json!({}));
        insert_outbox_event(&conn, &new, now).unwrap();

        assert!(record_outbox_publish_failure(&conn, &new.id, "broker down").unwrap());
        assert!(record_outbox_publish_failure(&conn, &new.id, "broker down").unwrap());
        let pending = get_outbox_event(&conn, &new.id).unwrap().unwrap();
        assert_eq!(pending.attempts, 2);
        assert_eq!(pending.last_error.as_deref(), Some("broker down"));
        assert_eq!(count_pending_outbox_events(&conn).unwrap(), 1);

        assert!(mark_outbox_event_published(&conn, &new.id, now).unwrap());
        let published = get_outbox_event(&conn, &new.id).unwrap().unwrap();
        assert_eq!(published.status, OutboxStatus::Published);
        assert_eq!(published.attempts, 3);
        assert_eq!(published.published_at, Some(now));
        assert_eq!(count_pending_outbox_events(&conn).unwrap(), 0);
    }

    #[test]
    fn test_published_events_are_not_touched_again() {
        let conn = setup();
        let now = Utc::now();
        let new = NewOutboxEvent::new("t-1", "refund.issued", json!({}));
        insert_outbox_event(&conn, &new, now).unwrap();
        mark_outbox_event_published(&conn, &new.id, now).unwrap();

        assert!(!mark_outbox_event_published(&conn, &new.id, now).unwrap());
        assert!(!record_outbox_publish_failure(&conn, &new.id, "late").unwrap());
        assert!(list_pending_outbox_events(&conn, 10).unwrap().is_empty());
    }
}
