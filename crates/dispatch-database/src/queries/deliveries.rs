//! Delivery queries.
//!
//! State changes go through [`update_delivery_state`], a single-row
//! conditional update keyed on the status and attempt count the caller last
//! saw. A `false` return means another worker moved the delivery first.

use super::{format_ts, insert_outbox_event, parse_opt_ts, parse_ts, to_u32};
use crate::{DatabaseError, DatabaseResult};
use chrono::{DateTime, Utc};
use dispatch_core::{
    Delivery, DeliveryId, DeliveryState, DeliveryStatus, DeliveryUpdated, EndpointId, EventId,
    NewOutboxEvent, TenantId, DELIVERY_UPDATED,
};
use rusqlite::{params, Connection, Row};

/// Default page size for [`list_deliveries`].
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Tenant-scoped listing filter with limit/offset paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFilter {
    pub tenant_id: TenantId,
    pub status: Option<DeliveryStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl DeliveryFilter {
    pub fn for_tenant(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            status: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }

    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

struct DeliveryRow {
    id: String,
    tenant_id: String,
    endpoint_id: String,
    event_id: String,
    event_type: String,
    payload: String,
    status: String,
    attempts: i64,
    response_status: Option<i64>,
    last_error: Option<String>,
    next_attempt_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<DeliveryRow> {
    Ok(DeliveryRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        endpoint_id: row.get(2)?,
        event_id: row.get(3)?,
        event_type: row.get(4)?,
        payload: row.get(5)?,
        status: row.get(6)?,
        attempts: row.get(7)?,
        response_status: row.get(8)?,
        last_error: row.get(9)?,
        next_attempt_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl DeliveryRow {
    fn into_delivery(self) -> DatabaseResult<Delivery> {
        let response_status = self
            .response_status
            .map(|s| {
                u16::try_from(s).map_err(|_| {
                    DatabaseError::InvalidData(format!("response_status out of range: {s}"))
                })
            })
            .transpose()?;

        let state = DeliveryState::from_parts(
            self.status.parse()?,
            parse_opt_ts(self.next_attempt_at)?,
            self.last_error,
            response_status,
        )?;

        Ok(Delivery {
            id: DeliveryId::from(self.id),
            tenant_id: TenantId::from(self.tenant_id),
            endpoint_id: EndpointId::from(self.endpoint_id),
            event_id: EventId::from(self.event_id),
            event_type: self.event_type,
            payload: serde_json::from_str(&self.payload)?,
            attempts: to_u32(self.attempts, "attempts")?,
            state,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Flat column values for a state: (status, next_attempt_at, last_error, response_status).
fn state_columns(state: &DeliveryState) -> (&'static str, Option<String>, Option<&str>, Option<u16>) {
    (
        state.status().as_str(),
        state.next_attempt_at().map(format_ts),
        state.last_error(),
        state.response_status(),
    )
}

/// Insert a delivery unless one already exists for its (event, endpoint) pair.
///
/// Returns true if the row was inserted.
pub fn insert_delivery_if_absent(conn: &Connection, delivery: &Delivery) -> DatabaseResult<bool> {
    let payload = serde_json::to_string(&delivery.payload)?;
    let (status, next_attempt_at, last_error, response_status) = state_columns(&delivery.state);

    let count = conn.execute(
        "INSERT INTO deliveries (id, tenant_id, endpoint_id, event_id, event_type, payload, status, attempts,
                                 response_status, last_error, next_attempt_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(event_id, endpoint_id) DO NOTHING",
        params![
            delivery.id.as_str(),
            delivery.tenant_id.as_str(),
            delivery.endpoint_id.as_str(),
            delivery.event_id.as_str(),
            delivery.event_type,
            payload,
            status,
            delivery.attempts,
            response_status,
            last_error,
            next_attempt_at,
            format_ts(delivery.created_at),
            format_ts(delivery.updated_at),
        ],
    )?;
    Ok(count > 0)
}

/// Get a delivery by ID.
pub fn get_delivery(conn: &Connection, id: &DeliveryId) -> DatabaseResult<Option<Delivery>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, tenant_id, endpoint_id, event_id, event_type, payload, status, attempts,
                response_status, last_error, next_attempt_at, created_at, updated_at
         FROM deliveries WHERE id = ?1",
    )?;

    match stmt.query_row(params![id.as_str()], map_row) {
        Ok(row) => Ok(Some(row.into_delivery()?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Get a delivery by ID, only if it belongs to `tenant_id`.
pub fn get_delivery_for_tenant(
    conn: &Connection,
    tenant_id: &TenantId,
    id: &DeliveryId,
) -> DatabaseResult<Option<Delivery>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, tenant_id, endpoint_id, event_id, event_type, payload, status, attempts,
                response_status, last_error, next_attempt_at, created_at, updated_at
         FROM deliveries WHERE id = ?1 AND tenant_id = ?2",
    )?;

    match stmt.query_row(params![id.as_str(), tenant_id.as_str()], map_row) {
        Ok(row) => Ok(Some(row.into_delivery()?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List a tenant's deliveries, newest first.
pub fn list_deliveries(conn: &Connection, filter: &DeliveryFilter) -> DatabaseResult<Vec<Delivery>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, tenant_id, endpoint_id, event_id, event_type, payload, status, attempts,
                response_status, last_error, next_attempt_at, created_at, updated_at
         FROM deliveries
         WHERE tenant_id = ?1 AND (?2 IS NULL OR status = ?2)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?3 OFFSET ?4",
    )?;

    let rows = stmt
        .query_map(
            params![
                filter.tenant_id.as_str(),
                filter.status.map(|s| s.as_str()),
                filter.limit as i64,
                filter.offset as i64,
            ],
            map_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(DeliveryRow::into_delivery).collect()
}

/// All deliveries fanned out from one event.
pub fn list_deliveries_for_event(
    conn: &Connection,
    event_id: &EventId,
) -> DatabaseResult<Vec<Delivery>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, tenant_id, endpoint_id, event_id, event_type, payload, status, attempts,
                response_status, last_error, next_attempt_at, created_at, updated_at
         FROM deliveries WHERE event_id = ?1 ORDER BY rowid ASC",
    )?;

    let rows = stmt
        .query_map(params![event_id.as_str()], map_row)?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(DeliveryRow::into_delivery).collect()
}

/// IDs of deliveries that need an attempt: every pending delivery, plus
/// retrying deliveries whose `next_attempt_at` has passed. Most overdue first.
pub fn list_due_delivery_ids(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
) -> DatabaseResult<Vec<DeliveryId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM deliveries
         WHERE status = 'pending'
            OR (status = 'retrying' AND next_attempt_at <= ?1)
         ORDER BY next_attempt_at ASC, rowid ASC
         LIMIT ?2",
    )?;

    let ids = stmt
        .query_map(params![format_ts(now), limit as i64], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ids.into_iter().map(DeliveryId::from).collect())
}

/// Count deliveries in a status.
pub fn count_deliveries_by_status(conn: &Connection, status: DeliveryStatus) -> DatabaseResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM deliveries WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Replace the state of `expected` with the state of `next`, and stage a
/// `webhook.delivery_updated` outbox event in the same transaction.
///
/// Applies only if the stored row still has `expected`'s status and attempt
/// count; returns whether it applied.
pub fn update_delivery_state(
    conn: &Connection,
    expected: &Delivery,
    next: &Delivery,
) -> DatabaseResult<bool> {
    let tx = conn.unchecked_transaction()?;
    let (status, next_attempt_at, last_error, response_status) = state_columns(&next.state);

    let count = tx.execute(
        "UPDATE deliveries
         SET status = ?1, attempts = ?2, response_status = ?3, last_error = ?4,
             next_attempt_at = ?5, updated_at = ?6
         WHERE id = ?7 AND status = ?8 AND attempts = ?9",
        params![
            status,
            next.attempts,
            response_status,
            last_error,
            next_attempt_at,
            format_ts(next.updated_at),
            expected.id.as_str(),
            expected.status().as_str(),
            expected.attempts,
        ],
    )?;

    if count == 0 {
        return Ok(false);
    }

    let update = DeliveryUpdated::from_delivery(next);
    let event = NewOutboxEvent::new(
        next.tenant_id.clone(),
        DELIVERY_UPDATED,
        serde_json::to_value(&update)?,
    );
    insert_outbox_event(&tx, &event, next.updated_at)?;

    tx.commit()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::{insert_endpoint, list_pending_outbox_events};
    use crate::run_migrations;
    use dispatch_core::Endpoint;
    use serde_json::json;

    fn setup() -> (Connection, Endpoint) {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let endpoint = Endpoint::new("t-1", "https://example.com/hook", "whsec");
        insert_endpoint(&conn, &endpoint).unwrap();
        (conn, endpoint)
    }

    fn new_delivery(endpoint: &Endpoint, now: DateTime<Utc>) -> Delivery {
        Delivery::pending(
            EventId::new(),
            "order.created",
            json!({"orderId": "o-1", "tenantId": "t-1"}),
            endpoint,
            now,
        )
    }

    #[test]
    fn test_insert_and_get_delivery() {
        let (conn, endpoint) = setup();
        let delivery = new_delivery(&endpoint, Utc::now());

        assert!(insert_delivery_if_absent(&conn, &delivery).unwrap());
        let loaded = get_delivery(&conn, &delivery.id).unwrap().unwrap();
        assert_eq!(loaded, delivery);
    }

    #[test]
    fn test_insert_is_idempotent_per_event_and_endpoint() {
        let (conn, endpoint) = setup();
        let now = Utc::now();
        let first = new_delivery(&endpoint, now);
        let duplicate = Delivery {
            id: DeliveryId::new(),
            ..first.clone()
        };

        assert!(insert_delivery_if_absent(&conn, &first).unwrap());
        assert!(!insert_delivery_if_absent(&conn, &duplicate).unwrap());
        assert_eq!(list_deliveries_for_event(&conn, &first.event_id).unwrap().len(), 1);
    }

    #[test]
    fn test_tenant_scoped_lookup() {
        let (conn, endpoint) = setup();
        let delivery = new_delivery(&endpoint, Utc::now());
        insert_delivery_if_absent(&conn, &delivery).unwrap();

        assert!(get_delivery_for_tenant(&conn, &TenantId::from("t-1"), &delivery.id)
            .unwrap()
            .is_some());
        assert!(get_delivery_for_tenant(&conn, &TenantId::from("t-2"), &delivery.id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_update_state_round_trips_every_variant() {
        let (conn, endpoint) = setup();
        let now = Utc::now();
        let pending = new_delivery(&endpoint, now);
        insert_delivery_if_absent(&conn, &pending).unwrap();

        let retrying = pending.record_retryable("HTTP 503", Some(503), now).unwrap();
        assert!(update_delivery_state(&conn, &pending, &retrying).unwrap());
        assert_eq!(get_delivery(&conn, &pending.id).unwrap().unwrap(), retrying);

        let failed = retrying.record_terminal(404, "HTTP 404", now).unwrap();
        assert!(update_delivery_state(&conn, &retrying, &failed).unwrap());
        assert_eq!(get_delivery(&conn, &pending.id).unwrap().unwrap(), failed);

        let replayed = failed.replay(now).unwrap();
        assert!(update_delivery_state(&conn, &failed, &replayed).unwrap());
        let loaded = get_delivery(&conn, &pending.id).unwrap().unwrap();
        assert_eq!(loaded, replayed);
        assert_eq!(loaded.attempts, 0);
        assert_eq!(loaded.state.last_error(), None);
    }

    #[test]
    fn test_stale_update_is_rejected() {
        let (conn, endpoint) = setup();
        let now = Utc::now();
        let pending = new_delivery(&endpoint, now);
        insert_delivery_if_absent(&conn, &pending).unwrap();

        let delivered = pending.record_success(200, now).unwrap();
        assert!(update_delivery_state(&conn, &pending, &delivered).unwrap());

        // A second worker still holding the pending copy loses.
        let racing = pending.record_retryable("timeout after 5000ms", None, now).unwrap();
        assert!(!update_delivery_state(&conn, &pending, &racing).unwrap());
        assert_eq!(get_delivery(&conn, &pending.id).unwrap().unwrap(), delivered);
    }

    #[test]
    fn test_update_stages_delivery_updated_event() {
        let (conn, endpoint) = setup();
        let now = Utc::now();
        let pending = new_delivery(&endpoint, now);
        insert_delivery_if_absent(&conn, &pending).unwrap();

        let delivered = pending.record_success(202, now).unwrap();
        update_delivery_state(&conn, &pending, &delivered).unwrap();

        let staged = list_pending_outbox_events(&conn, 10).unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].event_type, DELIVERY_UPDATED);
        assert_eq!(staged[0].tenant_id, pending.tenant_id);
        assert_eq!(staged[0].payload["deliveryId"], pending.id.as_str());
        assert_eq!(staged[0].payload["status"], "delivered");
        assert_eq!(staged[0].payload["responseStatus"], 202);
    }

    #[test]
    fn test_rejected_update_stages_nothing() {
        let (conn, endpoint) = setup();
        let now = Utc::now();
        let pending = new_delivery(&endpoint, now);
        // Never inserted, so nothing matches.
        let delivered = pending.record_success(200, now).unwrap();

        assert!(!update_delivery_state(&conn, &pending, &delivered).unwrap());
        assert!(list_pending_outbox_events(&conn, 10).unwrap().is_empty());
    }

    #[test]
    fn test_due_ids_include_pending_and_overdue_retries_only() {
        let (conn, endpoint) = setup();
        let now = Utc::now();

        let pending = new_delivery(&endpoint, now);
        insert_delivery_if_absent(&conn, &pending).unwrap();

        let overdue_src = new_delivery(&endpoint, now - chrono::Duration::minutes(5));
        insert_delivery_if_absent(&conn, &overdue_src).unwrap();
        let overdue = overdue_src
            .record_retryable("HTTP 500", Some(500), now - chrono::Duration::minutes(5))
            .unwrap();
        update_delivery_state(&conn, &overdue_src, &overdue).unwrap();

        let future_src = new_delivery(&endpoint, now);
        insert_delivery_if_absent(&conn, &future_src).unwrap();
        let future = future_src.record_retryable("HTTP 500", Some(500), now).unwrap();
        update_delivery_state(&conn, &future_src, &future).unwrap();

        let done_src = new_delivery(&endpoint, now);
        insert_delivery_if_absent(&conn, &done_src).unwrap();
        let done = done_src.record_success(200, now).unwrap();
        update_delivery_state(&conn, &done_src, &done).unwrap();

        let due = list_due_delivery_ids(&conn, now, 10).unwrap();
        assert_eq!(due.len(), 2);
        assert!(due.contains(&pending.id));
        assert!(due.contains(&overdue.id));

        assert_eq!(list_due_delivery_ids(&conn, now, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_list_filters_and_pages() {
        let (conn, endpoint) = setup();
        let now = Utc::now();
        for i in 0..4 {
            let d = new_delivery(&endpoint, now + chrono::Duration::seconds(i));
            insert_delivery_if_absent(&conn, &d).unwrap();
            if i % 2 == 0 {
                let dead = d.dead_letter("Endpoint disabled", now).unwrap();
                update_delivery_state(&conn, &d, &dead).unwrap();
            }
        }

        let all = list_deliveries(&conn, &DeliveryFilter::for_tenant("t-1")).unwrap();
        assert_eq!(all.len(), 4);
        assert!(all[0].created_at > all[3].created_at);

        let dead = list_deliveries(
            &conn,
            &DeliveryFilter::for_tenant("t-1").with_status(DeliveryStatus::Dead),
        )
        .unwrap();
        assert_eq!(dead.len(), 2);
        assert!(dead.iter().all(|d| d.status() == DeliveryStatus::Dead));

        let page = list_deliveries(&conn, &DeliveryFilter::for_tenant("t-1").page(3, 2)).unwrap();
        assert_eq!(page.len(), 2);

        assert!(list_deliveries(&conn, &DeliveryFilter::for_tenant("t-9"))
            .unwrap()
            .is_empty());
        assert_eq!(count_deliveries_by_status(&conn, DeliveryStatus::Dead).unwrap(), 2);
        assert_eq!(count_deliveries_by_status(&conn, DeliveryStatus::Pending).unwrap(), 2);
    }
}
