//! Endpoint queries.
//!
//! Endpoints are owned by tenant configuration; the dispatcher only reads them.
//! Writes exist for the CLI and tests.

use super::{format_ts, parse_ts};
use crate::DatabaseResult;
use dispatch_core::{Endpoint, EndpointId, TenantId};
use rusqlite::{params, Connection, Row};

struct EndpointRow {
    id: String,
    tenant_id: String,
    url: String,
    secret: String,
    enabled: bool,
    created_at: String,
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<EndpointRow> {
    Ok(EndpointRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        url: row.get(2)?,
        secret: row.get(3)?,
        enabled: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl EndpointRow {
    fn into_endpoint(self) -> DatabaseResult<Endpoint> {
        Ok(Endpoint {
            id: EndpointId::from(self.id),
            tenant_id: TenantId::from(self.tenant_id),
            url: self.url,
            secret: self.secret,
            enabled: self.enabled,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

/// Insert a new endpoint.
pub fn insert_endpoint(conn: &Connection, endpoint: &Endpoint) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO endpoints (id, tenant_id, url, secret, enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            endpoint.id.as_str(),
            endpoint.tenant_id.as_str(),
            endpoint.url,
            endpoint.secret,
            endpoint.enabled,
            format_ts(endpoint.created_at),
        ],
    )?;
    Ok(())
}

/// Get an endpoint by ID.
pub fn get_endpoint(conn: &Connection, id: &EndpointId) -> DatabaseResult<Option<Endpoint>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, tenant_id, url, secret, enabled, created_at FROM endpoints WHERE id = ?1",
    )?;

    match stmt.query_row(params![id.as_str()], map_row) {
        Ok(row) => Ok(Some(row.into_endpoint()?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List every endpoint of a tenant, oldest first.
pub fn list_endpoints(conn: &Connection, tenant_id: &TenantId) -> DatabaseResult<Vec<Endpoint>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, tenant_id, url, secret, enabled, created_at
         FROM endpoints WHERE tenant_id = ?1 ORDER BY created_at ASC, rowid ASC",
    )?;

    let rows = stmt
        .query_map(params![tenant_id.as_str()], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(EndpointRow::into_endpoint).collect()
}

/// List the enabled endpoints of a tenant, oldest first.
pub fn list_enabled_endpoints(
    conn: &Connection,
    tenant_id: &TenantId,
) -> DatabaseResult<Vec<Endpoint>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, tenant_id, url, secret, enabled, created_at
         FROM endpoints WHERE tenant_id = ?1 AND enabled = 1 ORDER BY created_at ASC, rowid ASC",
    )?;

    let rows = stmt
        .query_map(params![tenant_id.as_str()], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(EndpointRow::into_endpoint).collect()
}

/// Enable or disable an endpoint. Returns false if it does not exist.
pub fn set_endpoint_enabled(
    conn: &Connection,
    id: &EndpointId,
    enabled: bool,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE endpoints SET enabled = ?1 WHERE id = ?2",
        params![enabled, id.as_str()],
    )?;
    Ok(count > 0)
}
