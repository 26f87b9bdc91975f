use crate::output::{self, OutputFormat};
use anyhow::{bail, Context};
use dispatch_core::{parse_endpoint_url, Endpoint, EndpointId, TenantId};
use dispatch_database::{queries, AsyncDatabase};

/// Register an enabled endpoint after validating its URL.
pub async fn add(
    db: &AsyncDatabase,
    tenant: &str,
    url: &str,
    secret: &str,
    format: &OutputFormat,
) -> anyhow::Result<Endpoint> {
    let url = parse_endpoint_url(url)?;
    if secret.is_empty() {
        bail!("Signing secret must not be empty");
    }

    let endpoint = Endpoint::new(tenant, url.as_str(), secret);
    let row = endpoint.clone();
    db.call(move |conn| queries::insert_endpoint(conn, &row))
        .await
        .context("Failed to store endpoint")?;

    match format {
        OutputFormat::Json => output::print_json(&endpoint)?,
        OutputFormat::Text => {
            output::print_success("Endpoint registered", format);
            output::print_row("ID", endpoint.id.as_str());
            output::print_row("Tenant", endpoint.tenant_id.as_str());
            output::print_row("URL", &endpoint.url);
        }
    }
    Ok(endpoint)
}

pub async fn list(
    db: &AsyncDatabase,
    tenant: &str,
    format: &OutputFormat,
) -> anyhow::Result<Vec<Endpoint>> {
    let tenant_id = TenantId::from_string(tenant);
    let endpoints = db
        .call(move |conn| queries::list_endpoints(conn, &tenant_id))
        .await?;

    match format {
        OutputFormat::Json => output::print_json(&endpoints)?,
        OutputFormat::Text if endpoints.is_empty() => {
            println!("No endpoints registered for tenant {tenant}");
        }
        OutputFormat::Text => {
            output::print_heading(&format!("Endpoints for {tenant}"));
            for endpoint in &endpoints {
                let state = if endpoint.enabled { "enabled" } else { "disabled" };
                println!("  {}  {:<8}  {}", endpoint.id, state, endpoint.url);
            }
        }
    }
    Ok(endpoints)
}

/// Enable or disable an endpoint. Existing deliveries are untouched; a
/// disabled endpoint's next attempt dead-letters.
pub async fn set_enabled(
    db: &AsyncDatabase,
    id: &str,
    enabled: bool,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let endpoint_id = EndpointId::from_string(id);
    let found = db
        .call(move |conn| queries::set_endpoint_enabled(conn, &endpoint_id, enabled))
        .await?;
    if !found {
        bail!("Endpoint not found: {id}");
    }

    let verb = if enabled { "enabled" } else { "disabled" };
    output::print_success(&format!("Endpoint {id} {verb}"), format);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_normalizes_url_and_lists_per_tenant() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let format = OutputFormat::Json;

        let added = add(&db, "t-1", "https://hooks.example.com", "s3cret", &format)
            .await
            .unwrap();
        add(&db, "t-2", "https://other.example.com/in", "s3cret", &format)
            .await
            .unwrap();

        assert_eq!(added.url, "https://hooks.example.com/");
        assert!(added.enabled);

        let listed = list(&db, "t-1", &format).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, added.id);
        assert_eq!(listed[0].secret, "s3cret");
    }

    #[tokio::test]
    async fn add_rejects_bad_input() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let format = OutputFormat::Text;

        assert!(add(&db, "t-1", "ftp://example.com", "s", &format).await.is_err());
        assert!(add(&db, "t-1", "https://example.com", "", &format).await.is_err());
        assert!(list(&db, "t-1", &format).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn toggling_enabled() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let format = OutputFormat::Text;
        let endpoint = add(&db, "t-1", "https://hooks.example.com/in", "s", &format)
            .await
            .unwrap();

        set_enabled(&db, endpoint.id.as_str(), false, &format)
            .await
            .unwrap();
        assert!(!list(&db, "t-1", &format).await.unwrap()[0].enabled);

        set_enabled(&db, endpoint.id.as_str(), true, &format)
            .await
            .unwrap();
        assert!(list(&db, "t-1", &format).await.unwrap()[0].enabled);

        assert!(set_enabled(&db, "missing", true, &format).await.is_err());
    }
}
