use crate::output::{self, OutputFormat};
use dispatch_core::{Delivery, DeliveryId, DeliveryStatus, TenantId};
use dispatch_database::{queries, AsyncDatabase, DeliveryFilter};
use dispatch_webhooks::{reset_delivery, ReplayedDelivery};

pub async fn list(
    db: &AsyncDatabase,
    tenant: &str,
    status: Option<DeliveryStatus>,
    limit: usize,
    offset: usize,
    format: &OutputFormat,
) -> anyhow::Result<Vec<Delivery>> {
    let mut filter = DeliveryFilter::for_tenant(tenant).page(limit, offset);
    if let Some(status) = status {
        filter = filter.with_status(status);
    }

    let deliveries = db
        .call(move |conn| queries::list_deliveries(conn, &filter))
        .await?;

    match format {
        OutputFormat::Json => output::print_json(&deliveries)?,
        OutputFormat::Text if deliveries.is_empty() => println!("No deliveries found"),
        OutputFormat::Text => {
            output::print_heading(&format!("Deliveries for {tenant}"));
            for delivery in &deliveries {
                println!(
                    "  {}  {:<9}  attempts={}  {}  {}",
                    delivery.id,
                    delivery.status(),
                    delivery.attempts,
                    delivery.event_type,
                    delivery.state.last_error().unwrap_or("-"),
                );
            }
        }
    }
    Ok(deliveries)
}

/// Reset a delivery to pending. The running service's sweeper enqueues it
/// and refreshes the DLQ gauge on its next pass.
pub async fn replay(
    db: &AsyncDatabase,
    tenant: &str,
    id: &str,
    format: &OutputFormat,
) -> anyhow::Result<ReplayedDelivery> {
    let replayed = reset_delivery(
        db,
        &TenantId::from_string(tenant),
        &DeliveryId::from_string(id),
    )
    .await?;

    match format {
        OutputFormat::Json => output::print_json(&serde_json::json!({
            "previousStatus": replayed.previous_status,
            "delivery": replayed.delivery,
        }))?,
        OutputFormat::Text => {
            output::print_success("Delivery reset for replay", format);
            output::print_row("ID", replayed.delivery.id.as_str());
            output::print_row("Was", replayed.previous_status.as_str());
            output::print_row("Now", replayed.delivery.status().as_str());
        }
    }
    Ok(replayed)
}
