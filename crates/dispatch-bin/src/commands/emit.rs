use crate::output::{self, OutputFormat};
use anyhow::Context;
use chrono::Utc;
use dispatch_core::{NewOutboxEvent, OutboxEvent};
use dispatch_database::{queries, AsyncDatabase};

/// Stage an event in the outbox, the same way a domain writer would inside
/// its own transaction. The drain publishes it on its next pass.
pub async fn emit(
    db: &AsyncDatabase,
    tenant: &str,
    event_type: &str,
    payload: &str,
    format: &OutputFormat,
) -> anyhow::Result<OutboxEvent> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let event = NewOutboxEvent::new(tenant, event_type, payload);

    let staged = db
        .call(move |conn| queries::insert_outbox_event(conn, &event, Utc::now()))
        .await?;

    match format {
        OutputFormat::Json => output::print_json(&staged)?,
        OutputFormat::Text => {
            output::print_success("Event staged", format);
            output::print_row("ID", staged.id.as_str());
            output::print_row("Type", &staged.event_type);
        }
    }
    Ok(staged)
}
