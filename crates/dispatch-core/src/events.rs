//! Event type names and the JSON bodies exchanged over the broker.

use crate::models::{
    Delivery, DeliveryId, DeliveryStatus, EndpointId, EventId, OutboxEvent, TenantId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Topic carrying delivery-attempt messages.
pub const DELIVER_TOPIC: &str = "webhooks.deliver";

/// Event emitted through the outbox after every delivery state change.
pub const DELIVERY_UPDATED: &str = "webhook.delivery_updated";

/// Domain event types fanned out to webhook endpoints when no topic list is
/// configured.
pub const DEFAULT_EVENT_TOPICS: &[&str] = &[
    "order.created",
    "order.updated",
    "order.cancelled",
    "order.fulfilled",
    "return.created",
    "return.approved",
    "return.rejected",
    "return.label_generated",
    "return.received",
    "refund.issued",
];

/// Internal events describe the dispatcher itself and are never sent to
/// tenant webhooks.
pub fn is_internal_event(event_type: &str) -> bool {
    event_type.starts_with("webhook.")
}

/// Keys the envelope writes next to the domain fields. A domain field with one
/// of these names is dropped from the envelope.
pub const ENVELOPE_KEYS: &[&str] = &["eventId", "eventType", "tenantId", "at"];

/// Key holding a payload that is not a JSON object.
const NON_OBJECT_KEY: &str = "data";

/// Body published to a domain event topic by the outbox drain:
/// `{ ...domain fields, eventId, eventType, tenantId, at }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub event_type: String,
    pub tenant_id: TenantId,
    /// When the event was staged (the outbox row's `created_at`).
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EventEnvelope {
    pub fn new(
        event_id: EventId,
        event_type: impl Into<String>,
        tenant_id: TenantId,
        at: DateTime<Utc>,
        payload: Value,
    ) -> Self {
        let mut fields = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert(NON_OBJECT_KEY.to_string(), other);
                map
            }
        };
        for key in ENVELOPE_KEYS {
            fields.remove(*key);
        }

        Self {
            event_id,
            event_type: event_type.into(),
            tenant_id,
            at,
            fields,
        }
    }

    pub fn from_outbox(event: &OutboxEvent) -> Self {
        Self::new(
            event.id.clone(),
            event.event_type.clone(),
            event.tenant_id.clone(),
            event.created_at,
            event.payload.clone(),
        )
    }

    /// The domain fields as one object. This is the webhook request body.
    pub fn payload(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// Body published to [`DELIVER_TOPIC`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverMessage {
    pub delivery_id: DeliveryId,
}

/// Payload of a [`DELIVERY_UPDATED`] outbox event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryUpdated {
    pub delivery_id: DeliveryId,
    pub tenant_id: TenantId,
    pub endpoint_id: EndpointId,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl DeliveryUpdated {
    pub fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            delivery_id: delivery.id.clone(),
            tenant_id: delivery.tenant_id.clone(),
            endpoint_id: delivery.endpoint_id.clone(),
            event_type: delivery.event_type.clone(),
            status: delivery.status(),
            attempts: delivery.attempts,
            response_status: delivery.state.response_status(),
            last_error: delivery.state.last_error().map(str::to_string),
            next_attempt_at: delivery.state.next_attempt_at(),
            at: delivery.updated_at,
        }
    }
}
