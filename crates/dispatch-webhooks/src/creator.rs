//! Delivery creator: fans domain events out to tenant endpoints.

use crate::consumer::{spawn_consumer, MessageHandler};
use crate::{DeliveryScheduler, WebhookResult};
use async_trait::async_trait;
use chrono::Utc;
use dispatch_broker::{Broker, BrokerMessage};
use dispatch_core::events::is_internal_event;
use dispatch_core::{Delivery, EventEnvelope, WorkerHandle};
use dispatch_database::{queries, AsyncDatabase};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Creates one pending delivery per enabled endpoint for each domain event.
pub struct DeliveryCreator {
    db: AsyncDatabase,
    scheduler: Arc<DeliveryScheduler>,
}

impl DeliveryCreator {
    pub fn new(db: AsyncDatabase, scheduler: Arc<DeliveryScheduler>) -> Self {
        Self { db, scheduler }
    }

    /// Fan `event` out and schedule each new delivery immediately.
    ///
    /// Returns the deliveries created by this call. A redelivered event finds
    /// its `(event, endpoint)` rows already present and creates nothing.
    pub async fn handle_event(&self, event: &EventEnvelope) -> WebhookResult<Vec<Delivery>> {
        if is_internal_event(&event.event_type) {
            debug!(event_id = %event.event_id, event_type = %event.event_type, "Skipping internal event");
            return Ok(Vec::new());
        }

        let tenant_id = event.tenant_id.clone();
        let endpoints = self
            .db
            .call(move |conn| queries::list_enabled_endpoints(conn, &tenant_id))
            .await?;

        if endpoints.is_empty() {
            debug!(event_id = %event.event_id, tenant_id = %event.tenant_id, "No enabled endpoints");
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let payload = event.payload();
        let candidates: Vec<Delivery> = endpoints
            .iter()
            .map(|endpoint| {
                Delivery::pending(
                    event.event_id.clone(),
                    event.event_type.clone(),
                    payload.clone(),
                    endpoint,
                    now,
                )
            })
            .collect();

        let created = self
            .db
            .call(move |conn| {
                let mut created = Vec::with_capacity(candidates.len());
                for delivery in candidates {
                    if queries::insert_delivery_if_absent(conn, &delivery)? {
                        created.push(delivery);
                    }
                }
                Ok(created)
            })
            .await?;

        for delivery in &created {
            if let Err(e) = self.scheduler.schedule(&delivery.id, Duration::ZERO).await {
                warn!(
                    delivery_id = %delivery.id,
                    error = %e,
                    "Failed to enqueue new delivery, sweeper will pick it up"
                );
            }
        }

        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            tenant_id = %event.tenant_id,
            endpoints = endpoints.len(),
            created = created.len(),
            "Fanned out event"
        );
        Ok(created)
    }

    /// Subscribe to every topic in `topics` under `group`, one consumer each.
    pub async fn start(
        self: Arc<Self>,
        broker: &dyn Broker,
        topics: &[String],
        group: &str,
    ) -> WebhookResult<Vec<WorkerHandle>> {
        let mut handles = Vec::with_capacity(topics.len());
        for topic in topics {
            let subscription = broker.subscribe(topic, group).await?;
            handles.push(spawn_consumer(
                format!("delivery-creator:{topic}"),
                subscription,
                self.clone(),
            ));
        }
        info!(topics = topics.len(), group, "Delivery creator started");
        Ok(handles)
    }
}

#[async_trait]
impl MessageHandler for DeliveryCreator {
    async fn handle(&self, message: &BrokerMessage) -> WebhookResult<()> {
        let event: EventEnvelope = serde_json::from_slice(&message.payload)?;
        self.handle_event(&event).await?;
        Ok(())
    }
}
