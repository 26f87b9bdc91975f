//! Delivery execution worker.
//!
//! Handles one `{deliveryId}` message at a time:
//!
//! 1. Load the delivery; skip it if it is terminal or not yet due.
//! 2. Dead-letter it if the endpoint is disabled or gone.
//! 3. Otherwise POST the signed payload and classify the response.
//! 4. Persist the new state with a conditional update that also stages the
//!    `webhook.delivery_updated` event.
//! 5. Update metrics and, when retrying, re-arm the scheduler.
//!
//! If the conditional update loses to another worker, step 5 is skipped.

use crate::consumer::{spawn_consumer, MessageHandler};
use crate::{DeliveryScheduler, WebhookRequest, WebhookResult, WebhookTransport};
use async_trait::async_trait;
use chrono::Utc;
use dispatch_broker::{Broker, BrokerMessage};
use dispatch_core::{
    classify, compute_backoff_duration, AttemptOutcome, DeliverMessage, Delivery, DeliveryId,
    DeliveryState, Endpoint, WorkerHandle, DELIVER_TOPIC,
};
use dispatch_database::{queries, AsyncDatabase};
use dispatch_metrics::MetricsRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How far ahead of `next_attempt_at` (ms) a retry message is still acted on.
pub const DUE_TOLERANCE_MS: i64 = 1_000;

/// What [`DeliveryExecutor::process`] did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Unknown, terminal or not yet due; nothing changed.
    Skipped,
    /// Another worker changed the row first; nothing recorded.
    Superseded,
    Delivered,
    Retrying { delay: Duration },
    Failed,
    Dead,
}

pub struct DeliveryExecutor {
    db: AsyncDatabase,
    transport: Arc<dyn WebhookTransport>,
    scheduler: Arc<DeliveryScheduler>,
    metrics: Arc<MetricsRegistry>,
}

impl DeliveryExecutor {
    pub fn new(
        db: AsyncDatabase,
        transport: Arc<dyn WebhookTransport>,
        scheduler: Arc<DeliveryScheduler>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            db,
            transport,
            scheduler,
            metrics,
        }
    }

    /// Make one attempt for `delivery_id`, if it is due.
    pub async fn process(&self, delivery_id: &DeliveryId) -> WebhookResult<ProcessOutcome> {
        let id = delivery_id.clone();
        let Some(delivery) = self
            .db
            .call(move |conn| queries::get_delivery(conn, &id))
            .await?
        else {
            warn!(delivery_id = %delivery_id, "Delivery not found, dropping message");
            return Ok(ProcessOutcome::Skipped);
        };

        let tolerance = chrono::Duration::milliseconds(DUE_TOLERANCE_MS);
        if !delivery.is_due(Utc::now(), tolerance) {
            debug!(
                delivery_id = %delivery.id,
                status = %delivery.status(),
                "Delivery not due, skipping"
            );
            return Ok(ProcessOutcome::Skipped);
        }

        let endpoint_id = delivery.endpoint_id.clone();
        let endpoint = self
            .db
            .call(move |conn| queries::get_endpoint(conn, &endpoint_id))
            .await?;

        let next = match endpoint {
            Some(endpoint) if endpoint.enabled => self.attempt(&delivery, &endpoint).await?,
            Some(_) => delivery.dead_letter("Endpoint disabled", Utc::now())?,
            None => delivery.dead_letter("Endpoint not found", Utc::now())?,
        };

        self.persist(delivery, next).await
    }

    /// POST the delivery and map the response onto its next state.
    async fn attempt(&self, delivery: &Delivery, endpoint: &Endpoint) -> WebhookResult<Delivery> {
        let request = WebhookRequest::signed(endpoint, delivery, Utc::now().timestamp())?;
        debug!(
            delivery_id = %delivery.id,
            url = %endpoint.url,
            attempt = delivery.attempts + 1,
            "Sending webhook"
        );

        let response = self.transport.send(&request).await;
        let now = Utc::now();

        let next = match response {
            Ok(status) => match classify(Some(status), None) {
                AttemptOutcome::Delivered => delivery.record_success(status, now)?,
                AttemptOutcome::Retry => {
                    delivery.record_retryable(format!("HTTP {status}"), Some(status), now)?
                }
                AttemptOutcome::Terminal => {
                    delivery.record_terminal(status, format!("HTTP {status}"), now)?
                }
            },
            Err(error) => delivery.record_retryable(error, None, now)?,
        };
        Ok(next)
    }

    async fn persist(&self, current: Delivery, next: Delivery) -> WebhookResult<ProcessOutcome> {
        let expected = current.clone();
        let update = next.clone();
        let applied = self
            .db
            .call(move |conn| queries::update_delivery_state(conn, &expected, &update))
            .await?;

        if !applied {
            info!(delivery_id = %next.id, "Delivery changed concurrently, discarding attempt");
            return Ok(ProcessOutcome::Superseded);
        }

        let outcome = match &next.state {
            DeliveryState::Delivered { response_status } => {
                self.metrics.record_success();
                info!(
                    delivery_id = %next.id,
                    status = response_status,
                    attempts = next.attempts,
                    "Webhook delivered"
                );
                ProcessOutcome::Delivered
            }
            DeliveryState::Retrying { last_error, .. } => {
                self.metrics.record_retry();
                let delay = compute_backoff_duration(next.attempts);
                warn!(
                    delivery_id = %next.id,
                    attempts = next.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Webhook attempt failed, retrying"
                );
                if let Err(e) = self.scheduler.schedule(&next.id, delay).await {
                    warn!(delivery_id = %next.id, error = %e, "Failed to arm retry timer");
                }
                ProcessOutcome::Retrying { delay }
            }
            DeliveryState::Failed {
                response_status,
                last_error,
            } => {
                self.metrics.record_failure();
                warn!(
                    delivery_id = %next.id,
                    status = response_status,
                    error = %last_error,
                    "Webhook failed permanently"
                );
                ProcessOutcome::Failed
            }
            DeliveryState::Dead { last_error, .. } => {
                self.metrics.increment_dlq_depth();
                warn!(
                    delivery_id = %next.id,
                    attempts = next.attempts,
                    error = %last_error,
                    "Webhook dead-lettered"
                );
                ProcessOutcome::Dead
            }
            // Attempts never produce a pending state.
            DeliveryState::Pending { .. } => ProcessOutcome::Skipped,
        };
        Ok(outcome)
    }

    /// Consume the deliver topic under `group` until stopped.
    pub async fn start(self: Arc<Self>, broker: &dyn Broker, group: &str) -> WebhookResult<WorkerHandle> {
        let subscription = broker.subscribe(DELIVER_TOPIC, group).await?;
        info!(group, "Delivery executor started");
        Ok(spawn_consumer("delivery-executor", subscription, self))
    }
}

#[async_trait]
impl MessageHandler for DeliveryExecutor {
    async fn handle(&self, message: &BrokerMessage) -> WebhookResult<()> {
        let body: DeliverMessage = serde_json::from_slice(&message.payload)?;
        let outcome = self.process(&body.delivery_id).await?;
        debug!(delivery_id = %body.delivery_id, ?outcome, "Processed deliver message");
        Ok(())
    }
}
