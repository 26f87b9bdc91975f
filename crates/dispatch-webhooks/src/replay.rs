//! Manual replay of a delivery.

use crate::{DeliveryScheduler, WebhookError, WebhookResult};
use chrono::Utc;
use dispatch_core::{Delivery, DeliveryId, DeliveryStatus, TenantId};
use dispatch_database::{queries, AsyncDatabase};
use dispatch_metrics::MetricsRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Result of resetting a delivery in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedDelivery {
    /// Status before the reset.
    pub previous_status: DeliveryStatus,
    /// The reset delivery: pending, zero attempts, due now.
    pub delivery: Delivery,
}

/// Reset a delivery owned by `tenant_id` to pending and stage its update
/// event. Does not enqueue it; a running sweeper picks it up.
///
/// Unknown ids and other tenants' ids are [`WebhookError::NotFound`]. A
/// retrying delivery is rejected because its retry ladder is still running.
pub async fn reset_delivery(
    db: &AsyncDatabase,
    tenant_id: &TenantId,
    delivery_id: &DeliveryId,
) -> WebhookResult<ReplayedDelivery> {
    let (tenant, id) = (tenant_id.clone(), delivery_id.clone());
    let current = db
        .call(move |conn| queries::get_delivery_for_tenant(conn, &tenant, &id))
        .await?
        .ok_or_else(|| WebhookError::NotFound(delivery_id.to_string()))?;

    let reset = current.replay(Utc::now())?;
    let previous_status = current.status();

    let update = reset.clone();
    let applied = db
        .call(move |conn| queries::update_delivery_state(conn, &current, &update))
        .await?;
    if !applied {
        return Err(WebhookError::Conflict(delivery_id.to_string()));
    }

    info!(
        delivery_id = %delivery_id,
        tenant_id = %tenant_id,
        previous_status = %previous_status,
        "Delivery reset for replay"
    );
    Ok(ReplayedDelivery {
        previous_status,
        delivery: reset,
    })
}

/// Replays deliveries inside the running service: reset, fix the DLQ gauge,
/// and enqueue immediately.
pub struct DeliveryReplayer {
    db: AsyncDatabase,
    scheduler: Arc<DeliveryScheduler>,
    metrics: Arc<MetricsRegistry>,
}

impl DeliveryReplayer {
    pub fn new(
        db: AsyncDatabase,
        scheduler: Arc<DeliveryScheduler>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            db,
            scheduler,
            metrics,
        }
    }

    /// Safe to call repeatedly: each call resets the same delivery again and
    /// never touches other deliveries of the event.
    pub async fn replay_delivery(
        &self,
        tenant_id: &TenantId,
        delivery_id: &DeliveryId,
    ) -> WebhookResult<Delivery> {
        let replayed = reset_delivery(&self.db, tenant_id, delivery_id).await?;

        if replayed.previous_status == DeliveryStatus::Dead {
            self.metrics.decrement_dlq_depth();
        }

        if let Err(e) = self.scheduler.schedule(delivery_id, Duration::ZERO).await {
            warn!(
                delivery_id = %delivery_id,
                error = %e,
                "Failed to enqueue replayed delivery, sweeper will pick it up"
            );
        }
        Ok(replayed.delivery)
    }
}
