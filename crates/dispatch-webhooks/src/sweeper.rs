//! Due-retry sweeper.
//!
//! Re-enqueues every pending delivery and every retrying delivery whose
//! `next_attempt_at` has passed. This heals lost scheduler timers, crashed
//! workers and failed enqueues within one sweep interval. Each pass also
//! refreshes `dlq_depth` from the store.

use crate::{DeliveryScheduler, WebhookResult};
use chrono::Utc;
use dispatch_core::{DeliveryStatus, WorkerHandle};
use dispatch_database::{queries, AsyncDatabase};
use dispatch_metrics::MetricsRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Due deliveries found.
    pub due: usize,
    /// Deliver messages published.
    pub enqueued: usize,
    /// Dead deliveries in the store.
    pub dlq_depth: u64,
}

pub struct DueRetrySweeper {
    db: AsyncDatabase,
    scheduler: Arc<DeliveryScheduler>,
    metrics: Arc<MetricsRegistry>,
    batch_size: usize,
    interval: Duration,
}

impl DueRetrySweeper {
    pub fn new(
        db: AsyncDatabase,
        scheduler: Arc<DeliveryScheduler>,
        metrics: Arc<MetricsRegistry>,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            scheduler,
            metrics,
            batch_size: batch_size.max(1),
            interval,
        }
    }

    pub async fn sweep_once(&self) -> WebhookResult<SweepReport> {
        let now = Utc::now();
        let limit = self.batch_size;
        let due = self
            .db
            .call(move |conn| queries::list_due_delivery_ids(conn, now, limit))
            .await?;

        let mut report = SweepReport {
            due: due.len(),
            ..SweepReport::default()
        };

        for delivery_id in &due {
            match self.scheduler.schedule(delivery_id, Duration::ZERO).await {
                Ok(()) => report.enqueued += 1,
                Err(e) => warn!(delivery_id = %delivery_id, error = %e, "Sweeper enqueue failed"),
            }
        }

        report.dlq_depth = self
            .db
            .call(|conn| queries::count_deliveries_by_status(conn, DeliveryStatus::Dead))
            .await?;
        self.metrics.set_dlq_depth(report.dlq_depth);

        if report.due > 0 {
            info!(
                due = report.due,
                enqueued = report.enqueued,
                dlq_depth = report.dlq_depth,
                "Sweep re-enqueued due deliveries"
            );
        } else {
            debug!(dlq_depth = report.dlq_depth, "Sweep found nothing due");
        }
        Ok(report)
    }

    /// Sweep every `interval` until the handle is stopped.
    pub fn start(self) -> WorkerHandle {
        let interval = self.interval;
        let sweeper = Arc::new(self);
        info!(interval_ms = interval.as_millis() as u64, "Starting due-retry sweeper");

        WorkerHandle::periodic("due-retry-sweeper", interval, move || {
            let sweeper = sweeper.clone();
            async move {
                if let Err(e) = sweeper.sweep_once().await {
                    warn!(error = %e, "Sweep failed");
                }
            }
        })
    }
}
