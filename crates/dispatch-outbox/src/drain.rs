//! Periodic outbox drain.
//!
//! Each pass loads the oldest pending rows, publishes each one to the topic
//! named by its type, and records the outcome on the row. A failed publish
//! leaves the row pending for the next pass, with no retry limit: broker
//! outages delay events but never drop them.

use crate::OutboxResult;
use chrono::Utc;
use dispatch_broker::{publish_json, BrokerHandle};
use dispatch_core::{EventEnvelope, OutboxEvent, WorkerHandle};
use dispatch_database::{queries, AsyncDatabase};
use dispatch_metrics::MetricsRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Pending rows loaded.
    pub scanned: usize,
    pub published: usize,
    pub failed: usize,
}

/// Publishes pending outbox rows to the broker.
#[derive(Clone)]
pub struct OutboxDrainWorker {
    db: AsyncDatabase,
    broker: BrokerHandle,
    metrics: Arc<MetricsRegistry>,
    batch_size: usize,
    interval: Duration,
}

impl OutboxDrainWorker {
    pub fn new(
        db: AsyncDatabase,
        broker: BrokerHandle,
        metrics: Arc<MetricsRegistry>,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            broker,
            metrics,
            batch_size: batch_size.max(1),
            interval,
        }
    }

    /// Run one pass over at most `batch_size` pending rows, oldest first.
    pub async fn drain_once(&self) -> OutboxResult<DrainReport> {
        let limit = self.batch_size;
        let batch = self
            .db
            .call(move |conn| queries::list_pending_outbox_events(conn, limit))
            .await?;

        let mut report = DrainReport {
            scanned: batch.len(),
            ..DrainReport::default()
        };

        for event in batch {
            if self.publish_event(&event).await? {
                report.published += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                published = report.published,
                failed = report.failed,
                "Outbox drain pass complete"
            );
        }
        Ok(report)
    }

    /// Publish one row and record the result. Returns whether it was published.
    ///
    /// Database errors propagate; broker errors are recorded on the row.
    async fn publish_event(&self, event: &OutboxEvent) -> OutboxResult<bool> {
        let envelope = EventEnvelope::from_outbox(event);

        let id = event.id.clone();
        match publish_json(self.broker.as_ref(), &event.event_type, &envelope).await {
            Ok(message_id) => {
                let now = Utc::now();
                self.db
                    .call(move |conn| queries::mark_outbox_event_published(conn, &id, now))
                    .await?;
                self.metrics.record_event_published(&event.event_type);
                debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    message_id = %message_id,
                    "Outbox event published"
                );
                Ok(true)
            }
            Err(e) => {
                let error = e.to_string();
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempts = event.attempts + 1,
                    error = %error,
                    "Outbox publish failed, will retry next pass"
                );
                self.db
                    .call(move |conn| queries::record_outbox_publish_failure(conn, &id, &error))
                    .await?;
                Ok(false)
            }
        }
    }

    /// Drain every `interval` until the handle is stopped.
    pub fn start(self) -> WorkerHandle {
        let interval = self.interval;
        let worker = Arc::new(self);
        info!(interval_ms = interval.as_millis() as u64, "Starting outbox drain");

        WorkerHandle::periodic("outbox-drain", interval, move || {
            let worker = worker.clone();
            async move {
                if let Err(e) = worker.drain_once().await {
                    warn!(error = %e, "Outbox drain pass failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_broker::InMemoryBroker;
    use dispatch_core::{NewOutboxEvent, OutboxStatus};
    use serde_json::json;

    async fn setup() -> (AsyncDatabase, InMemoryBroker, Arc<MetricsRegistry>, OutboxDrainWorker) {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let broker = InMemoryBroker::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let worker = OutboxDrainWorker::new(
            db.clone(),
            Arc::new(broker.clone()),
            metrics.clone(),
            10,
            Duration::from_secs(5),
        );
        (db, broker, metrics, worker)
    }

    async fn stage(db: &AsyncDatabase, event_type: &str, payload: serde_json::Value) -> OutboxEvent {
        let event = NewOutboxEvent::new("t-1", event_type, payload);
        db.call(move |conn| queries::insert_outbox_event(conn, &event, Utc::now()))
            .await
            .unwrap()
    }

    async fn reload(db: &AsyncDatabase, event: &OutboxEvent) -> OutboxEvent {
        let id = event.id.clone();
        db.call(move |conn| queries::get_outbox_event(conn, &id))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn empty_outbox_is_a_noop() {
        let (_db, broker, _metrics, worker) = setup().await;
        let report = worker.drain_once().await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert!(broker.published("order.created").is_empty());
    }

    #[tokio::test]
    async fn publishes_envelope_to_topic_named_by_type() {
        let (db, broker, metrics, worker) = setup().await;
        let event = stage(&db, "order.created", json!({"orderId": "o-1"})).await;

        let report = worker.drain_once().await.unwrap();
        assert_eq!(report.published, 1);

        let bodies = broker.published_json("order.created");
        assert_eq!(bodies.len(), 1);
        assert_eq!(
            bodies[0],
            json!({
                "orderId": "o-1",
                "eventId": event.id.as_str(),
                "eventType": "order.created",
                "tenantId": "t-1",
                "at": serde_json::to_value(event.created_at).unwrap(),
            })
        );

        let stored = reload(&db, &event).await;
        assert_eq!(stored.status, OutboxStatus::Published);
        assert_eq!(stored.attempts, 1);
        assert!(stored.published_at.is_some());
        assert_eq!(
            metrics.snapshot().events_published.get("order.created"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn failed_publishes_retry_until_published_once() {
        let (db, broker, metrics, worker) = setup().await;
        let event = stage(&db, "return.created", json!({"returnId": "r-1"})).await;
        broker.fail_next_publishes(3);

        for _ in 0..3 {
            let report = worker.drain_once().await.unwrap();
            assert_eq!(report.failed, 1);
            let stored = reload(&db, &event).await;
            assert_eq!(stored.status, OutboxStatus::Pending);
            assert!(stored.last_error.is_some());
        }

        let report = worker.drain_once().await.unwrap();
        assert_eq!(report.published, 1);

        let stored = reload(&db, &event).await;
        assert_eq!(stored.status, OutboxStatus::Published);
        assert_eq!(stored.attempts, 4);
        assert_eq!(broker.published("return.created").len(), 1);
        assert_eq!(
            metrics.snapshot().events_published.get("return.created"),
            Some(&1)
        );

        // Nothing left to drain.
        assert_eq!(worker.drain_once().await.unwrap().scanned, 0);
        assert_eq!(broker.published("return.created").len(), 1);
    }

    #[tokio::test]
    async fn publishes_in_creation_order() {
        let (db, broker, _metrics, worker) = setup().await;
        for n in 0..3 {
            stage(&db, "order.updated", json!({ "n": n })).await;
        }

        worker.drain_once().await.unwrap();

        let order: Vec<_> = broker
            .published_json("order.updated")
            .iter()
            .map(|body| body["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn batch_size_bounds_each_pass() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let broker = InMemoryBroker::new();
        let worker = OutboxDrainWorker::new(
            db.clone(),
            Arc::new(broker.clone()),
            Arc::new(MetricsRegistry::new()),
            2,
            Duration::from_secs(5),
        );
        for n in 0..5 {
            stage(&db, "order.created", json!({ "n": n })).await;
        }

        assert_eq!(worker.drain_once().await.unwrap().published, 2);
        assert_eq!(worker.drain_once().await.unwrap().published, 2);
        assert_eq!(worker.drain_once().await.unwrap().published, 1);
        assert_eq!(broker.published("order.created").len(), 5);
    }

    #[tokio::test]
    async fn started_worker_drains_and_stops() {
        let (db, broker, _metrics, worker) = setup().await;
        stage(&db, "order.cancelled", json!({})).await;

        let handle = worker.start();
        for _ in 0..100 {
            if !broker.published("order.cancelled").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;

        assert_eq!(broker.published("order.cancelled").len(), 1);
    }
}
