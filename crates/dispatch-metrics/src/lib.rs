//! Delivery metrics.
//!
//! [`MetricsRegistry`] owns a private Prometheus recorder instead of installing
//! a global one. Each worker is handed an `Arc<MetricsRegistry>`, and every
//! registry starts from zero, so tests assert on their own instance.
//!
//! Exposition is pull-based: [`MetricsRegistry::render`] returns the Prometheus
//! text format for a `/metrics` handler.

use metrics::{counter, describe_counter, describe_gauge, gauge, Counter, Gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use parking_lot::Mutex;
use std::collections::BTreeMap;

// ============================================================================
// Metric Names
// ============================================================================

pub mod names {
    /// Retryable attempts that were rescheduled.
    pub const WEBHOOK_RETRY_TOTAL: &str = "webhook_retry_total";

    /// Deliveries that reached `delivered`.
    pub const WEBHOOK_SUCCESS_TOTAL: &str = "webhook_success_total";

    /// Deliveries that reached `failed` (non-retryable response).
    pub const WEBHOOK_FAILURE_TOTAL: &str = "webhook_failure_total";

    /// Outbox events published to the broker, labelled by `type`.
    pub const EVENTS_PUBLISHED_TOTAL: &str = "events_published_total";

    /// success / (success + failure).
    pub const WEBHOOK_SUCCESS_RATE: &str = "webhook_success_rate";

    /// Deliveries currently in `dead`.
    pub const DLQ_DEPTH: &str = "dlq_depth";
}

/// Point-in-time copy of the registry's values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub retries: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub dlq_depth: u64,
    pub events_published: BTreeMap<String, u64>,
}

#[derive(Default)]
struct Values {
    retries: u64,
    successes: u64,
    failures: u64,
    dlq_depth: u64,
    events_published: BTreeMap<String, u64>,
}

impl Values {
    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

/// Counters and gauges for the outbox drain and webhook delivery.
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    retries: Counter,
    successes: Counter,
    failures: Counter,
    success_rate: Gauge,
    dlq_depth: Gauge,
    values: Mutex<Values>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        let (retries, successes, failures, success_rate, dlq_depth) =
            metrics::with_local_recorder(&recorder, || {
                describe_counter!(names::WEBHOOK_RETRY_TOTAL, "Webhook attempts rescheduled for retry");
                describe_counter!(names::WEBHOOK_SUCCESS_TOTAL, "Webhook deliveries delivered");
                describe_counter!(
                    names::WEBHOOK_FAILURE_TOTAL,
                    "Webhook deliveries failed with a non-retryable response"
                );
                describe_counter!(
                    names::EVENTS_PUBLISHED_TOTAL,
                    "Outbox events published to the broker"
                );
                describe_gauge!(
                    names::WEBHOOK_SUCCESS_RATE,
                    "Delivered / (delivered + failed) webhook deliveries"
                );
                describe_gauge!(names::DLQ_DEPTH, "Webhook deliveries in the dead-letter state");

                (
                    counter!(names::WEBHOOK_RETRY_TOTAL),
                    counter!(names::WEBHOOK_SUCCESS_TOTAL),
                    counter!(names::WEBHOOK_FAILURE_TOTAL),
                    gauge!(names::WEBHOOK_SUCCESS_RATE),
                    gauge!(names::DLQ_DEPTH),
                )
            });

        Self {
            recorder,
            handle,
            retries,
            successes,
            failures,
            success_rate,
            dlq_depth,
            values: Mutex::new(Values::default()),
        }
    }

    /// An attempt failed in a retryable way and was rescheduled.
    pub fn record_retry(&self) {
        self.values.lock().retries += 1;
        self.retries.increment(1);
    }

    /// A delivery reached `delivered`. Recomputes the success rate.
    pub fn record_success(&self) {
        let mut values = self.values.lock();
        values.successes += 1;
        self.successes.increment(1);
        self.success_rate.set(values.success_rate());
    }

    /// A delivery reached `failed`. Recomputes the success rate.
    pub fn record_failure(&self) {
        let mut values = self.values.lock();
        values.failures += 1;
        self.failures.increment(1);
        self.success_rate.set(values.success_rate());
    }

    /// An outbox event of `event_type` reached the broker.
    pub fn record_event_published(&self, event_type: &str) {
        *self
            .values
            .lock()
            .events_published
            .entry(event_type.to_string())
            .or_insert(0) += 1;

        metrics::with_local_recorder(&self.recorder, || {
            counter!(names::EVENTS_PUBLISHED_TOTAL, "type" => event_type.to_string())
        })
        .increment(1);
    }

    /// A delivery entered `dead`.
    pub fn increment_dlq_depth(&self) {
        let mut values = self.values.lock();
        values.dlq_depth += 1;
        self.dlq_depth.set(values.dlq_depth as f64);
    }

    /// A dead delivery was replayed.
    pub fn decrement_dlq_depth(&self) {
        let mut values = self.values.lock();
        values.dlq_depth = values.dlq_depth.saturating_sub(1);
        self.dlq_depth.set(values.dlq_depth as f64);
    }

    /// Overwrite the DLQ depth with an authoritative count from the store.
    pub fn set_dlq_depth(&self, depth: u64) {
        let mut values = self.values.lock();
        values.dlq_depth = depth;
        self.dlq_depth.set(depth as f64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let values = self.values.lock();
        MetricsSnapshot {
            retries: values.retries,
            successes: values.successes,
            failures: values.failures,
            success_rate: values.success_rate(),
            dlq_depth: values.dlq_depth,
            events_published: values.events_published.clone(),
        }
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
