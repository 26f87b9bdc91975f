//! Delivery scheduler.
//!
//! Puts `{deliveryId}` on the deliver topic now, or after a delay using an
//! in-process timer. Timers are an optimization only: the persisted
//! `next_attempt_at` plus the sweeper recover anything a lost timer misses.

use crate::WebhookResult;
use dispatch_broker::{publish_json, BrokerHandle};
use dispatch_core::{DeliverMessage, DeliveryId, DELIVER_TOPIC};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub struct DeliveryScheduler {
    broker: BrokerHandle,
    timers: Mutex<JoinSet<()>>,
}

impl DeliveryScheduler {
    pub fn new(broker: BrokerHandle) -> Self {
        Self {
            broker,
            timers: Mutex::new(JoinSet::new()),
        }
    }

    /// Enqueue an attempt for `delivery_id` after `delay`.
    ///
    /// A zero delay publishes before returning and reports broker errors.
    /// Delayed publishes run on a timer task and only log failures.
    pub async fn schedule(&self, delivery_id: &DeliveryId, delay: Duration) -> WebhookResult<()> {
        let message = DeliverMessage {
            delivery_id: delivery_id.clone(),
        };

        if delay.is_zero() {
            publish_json(self.broker.as_ref(), DELIVER_TOPIC, &message).await?;
            debug!(delivery_id = %delivery_id, "Delivery enqueued");
            return Ok(());
        }

        let broker = self.broker.clone();
        let mut timers = self.timers.lock();
        while timers.try_join_next().is_some() {}
        timers.spawn(async move {
            tokio::time::sleep(delay).await;
            match publish_json(broker.as_ref(), DELIVER_TOPIC, &message).await {
                Ok(_) => debug!(delivery_id = %message.delivery_id, "Delayed delivery enqueued"),
                Err(e) => warn!(
                    delivery_id = %message.delivery_id,
                    error = %e,
                    "Delayed enqueue failed, sweeper will pick it up"
                ),
            }
        });

        debug!(
            delivery_id = %delivery_id,
            delay_ms = delay.as_millis() as u64,
            "Delivery timer armed"
        );
        Ok(())
    }

    /// Timers armed and not yet fired.
    pub fn pending_timers(&self) -> usize {
        let mut timers = self.timers.lock();
        while timers.try_join_next().is_some() {}
        timers.len()
    }

    /// Abort every armed timer.
    pub fn shutdown(&self) {
        let mut timers = self.timers.lock();
        let armed = timers.len();
        timers.abort_all();
        info!(armed, "Delivery scheduler stopped");
    }
}
