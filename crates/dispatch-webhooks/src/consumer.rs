//! Broker consumer loop shared by the creator and the execution worker.

use crate::WebhookResult;
use async_trait::async_trait;
use dispatch_broker::{BrokerMessage, Subscription};
use dispatch_core::WorkerHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, error, info, warn};

/// Pause after a failed read before polling the broker again.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Pause after a transient handler error before the message is read again.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

#[async_trait]
pub(crate) trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &BrokerMessage) -> WebhookResult<()>;
}

/// Read messages one at a time and hand each to `handler` until stopped.
///
/// Handled and poison messages are acknowledged. A message that hits a
/// transient error is released back to the subscription and read again
/// after [`RETRY_PAUSE`], ahead of newer messages.
pub(crate) fn spawn_consumer(
    name: impl Into<String>,
    mut subscription: Box<dyn Subscription>,
    handler: Arc<dyn MessageHandler>,
) -> WorkerHandle {
    let name = name.into();
    let loop_name = name.clone();

    WorkerHandle::spawn(name, move |mut shutdown_rx| async move {
        info!(worker = %loop_name, topic = %subscription.topic(), "Consumer started");

        loop {
            if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }

            let message = match subscription.next().await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker = %loop_name, error = %e, "Broker read failed");
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => continue,
                    }
                }
            };

            let ack = match handler.handle(&message).await {
                Ok(()) => true,
                Err(e) if e.is_poison() => {
                    warn!(
                        worker = %loop_name,
                        message_id = %message.id,
                        error = %e,
                        "Dropping unprocessable message"
                    );
                    true
                }
                Err(e) => {
                    error!(
                        worker = %loop_name,
                        message_id = %message.id,
                        error = %e,
                        "Message handling failed, will retry"
                    );
                    false
                }
            };

            if ack {
                if let Err(e) = subscription.ack(&message).await {
                    warn!(worker = %loop_name, message_id = %message.id, error = %e, "Ack failed");
                }
                continue;
            }

            if let Err(e) = subscription.release(&message).await {
                warn!(worker = %loop_name, message_id = %message.id, error = %e, "Release failed");
            }
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = tokio::time::sleep(RETRY_PAUSE) => {}
            }
        }

        debug!(worker = %loop_name, "Consumer stopping");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WebhookError;
    use dispatch_broker::{Broker, InMemoryBroker};
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: &BrokerMessage) -> WebhookResult<()> {
            self.seen.lock().push(message.payload.clone());
            match message.payload.as_slice() {
                b"poison" => Err(WebhookError::Json(
                    serde_json::from_slice::<serde_json::Value>(b"{").unwrap_err(),
                )),
                b"transient" => Err(WebhookError::Http("connection refused".into())),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn acks_handled_and_poison_messages_only() {
        let broker = InMemoryBroker::with_poll_timeout(Duration::from_millis(10));
        let subscription = broker.subscribe("t", "g").await.unwrap();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let handle = spawn_consumer("test-consumer", subscription, recorder.clone());

        broker.publish("t", b"ok").await.unwrap();
        broker.publish("t", b"poison").await.unwrap();
        broker.publish("t", b"transient").await.unwrap();

        for _ in 0..200 {
            if recorder.seen.lock().len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.stop().await;

        assert!(recorder.seen.lock().len() >= 3);
        assert_eq!(broker.unacked("t", "g"), 1);
    }

    /// Fails with a transient error on the first call, then succeeds.
    struct FlakyOnce {
        calls: Mutex<usize>,
        handled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for FlakyOnce {
        async fn handle(&self, message: &BrokerMessage) -> WebhookResult<()> {
            let call = {
                let mut calls = self.calls.lock();
                *calls += 1;
                *calls
            };
            if call == 1 {
                return Err(WebhookError::Http("connection reset".into()));
            }
            self.handled.lock().push(message.id.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_until_handled() {
        let broker = InMemoryBroker::with_poll_timeout(Duration::from_millis(10));
        let subscription = broker.subscribe("t", "g").await.unwrap();
        let handler = Arc::new(FlakyOnce {
            calls: Mutex::new(0),
            handled: Mutex::new(Vec::new()),
        });
        let handle = spawn_consumer("flaky", subscription, handler.clone());

        let id = broker.publish("t", b"event").await.unwrap();

        for _ in 0..100 {
            if !handler.handled.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        handle.stop().await;

        assert_eq!(*handler.calls.lock(), 2);
        assert_eq!(*handler.handled.lock(), vec![id]);
        assert_eq!(broker.unacked("t", "g"), 0);
    }

    #[tokio::test]
    async fn stop_ends_an_idle_consumer() {
        let broker = InMemoryBroker::with_poll_timeout(Duration::from_millis(10));
        let subscription = broker.subscribe("t", "g").await.unwrap();
        let handle = spawn_consumer(
            "idle",
            subscription,
            Arc::new(Recorder {
                seen: Mutex::new(Vec::new()),
            }),
        );
        assert!(handle.is_running());
        handle.stop().await;
    }
}
