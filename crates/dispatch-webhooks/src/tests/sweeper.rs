//! Crash recovery through the due-retry sweep.

use super::harness::TestHarness;
use crate::ProcessOutcome;
use dispatch_core::DeliveryStatus;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn sweep_requeues_pending_and_due_retries_only() {
    let h = TestHarness::new().await;
    h.add_endpoint("t-1", "https://a.example.com", true).await;
    let pending = h.single_delivery("t-1", json!({"n": 1})).await;
    let due = h.single_delivery("t-1", json!({"n": 2})).await;
    let not_yet = h.single_delivery("t-1", json!({"n": 3})).await;
    let done = h.single_delivery("t-1", json!({"n": 4})).await;

    h.transport.queue(Ok(500));
    h.executor.process(&due.id).await.unwrap();
    h.make_due(&due.id).await;
    h.transport.queue(Ok(500));
    h.executor.process(&not_yet.id).await.unwrap();
    h.transport.queue(Ok(200));
    h.executor.process(&done.id).await.unwrap();

    let before = h.enqueued().len();
    let report = h.sweeper(10).sweep_once().await.unwrap();

    assert_eq!(report.due, 2);
    assert_eq!(report.enqueued, 2);
    let swept = &h.enqueued()[before..];
    assert!(swept.contains(&pending.id.to_string()));
    assert!(swept.contains(&due.id.to_string()));
}

#[tokio::test]
async fn sweep_respects_batch_size() {
    let h = TestHarness::new().await;
    h.add_endpoint("t-1", "https://a.example.com", true).await;
    for n in 0..5 {
        h.single_delivery("t-1", json!({ "n": n })).await;
    }

    let report = h.sweeper(3).sweep_once().await.unwrap();
    assert_eq!(report.due, 3);
}

#[tokio::test]
async fn lost_timer_is_recovered_by_sweep() {
    let h = TestHarness::new().await;
    h.add_endpoint("t-1", "https://a.example.com", true).await;
    let delivery = h.single_delivery("t-1", json!({})).await;
    h.transport.queue(Ok(502));
    h.executor.process(&delivery.id).await.unwrap();

    // Process restart: armed timers are gone.
    h.scheduler.shutdown();
    h.make_due(&delivery.id).await;

    let report = h.sweeper(10).sweep_once().await.unwrap();
    assert_eq!(report.enqueued, 1);
    assert_eq!(
        h.executor.process(&delivery.id).await.unwrap(),
        ProcessOutcome::Delivered
    );
    assert_eq!(h.load(&delivery.id).await.status(), DeliveryStatus::Delivered);
}

#[tokio::test]
async fn sweep_refreshes_dlq_depth_from_store() {
    let h = TestHarness::new().await;
    let endpoint = h.add_endpoint("t-1", "https://a.example.com", true).await;
    let a = h.single_delivery("t-1", json!({"n": 1})).await;
    let b = h.single_delivery("t-1", json!({"n": 2})).await;
    h.set_enabled(&endpoint, false).await;
    h.executor.process(&a.id).await.unwrap();
    h.executor.process(&b.id).await.unwrap();

    // Drift, as after a restart with a fresh registry.
    h.metrics.set_dlq_depth(0);

    let report = h.sweeper(10).sweep_once().await.unwrap();
    assert_eq!(report.dlq_depth, 2);
    assert_eq!(h.metrics.snapshot().dlq_depth, 2);
}

#[tokio::test]
async fn started_sweeper_stops_cleanly() {
    let h = TestHarness::new().await;
    h.add_endpoint("t-1", "https://a.example.com", true).await;
    let delivery = h.single_delivery("t-1", json!({})).await;
    let before = h.enqueued().len();

    let handle = h.sweeper(10).start();
    for _ in 0..100 {
        if h.enqueued().len() > before {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop().await;

    assert!(h.enqueued()[before..].contains(&delivery.id.to_string()));
}
