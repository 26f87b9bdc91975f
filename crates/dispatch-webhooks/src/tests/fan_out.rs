//! Delivery creation.

use super::harness::TestHarness;
use dispatch_broker::publish_json;
use dispatch_core::{DeliveryStatus, EventEnvelope, TenantId};
use dispatch_database::{queries, DeliveryFilter};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn creates_one_pending_delivery_per_enabled_endpoint() {
    let h = TestHarness::new().await;
    let mut enabled = HashSet::new();
    for n in 0..3 {
        let endpoint = h
            .add_endpoint("t-1", &format!("https://hooks.example.com/{n}"), true)
            .await;
        enabled.insert(endpoint.id);
    }
    h.add_endpoint("t-1", "https://hooks.example.com/off", false).await;

    let event = h.event("t-1", "order.created", json!({"orderId": "o-1"}));
    let created = h.creator.handle_event(&event).await.unwrap();

    assert_eq!(created.len(), 3);
    for delivery in &created {
        assert_eq!(delivery.status(), DeliveryStatus::Pending);
        assert_eq!(delivery.attempts, 0);
        assert_eq!(delivery.payload, json!({"orderId": "o-1"}));
        assert_eq!(delivery.event_id, event.event_id);
        assert!(enabled.contains(&delivery.endpoint_id));
    }

    let enqueued: HashSet<String> = h.enqueued().into_iter().collect();
    let expected: HashSet<String> = created.iter().map(|d| d.id.to_string()).collect();
    assert_eq!(enqueued, expected);
}

#[tokio::test]
async fn other_tenants_endpoints_are_ignored() {
    let h = TestHarness::new().await;
    h.add_endpoint("t-1", "https://a.example.com", true).await;
    h.add_endpoint("t-2", "https://b.example.com", true).await;

    let event = h.event("t-2", "return.created", json!({}));
    let created = h.creator.handle_event(&event).await.unwrap();

    assert_eq!(created.len(), 1);
    assert_eq!(created[0].tenant_id.as_str(), "t-2");
}

#[tokio::test]
async fn tenant_without_endpoints_creates_nothing() {
    let h = TestHarness::new().await;
    let event = h.event("t-9", "order.created", json!({}));

    assert!(h.creator.handle_event(&event).await.unwrap().is_empty());
    assert!(h.enqueued().is_empty());
}

#[tokio::test]
async fn internal_events_are_not_fanned_out() {
    let h = TestHarness::new().await;
    h.add_endpoint("t-1", "https://a.example.com", true).await;

    let event = h.event("t-1", "webhook.delivery_updated", json!({"status": "delivered"}));
    assert!(h.creator.handle_event(&event).await.unwrap().is_empty());
    assert!(h.enqueued().is_empty());
}

#[tokio::test]
async fn redelivered_event_does_not_duplicate_deliveries() {
    let h = TestHarness::new().await;
    h.add_endpoint("t-1", "https://a.example.com", true).await;
    h.add_endpoint("t-1", "https://b.example.com", true).await;

    let event = h.event("t-1", "order.updated", json!({"v": 2}));
    assert_eq!(h.creator.handle_event(&event).await.unwrap().len(), 2);

    // Same envelope again, as after a broker redelivery.
    let again: EventEnvelope = serde_json::from_value(serde_json::to_value(&event).unwrap()).unwrap();
    assert!(h.creator.handle_event(&again).await.unwrap().is_empty());
    assert_eq!(h.enqueued().len(), 2);
}

#[tokio::test]
async fn enqueue_failure_leaves_delivery_for_the_sweeper() {
    let h = TestHarness::new().await;
    h.add_endpoint("t-1", "https://a.example.com", true).await;
    h.broker.fail_next_publishes(1);

    let event = h.event("t-1", "order.created", json!({}));
    let created = h.creator.handle_event(&event).await.unwrap();
    assert_eq!(created.len(), 1);
    assert!(h.enqueued().is_empty());

    let report = h.sweeper(10).sweep_once().await.unwrap();
    assert_eq!(report.enqueued, 1);
    assert_eq!(h.enqueued(), vec![created[0].id.to_string()]);
}

async fn rename_endpoints(h: &TestHarness, from: &'static str, to: &'static str) {
    h.db
        .call(move |conn| {
            conn.execute_batch(&format!("ALTER TABLE {from} RENAME TO {to}"))?;
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn event_that_fails_fan_out_once_is_retried() {
    let h = TestHarness::new().await;
    let endpoint = h.add_endpoint("t-1", "https://a.example.com", true).await;

    // Endpoint lookups fail until the table is restored.
    rename_endpoints(&h, "endpoints", "endpoints_offline").await;
    let event = h.event("t-1", "order.created", json!({"orderId": "o-7"}));
    let err = h.creator.handle_event(&event).await.unwrap_err();
    assert!(!err.is_poison());

    let topics = vec!["order.created".to_string()];
    let creators = h
        .creator
        .clone()
        .start(&h.broker, &topics, "dispatch-creator")
        .await
        .unwrap();
    publish_json(&h.broker, "order.created", &event).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    rename_endpoints(&h, "endpoints_offline", "endpoints").await;

    let mut deliveries = Vec::new();
    for _ in 0..100 {
        deliveries = h
            .db
            .call(|conn| {
                queries::list_deliveries(conn, &DeliveryFilter::for_tenant(TenantId::from("t-1")))
            })
            .await
            .unwrap();
        if !deliveries.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    for creator in creators {
        creator.stop().await;
    }
    h.scheduler.shutdown();

    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].endpoint_id, endpoint.id);
    assert_eq!(deliveries[0].event_id, event.event_id);
    assert_eq!(h.broker.unacked("order.created", "dispatch-creator"), 0);
}
