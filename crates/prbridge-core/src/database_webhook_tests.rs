use crate::{Database, WebhookEvent, WebhookEventStatus};

fn event(delivery_id: &str) -> WebhookEvent {
    WebhookEvent::new(
        delivery_id.to_string(),
        "pull_request".to_string(),
        r#"{"action":"opened"}"#.to_string(),
    )
}

#[tokio::test]
async fn test_insert_webhook_event() {
    let db = Database::in_memory().await.unwrap();

    let id = db.insert_webhook_event(&event("delivery-1")).await.unwrap();
    assert!(id > 0);
}

#[tokio::test]
async fn test_insert_is_idempotent_on_delivery_id() {
    let db = Database::in_memory().await.unwrap();

    let id1 = db.insert_webhook_event(&event("delivery-1")).await.unwrap();
    let id2 = db.insert_webhook_event(&event("delivery-1")).await.unwrap();

    assert_eq!(id1, id2);
    assert_eq!(
        db.count_webhook_events_by_status(WebhookEventStatus::Pending)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_get_by_delivery_id() {
    let db = Database::in_memory().await.unwrap();
    db.insert_webhook_event(&event("delivery-abc")).await.unwrap();

    let fetched = db
        .get_webhook_event_by_delivery_id("delivery-abc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.event_type, "pull_request");
    assert_eq!(fetched.status, WebhookEventStatus::Pending);

    assert!(db
        .get_webhook_event_by_delivery_id("missing")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_pending_respects_retry_time() {
    let db = Database::in_memory().await.unwrap();

    let mut delayed = event("delivery-delayed");
    delayed.next_retry_at = Some(chrono::Utc::now() + chrono::Duration::hours(1));
    db.insert_webhook_event(&delayed).await.unwrap();

    db.insert_webhook_event(&event("delivery-ready")).await.unwrap();

    let pending = db.get_pending_webhook_events(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].delivery_id, "delivery-ready");
}

#[tokio::test]
async fn test_status_transitions_persist() {
    let db = Database::in_memory().await.unwrap();
    db.insert_webhook_event(&event("delivery-1")).await.unwrap();

    let mut stored = db
        .get_webhook_event_by_delivery_id("delivery-1")
        .await
        .unwrap()
        .unwrap();

    stored.mark_processing();
    db.update_webhook_event(&stored).await.unwrap();
    stored.mark_completed();
    db.update_webhook_event(&stored).await.unwrap();

    let completed = db
        .get_webhook_events_by_status(WebhookEventStatus::Completed, 10)
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert!(completed[0].processed_at.is_some());
}

#[tokio::test]
async fn test_dead_letter_persists() {
    let db = Database::in_memory().await.unwrap();
    db.insert_webhook_event(&event("delivery-1")).await.unwrap();

    let mut stored = db
        .get_webhook_event_by_delivery_id("delivery-1")
        .await
        .unwrap()
        .unwrap();

    for _ in 0..4 {
        stored.mark_failed("handler exploded".to_string());
    }
    assert_eq!(stored.status, WebhookEventStatus::DeadLetter);
    db.update_webhook_event(&stored).await.unwrap();

    assert_eq!(
        db.count_webhook_events_by_status(WebhookEventStatus::DeadLetter)
            .await
            .unwrap(),
        1
    );
    assert!(db.get_pending_webhook_events(10).await.unwrap().is_empty());
}
