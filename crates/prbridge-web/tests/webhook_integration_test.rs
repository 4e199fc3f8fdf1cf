//! End-to-end webhook receiver tests: signed HTTP request in, queued event
//! out, processed through the dispatcher with a recording Slack sender.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use prbridge_core::{
    github_signature, Database, Organization, PostedMessage, SlackIntegration, SlackMessage,
    SlackSender, UsernameMapping, WebhookEventStatus,
};
use prbridge_web::{AppState, WebhookProcessor, WebhookProcessorConfig};
use secrecy::SecretString;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

const SECRET: &str = "integration-secret";

struct RecordingSender {
    posted: Mutex<Vec<SlackMessage>>,
}

impl RecordingSender {
    fn new() -> Arc<Self> {
        Arc::new(Self { posted: Mutex::new(Vec::new()) })
    }

    fn posted(&self) -> Vec<SlackMessage> {
        self.posted.lock().unwrap().clone()
    }
}

#[async_trait]
impl SlackSender for RecordingSender {
    async fn post_message(
        &self,
        _token: &str,
        message: &SlackMessage,
    ) -> prbridge_core::Result<PostedMessage> {
        let mut posted = self.posted.lock().unwrap();
        posted.push(message.clone());
        Ok(PostedMessage {
            channel: message.channel.clone(),
            ts: format!("5000.{:06}", posted.len()),
        })
    }
}

async fn connected_db() -> Database {
    let db = Database::in_memory().await.unwrap();
    db.upsert_organization(&Organization::new(7, "acme")).await.unwrap();
    db.insert_slack_integration(&SlackIntegration::new(
        7, "T111", "Acme", "xoxb-1", "C123", "eng",
    ))
    .await
    .unwrap();
    db
}

fn router(db: Database) -> axum::Router {
    let state = Arc::new(AppState::new(
        db,
        Some(SecretString::from(SECRET.to_string())),
        None,
    ));
    prbridge_web::create_router(state)
}

fn pr_payload(action: &str, reviewers: &[&str]) -> String {
    let reviewers: Vec<serde_json::Value> =
        reviewers.iter().map(|r| serde_json::json!({"login": r})).collect();
    serde_json::json!({
        "action": action,
        "number": 42,
        "pull_request": {
            "id": 42,
            "number": 42,
            "title": "Add login feature",
            "html_url": "https://github.com/acme/widgets/pull/42",
            "draft": false,
            "merged": false,
            "body": "",
            "requested_reviewers": reviewers
        },
        "repository": {
            "id": 500,
            "full_name": "acme/widgets",
            "owner": {"id": 7, "login": "acme"}
        },
        "sender": {"login": "dave"}
    })
    .to_string()
}

fn signed_request(payload: &str, delivery_id: &str) -> Request<Body> {
    let signature = github_signature(SECRET, payload.as_bytes());
    Request::builder()
        .method(Method::POST)
        .uri("/webhooks/github")
        .header("content-type", "application/json")
        .header("x-github-event", "pull_request")
        .header("x-github-delivery", delivery_id)
        .header("x-hub-signature-256", signature)
        .body(Body::from(payload.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_opened_webhook_produces_root_message_and_thread() {
    let db = connected_db().await;
    let sender = RecordingSender::new();

    let response = router(db.clone())
        .oneshot(signed_request(&pr_payload("opened", &[]), "it-1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let processor =
        WebhookProcessor::new(db.clone(), sender.clone(), WebhookProcessorConfig::default());
    processor.process_batch().await.unwrap();

    // One chat.postMessage with no thread_ts.
    let posted = sender.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].channel, "C123");
    assert!(posted[0].thread_ts.is_none());

    // Thread record persisted with the returned ts.
    let thread = db.get_thread(42).await.unwrap().unwrap();
    assert_eq!(thread.organization_id, 7);
    assert_eq!(thread.thread_ts, Some("5000.000001".to_string()));
}

#[tokio::test]
async fn test_review_requested_replies_with_mapped_mention() {
    let db = connected_db().await;
    db.upsert_username_mapping(&UsernameMapping::new(7, "alice", "U999"))
        .await
        .unwrap();
    let sender = RecordingSender::new();
    let processor =
        WebhookProcessor::new(db.clone(), sender.clone(), WebhookProcessorConfig::default());

    let app = router(db.clone());
    app.clone()
        .oneshot(signed_request(&pr_payload("opened", &[]), "it-1"))
        .await
        .unwrap();
    processor.process_batch().await.unwrap();

    let anchor = db.get_thread(42).await.unwrap().unwrap().thread_ts.unwrap();

    app.oneshot(signed_request(&pr_payload("review_requested", &["alice"]), "it-2"))
        .await
        .unwrap();
    processor.process_batch().await.unwrap();

    let posted = sender.posted();
    assert_eq!(posted.len(), 2);
    assert_eq!(posted[1].thread_ts, Some(anchor));
    let blocks = serde_json::to_string(&posted[1].blocks).unwrap();
    assert!(blocks.contains("<@U999>"));
}

#[tokio::test]
async fn test_redelivered_webhook_does_not_double_post() {
    let db = connected_db().await;
    let sender = RecordingSender::new();
    let app = router(db.clone());

    // GitHub redelivers the same delivery id after a timeout.
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(signed_request(&pr_payload("opened", &[]), "it-dup"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let processor =
        WebhookProcessor::new(db.clone(), sender.clone(), WebhookProcessorConfig::default());
    processor.process_batch().await.unwrap();

    assert_eq!(sender.posted().len(), 1);
    assert_eq!(
        db.count_webhook_events_by_status(WebhookEventStatus::Completed).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_two_distinct_opened_deliveries_single_anchor() {
    let db = connected_db().await;
    let sender = RecordingSender::new();
    let app = router(db.clone());

    // Two distinct deliveries for the same logical "opened" event (GitHub
    // can do this on app reinstalls or manual redelivery).
    for delivery in ["it-a", "it-b"] {
        app.clone()
            .oneshot(signed_request(&pr_payload("opened", &[]), delivery))
            .await
            .unwrap();
    }

    let processor =
        WebhookProcessor::new(db.clone(), sender.clone(), WebhookProcessorConfig::default());
    processor.process_batch().await.unwrap();

    // Exactly one root; the second delivery replied into the anchor.
    let posted = sender.posted();
    assert_eq!(posted.len(), 2);
    assert!(posted[0].thread_ts.is_none());
    assert_eq!(posted[1].thread_ts, Some("5000.000001".to_string()));

    let thread = db.get_thread(42).await.unwrap().unwrap();
    assert_eq!(thread.thread_ts, Some("5000.000001".to_string()));
}

#[tokio::test]
async fn test_unsigned_request_is_never_queued() {
    let db = connected_db().await;
    let app = router(db.clone());

    let payload = pr_payload("opened", &[]);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/github")
        .header("content-type", "application/json")
        .header("x-github-event", "pull_request")
        .header("x-github-delivery", "it-unsigned")
        .body(Body::from(payload))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(db
        .get_webhook_event_by_delivery_id("it-unsigned")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_org_without_integration_completes_quietly() {
    // Organization 99 exists in GitHub but never connected Slack.
    let db = Database::in_memory().await.unwrap();
    let sender = RecordingSender::new();
    let app = router(db.clone());

    let payload = pr_payload("opened", &[]).replace(r#"{"id":7,"login":"acme"}"#, r#"{"id":99,"login":"acme"}"#);
    app.oneshot(signed_request(&payload, "it-noslack")).await.unwrap();

    let processor =
        WebhookProcessor::new(db.clone(), sender.clone(), WebhookProcessorConfig::default());
    processor.process_batch().await.unwrap();

    assert_eq!(
        db.count_webhook_events_by_status(WebhookEventStatus::Completed).await.unwrap(),
        1
    );
    assert!(sender.posted().is_empty());
}
