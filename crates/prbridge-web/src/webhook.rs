//! GitHub webhook receiver
//!
//! Verifies the delivery signature, validates the envelope, and queues the
//! event for asynchronous processing. The handler answers quickly: GitHub
//! times out slow receivers and retries, and the queue (not the HTTP
//! handler) is where processing failures are retried.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use prbridge_core::{verify_github_signature, WebhookEvent};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::api::AppState;

/// Webhook response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: String,
    pub message: String,
}

impl WebhookResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self { status: "ok".to_string(), message: message.into() })
    }

    fn error(message: impl Into<String>) -> Json<Self> {
        Json(Self { status: "error".to_string(), message: message.into() })
    }
}

/// GitHub webhook handler
pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let event_type = match headers.get("x-github-event").and_then(|v| v.to_str().ok()) {
        Some(v) => v.to_string(),
        None => {
            warn!("Missing or invalid X-GitHub-Event header");
            return (
                StatusCode::BAD_REQUEST,
                WebhookResponse::error("Missing X-GitHub-Event header"),
            );
        }
    };

    let delivery_id = headers
        .get("x-github-delivery")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    debug!(
        event_type = %event_type,
        delivery_id = ?delivery_id,
        "Received GitHub webhook"
    );

    if let Some(ref secret) = state.github_webhook_secret {
        let signature = match headers.get("x-hub-signature-256").and_then(|v| v.to_str().ok()) {
            Some(v) => v,
            None => {
                warn!("Missing X-Hub-Signature-256 header");
                return (StatusCode::UNAUTHORIZED, WebhookResponse::error("Missing signature"));
            }
        };

        if !verify_github_signature(secret.expose_secret(), &body, signature) {
            error!(delivery_id = ?delivery_id, "Invalid webhook signature");
            return (StatusCode::UNAUTHORIZED, WebhookResponse::error("Invalid signature"));
        }
    }

    let payload_str = match std::str::from_utf8(&body) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Invalid UTF-8 in payload");
            return (StatusCode::BAD_REQUEST, WebhookResponse::error("Invalid UTF-8 in payload"));
        }
    };

    if let Err(e) = serde_json::from_str::<serde_json::Value>(payload_str) {
        warn!(error = %e, "Failed to parse webhook payload");
        return (
            StatusCode::BAD_REQUEST,
            WebhookResponse::error(format!("Invalid JSON payload: {}", e)),
        );
    }

    // GitHub always sends a delivery id; generate one defensively so a
    // missing header cannot break queue idempotency.
    let delivery_id = delivery_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let webhook_event =
        WebhookEvent::new(delivery_id.clone(), event_type.clone(), payload_str.to_string());

    match state.db.insert_webhook_event(&webhook_event).await {
        Ok(id) => {
            info!(
                event_id = id,
                delivery_id = %delivery_id,
                event_type = %event_type,
                "Webhook event queued"
            );
        }
        Err(e) => {
            // The webhook was received and verified; answer 200 so GitHub
            // doesn't hammer retries while we investigate from logs.
            error!(error = %e, "Failed to queue webhook event");
        }
    }

    (StatusCode::OK, WebhookResponse::ok("Webhook received"))
}
