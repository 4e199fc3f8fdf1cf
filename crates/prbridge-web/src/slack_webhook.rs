//! Slack webhook receiver
//!
//! Handles Slack's inbound callbacks: URL verification challenges and slash
//! commands. Requests carry `X-Slack-Signature` and
//! `X-Slack-Request-Timestamp`; stale timestamps are rejected before the
//! signature is compared, blocking replays of captured requests.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use prbridge_core::verify_slack_signature;
use secrecy::ExposeSecret;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::AppState;

#[derive(Debug, Serialize)]
struct SlashAck {
    response_type: &'static str,
    text: String,
}

/// Slack webhook handler
pub async fn slack_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(ref secret) = state.slack_signing_secret {
        let timestamp = headers
            .get("x-slack-request-timestamp")
            .and_then(|v| v.to_str().ok());
        let signature = headers.get("x-slack-signature").and_then(|v| v.to_str().ok());

        let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
            warn!("Missing Slack signature headers");
            return (StatusCode::UNAUTHORIZED, "missing signature".to_string()).into_response();
        };

        if !verify_slack_signature(secret.expose_secret(), timestamp, &body, signature, Utc::now())
        {
            warn!("Invalid or stale Slack request signature");
            return (StatusCode::UNAUTHORIZED, "invalid signature".to_string()).into_response();
        }
    }

    // URL verification handshake: echo the challenge back as plain text.
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body) {
        if value.get("type").and_then(|t| t.as_str()) == Some("url_verification") {
            let challenge = value
                .get("challenge")
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_string();
            debug!("Answering Slack URL verification challenge");
            return (StatusCode::OK, challenge).into_response();
        }
    }

    // Everything else (slash commands are form-encoded) gets an ephemeral
    // acknowledgement; the bridge has no interactive command surface yet.
    debug!("Acknowledged Slack callback");
    (
        StatusCode::OK,
        Json(SlashAck {
            response_type: "ephemeral",
            text: "prbridge is watching your pull requests.".to_string(),
        }),
    )
        .into_response()
}
