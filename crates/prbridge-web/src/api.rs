//! Router and shared application state

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use prbridge_core::Database;
use secrecy::SecretString;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state for the HTTP handlers.
///
/// Secrets are wrapped so they cannot leak through Debug output; when a
/// secret is absent the corresponding verification is skipped (local
/// development only — production always configures both).
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub github_webhook_secret: Option<SecretString>,
    pub slack_signing_secret: Option<SecretString>,
}

impl AppState {
    pub fn new(
        db: Database,
        github_webhook_secret: Option<SecretString>,
        slack_signing_secret: Option<SecretString>,
    ) -> Self {
        Self { db, github_webhook_secret, slack_signing_secret }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Build the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/github", post(crate::webhook::github_webhook_handler))
        .route("/webhooks/slack", post(crate::slack_webhook::slack_webhook_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
