//! Webhook delivery queue
//!
//! Inbound GitHub deliveries are persisted before processing and drained by
//! a polling processor. The delivery id is the idempotency key: GitHub may
//! redeliver on timeout or 5xx, and a redelivered id collapses onto the
//! existing row. Processing failures are retried with exponential backoff
//! until the dead-letter limit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Error, Result};

/// Status of a delivery in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    /// Max retries exceeded; kept for inspection, never retried.
    DeadLetter,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl FromStr for WebhookEventStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            _ => Err(Error::Parse(format!("Invalid webhook event status: {}", s))),
        }
    }
}

/// One queued webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// GitHub delivery id, unique per delivery attempt group.
    pub delivery_id: String,
    /// Event type from the X-GitHub-Event header.
    pub event_type: String,
    /// Raw JSON payload as received.
    pub payload: String,
    pub status: WebhookEventStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(delivery_id: String, event_type: String, payload: String) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            delivery_id,
            event_type,
            payload,
            status: WebhookEventStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            error_message: None,
            next_retry_at: None,
            received_at: now,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Backoff: 1s, 2s, 4s, ...
    pub fn calculate_next_retry(&self) -> DateTime<Utc> {
        let backoff_seconds = 2_i64.pow(self.retry_count as u32);
        Utc::now() + chrono::Duration::seconds(backoff_seconds)
    }

    pub fn mark_processing(&mut self) {
        self.status = WebhookEventStatus::Processing;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self) {
        self.status = WebhookEventStatus::Completed;
        self.processed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: String) {
        self.error_message = Some(error);
        self.updated_at = Utc::now();

        if self.can_retry() {
            self.retry_count += 1;
            self.status = WebhookEventStatus::Pending;
            self.next_retry_at = Some(self.calculate_next_retry());
        } else {
            self.retry_count += 1;
            self.status = WebhookEventStatus::DeadLetter;
            self.next_retry_at = None;
        }
    }
}
