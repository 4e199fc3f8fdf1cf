//! Webhook event processor
//!
//! Polls the webhook_events queue and drives each delivery through the core
//! dispatcher. Processing is deliberately decoupled from the HTTP receiver:
//! the receiver answers GitHub fast, and this loop absorbs Slack latency,
//! retries, and contention.

use prbridge_core::{
    Database, DispatchOutcome, Error, Notifier, PullRequestEvent, SlackSender, WebhookEvent,
    WebhookEventStatus,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

/// Webhook event processor configuration
#[derive(Clone, Debug)]
pub struct WebhookProcessorConfig {
    /// Number of events to poll per batch
    pub batch_size: i64,
    /// Polling interval in seconds
    pub poll_interval_secs: u64,
}

impl Default for WebhookProcessorConfig {
    fn default() -> Self {
        Self { batch_size: 10, poll_interval_secs: 5 }
    }
}

/// Webhook event processor
pub struct WebhookProcessor {
    database: Database,
    notifier: Notifier,
    config: WebhookProcessorConfig,
}

impl WebhookProcessor {
    pub fn new(
        database: Database,
        slack: Arc<dyn SlackSender>,
        config: WebhookProcessorConfig,
    ) -> Self {
        let notifier = Notifier::new(database.clone(), slack);
        Self { database, notifier, config }
    }

    /// Run the processor loop (blocking)
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            batch_size = self.config.batch_size,
            "Starting webhook event processor"
        );

        loop {
            if let Err(e) = self.process_batch().await {
                error!(error = %e, "Error processing webhook event batch");
            }

            sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
        }
    }

    /// Process a batch of pending events
    pub async fn process_batch(&self) -> prbridge_core::Result<()> {
        let events = self
            .database
            .get_pending_webhook_events(self.config.batch_size)
            .await?;

        if events.is_empty() {
            debug!("No pending webhook events to process");
            return Ok(());
        }

        info!(count = events.len(), "Processing webhook events");

        for event in events {
            if let Err(e) = self.process_event(event).await {
                error!(error = %e, "Failed to process webhook event");
            }
        }

        Ok(())
    }

    /// Drive a single delivery to completed / pending-retry / dead-letter.
    async fn process_event(&self, mut event: WebhookEvent) -> prbridge_core::Result<()> {
        debug!(
            delivery_id = %event.delivery_id,
            event_type = %event.event_type,
            retry_count = event.retry_count,
            "Processing webhook event"
        );

        event.mark_processing();
        self.database.update_webhook_event(&event).await?;

        match self.handle_event(&event).await {
            Ok(()) => {
                event.mark_completed();
                self.database.update_webhook_event(&event).await?;
                info!(
                    delivery_id = %event.delivery_id,
                    "Webhook event processed"
                );
            }
            Err(e) => {
                // Contention on the thread anchor is an expected operating
                // condition under duplicate deliveries, not an anomaly; the
                // retry will take the reply path.
                match e {
                    Error::ThreadContended(pr_id) => {
                        debug!(
                            delivery_id = %event.delivery_id,
                            pr_id,
                            "Thread anchor contended, scheduling retry"
                        );
                    }
                    ref other => {
                        warn!(
                            delivery_id = %event.delivery_id,
                            error = %other,
                            retry_count = event.retry_count,
                            "Webhook event processing failed"
                        );
                    }
                }

                event.mark_failed(e.to_string());
                self.database.update_webhook_event(&event).await?;

                if event.status == WebhookEventStatus::DeadLetter {
                    error!(
                        delivery_id = %event.delivery_id,
                        "Webhook event moved to dead letter queue after max retries"
                    );
                }
            }
        }

        Ok(())
    }

    async fn handle_event(&self, event: &WebhookEvent) -> prbridge_core::Result<()> {
        match event.event_type.as_str() {
            "pull_request" => self.handle_pull_request(event).await,
            _ => {
                // Unknown event type: routed, no-op, not an error.
                debug!(event_type = %event.event_type, "No handler for event type");
                Ok(())
            }
        }
    }

    async fn handle_pull_request(&self, event: &WebhookEvent) -> prbridge_core::Result<()> {
        let Some(pr_event) = PullRequestEvent::from_payload(&event.payload)? else {
            // Unresolvable payload (no owner, missing fields): skip quietly.
            return Ok(());
        };

        let outcome = self.notifier.dispatch(&pr_event).await?;
        match outcome {
            DispatchOutcome::Posted { ref thread_ts, reply } => {
                debug!(
                    pr_id = pr_event.pull_request_id,
                    thread_ts = %thread_ts,
                    reply,
                    "Notification posted"
                );
            }
            DispatchOutcome::Skipped { reason } => {
                debug!(
                    pr_id = pr_event.pull_request_id,
                    reason = ?reason,
                    "Notification skipped"
                );
            }
        }
        Ok(())
    }
}
