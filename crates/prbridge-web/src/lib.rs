//! prbridge Web - HTTP surface and background services
//!
//! This crate provides:
//! - GitHub webhook receiver (signature-verified, queue-backed)
//! - Slack webhook receiver (slash commands, URL verification)
//! - Queued-event processor driving the core dispatcher
//! - Reminder executor running the weekday digest schedule

pub mod api;
pub mod processor;
pub mod reminder_executor;
pub mod slack_webhook;
pub mod webhook;

pub use api::{create_router, AppState};
pub use processor::{WebhookProcessor, WebhookProcessorConfig};
pub use reminder_executor::{ReminderExecutor, ReminderExecutorConfig};
pub use slack_webhook::slack_webhook_handler;
pub use webhook::github_webhook_handler;
