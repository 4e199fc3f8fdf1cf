//! prbridge Core - domain types, persistence, and Slack dispatch
//!
//! This crate provides the event-to-thread mapping engine:
//! - Webhook signature verification (GitHub and Slack schemes)
//! - Pull-request event normalization
//! - SQLite persistence: organizations, integrations, username mappings,
//!   thread state, throttle records, the delivery queue
//! - Slack message composition and dispatch
//! - The outstanding-PR reminder digest

pub mod cron;
pub mod database;
#[cfg(test)]
mod database_webhook_tests;
pub mod error;
pub mod event;
pub mod model;
pub mod notify;
pub mod queue;
pub mod reminder;
pub mod resolver;
pub mod signature;
pub mod slack;

pub use cron::{CronSchedule, WEEKDAY_MORNINGS};
pub use database::{Database, DatabaseConfig, SLACK_THROTTLE_TTL_SECS};
pub use error::{Error, Result};
pub use event::{PullRequestAction, PullRequestEvent};
pub use model::{
    Organization, PullRequestThread, ReminderRun, SlackApiThrottle, SlackIntegration,
    SubscriptionStatus, ThreadState, ThrottleKind, UsernameMapping,
};
pub use notify::{DispatchOutcome, Notifier, SkipReason};
pub use queue::{WebhookEvent, WebhookEventStatus};
pub use reminder::{ReminderReport, ReminderService};
pub use resolver::IntegrationResolver;
pub use signature::{
    github_signature, slack_signature, verify_github_signature, verify_slack_signature,
};
pub use slack::{
    PostedMessage, SlackApiClient, SlackBlock, SlackMessage, SlackSender, SlackText, SlackUser,
};
