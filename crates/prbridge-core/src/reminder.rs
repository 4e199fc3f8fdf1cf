//! Outstanding-PR digest reminders
//!
//! Scans open pull-request threads, groups them by organization/channel,
//! and posts one digest root message per group. Groups are independent
//! failure units: one organization's Slack outage must not cost the others
//! their reminder, so per-group errors are logged and counted, never
//! propagated.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::model::PullRequestThread;
use crate::resolver::IntegrationResolver;
use crate::slack::{SlackBlock, SlackMessage, SlackSender, SlackText};
use crate::{Database, Result};

/// Outcome of one reminder sweep. Partial success is expected and recorded,
/// not escalated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderReport {
    pub groups_total: usize,
    pub groups_failed: usize,
    pub prs_listed: usize,
}

pub struct ReminderService {
    db: Database,
    resolver: IntegrationResolver,
    slack: Arc<dyn SlackSender>,
}

impl ReminderService {
    pub fn new(db: Database, slack: Arc<dyn SlackSender>) -> Self {
        let resolver = IntegrationResolver::new(db.clone());
        Self { db, resolver, slack }
    }

    /// Run one sweep over all outstanding pull requests.
    pub async fn run_once(&self) -> Result<ReminderReport> {
        let open = self.db.list_open_threads().await?;

        // BTreeMap keeps organization order deterministic.
        let mut groups: BTreeMap<i64, Vec<PullRequestThread>> = BTreeMap::new();
        for thread in open {
            groups.entry(thread.organization_id).or_default().push(thread);
        }

        let mut report = ReminderReport { groups_total: 0, groups_failed: 0, prs_listed: 0 };

        for (organization_id, threads) in groups {
            let Some(integration) = self.resolver.resolve(organization_id).await? else {
                debug!(organization_id, "No Slack integration, skipping reminder group");
                continue;
            };

            report.groups_total += 1;
            let message = digest_message(&integration.channel_id, &threads);

            match self.slack.post_message(&integration.access_token, &message).await {
                Ok(_) => {
                    report.prs_listed += threads.len();
                    info!(
                        organization_id,
                        channel = %integration.channel_id,
                        prs = threads.len(),
                        "Posted PR reminder digest"
                    );
                }
                Err(e) => {
                    report.groups_failed += 1;
                    warn!(
                        organization_id,
                        channel = %integration.channel_id,
                        error = %e,
                        "Failed to post reminder digest"
                    );
                }
            }
        }

        Ok(report)
    }
}

/// One digest root message listing every outstanding PR for a group.
/// Reminders are never threaded.
fn digest_message(channel_id: &str, threads: &[PullRequestThread]) -> SlackMessage {
    let mut lines = Vec::with_capacity(threads.len());
    for thread in threads {
        let badge = if thread.draft { " (draft)" } else { "" };
        lines.push(format!(
            "• <{}|#{} {}>{} — {}",
            thread.url, thread.number, thread.title, badge, thread.repository
        ));
    }

    let blocks = vec![
        SlackBlock::Header {
            text: SlackText::plain(format!("⏰ {} open pull requests", threads.len())),
        },
        SlackBlock::Section {
            text: SlackText::mrkdwn(lines.join("\n")),
        },
    ];

    let fallback = format!("{} open pull requests waiting for review", threads.len());
    SlackMessage::new(channel_id, fallback).with_blocks(blocks)
}
