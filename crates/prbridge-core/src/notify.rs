//! Notification composition and dispatch
//!
//! One pull-request event comes in, at most one Slack message goes out.
//! The decision is keyed by the stored thread anchor: no anchor yet means a
//! root message whose `ts` becomes the anchor; an existing anchor means a
//! threaded reply.
//!
//! The root path runs under a per-PR advisory lock for the whole
//! read-thread → post → claim-anchor window, because GitHub retries
//! deliveries and two racing first deliveries must not both post a root.
//! A contended lock is reported as [`Error::ThreadContended`] so the queue
//! retries the event; by then the anchor exists and the reply path is
//! taken. Slack failures never write thread state, which keeps a retry
//! safe: no partial state was committed.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::event::{PullRequestAction, PullRequestEvent};
use crate::model::{PullRequestThread, SlackIntegration, ThreadState};
use crate::resolver::IntegrationResolver;
use crate::slack::{SlackBlock, SlackMessage, SlackSender, SlackText};
use crate::{Database, Error, Result};

/// TTL of the per-PR advisory lock, generous enough to cover one Slack
/// round trip but short enough to unwedge a crashed holder.
const PR_LOCK_TTL_SECS: i64 = 60;

/// Why an event produced no notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Action carries no notification (unknown or uninteresting).
    IgnoredAction,
    /// Organization has no Slack integration connected.
    NoIntegration,
}

/// Terminal state of one dispatch. Failures are the error path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Posted { thread_ts: String, reply: bool },
    Skipped { reason: SkipReason },
}

/// Composes and posts Slack notifications for pull-request events.
///
/// Holds only injected collaborators; construct one per processing scope.
pub struct Notifier {
    db: Database,
    resolver: IntegrationResolver,
    slack: Arc<dyn SlackSender>,
}

impl Notifier {
    pub fn new(db: Database, slack: Arc<dyn SlackSender>) -> Self {
        let resolver = IntegrationResolver::new(db.clone());
        Self { db, resolver, slack }
    }

    /// Process one normalized event to a terminal state.
    pub async fn dispatch(&self, event: &PullRequestEvent) -> Result<DispatchOutcome> {
        if !event.action.notifies() {
            debug!(
                action = event.action.as_str(),
                pr_id = event.pull_request_id,
                "Action produces no notification"
            );
            return Ok(DispatchOutcome::Skipped { reason: SkipReason::IgnoredAction });
        }

        let Some(integration) = self.resolver.resolve(event.organization_id).await? else {
            return Ok(DispatchOutcome::Skipped { reason: SkipReason::NoIntegration });
        };

        match self.db.get_thread(event.pull_request_id).await? {
            Some(thread) if thread.is_anchored() => {
                self.post_reply(event, &integration, &thread).await
            }
            _ => self.post_root(event, &integration).await,
        }
    }

    /// Root path: post a new thread root and claim its anchor, guarded by
    /// the per-PR advisory lock.
    async fn post_root(
        &self,
        event: &PullRequestEvent,
        integration: &SlackIntegration,
    ) -> Result<DispatchOutcome> {
        let lock_key = format!("pr:{}", event.pull_request_id);
        if !self
            .db
            .try_acquire_lock(&lock_key, PR_LOCK_TTL_SECS, Utc::now())
            .await?
        {
            debug!(
                pr_id = event.pull_request_id,
                "Another delivery holds the thread lock"
            );
            return Err(Error::ThreadContended(event.pull_request_id));
        }

        let result = self.post_root_locked(event, integration).await;

        // Released on every exit path; failures here only shorten the TTL.
        if let Err(e) = self.db.release_lock(&lock_key).await {
            warn!(pr_id = event.pull_request_id, error = %e, "Failed to release thread lock");
        }

        result
    }

    async fn post_root_locked(
        &self,
        event: &PullRequestEvent,
        integration: &SlackIntegration,
    ) -> Result<DispatchOutcome> {
        // Re-check under the lock: a racing delivery may have anchored the
        // thread between our first read and the lock acquisition.
        if let Some(thread) = self.db.get_thread(event.pull_request_id).await? {
            if thread.is_anchored() {
                return self.post_reply(event, integration, &thread).await;
            }
        }

        let message = self.compose_root(event, integration).await?;
        let posted = self
            .slack
            .post_message(&integration.access_token, &message)
            .await?;

        // Only a successful post writes thread state; a Slack failure above
        // bails out with nothing committed, so a redelivery can retry.
        let thread = PullRequestThread::from_event(event);
        let stored = self.db.claim_thread_anchor(&thread, &posted.ts).await?;
        let thread_ts = stored
            .thread_ts
            .unwrap_or(posted.ts);

        info!(
            pr_id = event.pull_request_id,
            number = event.number,
            repository = %event.repository,
            channel = %integration.channel_id,
            "Posted thread root"
        );

        Ok(DispatchOutcome::Posted { thread_ts, reply: false })
    }

    /// Reply path: post into the existing thread and refresh the stored
    /// draft/state flags.
    async fn post_reply(
        &self,
        event: &PullRequestEvent,
        integration: &SlackIntegration,
        thread: &PullRequestThread,
    ) -> Result<DispatchOutcome> {
        let thread_ts = thread
            .thread_ts
            .clone()
            .ok_or_else(|| Error::Other(format!("Reply without anchor for PR {}", thread.pr_id)))?;

        let message = self
            .compose_reply(event, integration)
            .await?
            .in_thread(thread_ts.clone());

        self.slack
            .post_message(&integration.access_token, &message)
            .await?;

        let state = if event.action == PullRequestAction::Closed {
            ThreadState::Closed
        } else {
            ThreadState::Open
        };
        self.db
            .record_thread_event(event.pull_request_id, event.draft, state, &event.title)
            .await?;

        info!(
            pr_id = event.pull_request_id,
            action = event.action.as_str(),
            channel = %integration.channel_id,
            "Posted thread reply"
        );

        Ok(DispatchOutcome::Posted { thread_ts, reply: true })
    }

    async fn compose_root(
        &self,
        event: &PullRequestEvent,
        integration: &SlackIntegration,
    ) -> Result<SlackMessage> {
        let title_line = format!(
            "🔀 *<{}|#{} {}>* opened by *{}*",
            event.url, event.number, event.title, event.actor
        );

        let mut blocks = vec![SlackBlock::Section {
            text: SlackText::mrkdwn(title_line),
        }];

        let mut context = vec![SlackText::mrkdwn(event.repository.clone())];
        if event.draft {
            context.push(SlackText::mrkdwn("📝 Draft".to_string()));
        }
        blocks.push(SlackBlock::Context { elements: context });

        let mut tags = Vec::new();
        for login in &event.requested_reviewers {
            tags.push(self.resolver.mention_tag(event.organization_id, login).await?);
        }
        if !tags.is_empty() {
            blocks.push(SlackBlock::Section {
                text: SlackText::mrkdwn(format!("Reviewers: {}", tags.join(" "))),
            });
        }

        let mut mention_tags = Vec::new();
        for login in &event.mentions {
            mention_tags.push(self.resolver.mention_tag(event.organization_id, login).await?);
        }
        if !mention_tags.is_empty() {
            blocks.push(SlackBlock::Context {
                elements: vec![SlackText::mrkdwn(format!("cc {}", mention_tags.join(" ")))],
            });
        }

        let fallback = format!("PR #{}: {} by {}", event.number, event.title, event.actor);
        Ok(SlackMessage::new(&integration.channel_id, fallback).with_blocks(blocks))
    }

    async fn compose_reply(
        &self,
        event: &PullRequestEvent,
        integration: &SlackIntegration,
    ) -> Result<SlackMessage> {
        let text = match &event.action {
            PullRequestAction::ReviewRequested => {
                let mut tags = Vec::new();
                for login in &event.requested_reviewers {
                    tags.push(self.resolver.mention_tag(event.organization_id, login).await?);
                }
                if tags.is_empty() {
                    "👀 Review requested".to_string()
                } else {
                    format!("👀 Review requested from {}", tags.join(" "))
                }
            }
            PullRequestAction::ReadyForReview => {
                format!("✅ *{}* marked this PR ready for review", event.actor)
            }
            PullRequestAction::ConvertedToDraft => {
                format!("📝 *{}* converted this PR to a draft", event.actor)
            }
            PullRequestAction::Closed if event.merged => {
                format!("🎉 Merged by *{}*", event.actor)
            }
            PullRequestAction::Closed => {
                format!("❌ Closed by *{}*", event.actor)
            }
            PullRequestAction::Reopened => {
                format!("♻️ Reopened by *{}*", event.actor)
            }
            // A duplicate "opened" delivery against an already-anchored
            // thread lands here.
            PullRequestAction::Opened => {
                format!("🔀 Opened by *{}*", event.actor)
            }
            PullRequestAction::Unknown(a) => {
                return Err(Error::Other(format!("No-op action reached composer: {}", a)))
            }
        };

        // The rendered line doubles as the notification fallback text.
        Ok(SlackMessage::new(&integration.channel_id, text.clone()).with_blocks(vec![
            SlackBlock::Section { text: SlackText::mrkdwn(text) },
        ]))
    }
}
