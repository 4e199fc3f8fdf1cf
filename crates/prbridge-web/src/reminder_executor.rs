//! Reminder executor service
//!
//! Background service that runs the outstanding-PR digest on its cron
//! schedule (weekday mornings by default).
//!
//! ## Concurrency
//!
//! A named advisory lock makes a due tick exclusive, so two server
//! instances sharing a database post each digest once. The lock carries a
//! TTL so a crashed holder cannot block future runs.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use prbridge_core::{CronSchedule, Database, ReminderRun, ReminderService, SlackSender};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

const REMINDER_LOCK: &str = "reminder";
const REMINDER_LOCK_TTL_SECS: i64 = 300;

/// Reminder executor configuration
#[derive(Clone, Debug)]
pub struct ReminderExecutorConfig {
    /// 5-field cron expression for when digests go out.
    pub cron_expression: String,
    /// Polling interval in seconds
    pub poll_interval_secs: u64,
}

impl Default for ReminderExecutorConfig {
    fn default() -> Self {
        Self {
            cron_expression: prbridge_core::WEEKDAY_MORNINGS.to_string(),
            poll_interval_secs: 60,
        }
    }
}

/// Reminder executor service
pub struct ReminderExecutor {
    database: Database,
    service: ReminderService,
    config: ReminderExecutorConfig,
}

impl ReminderExecutor {
    pub fn new(
        database: Database,
        slack: Arc<dyn SlackSender>,
        config: ReminderExecutorConfig,
    ) -> Self {
        let service = ReminderService::new(database.clone(), slack);
        Self { database, service, config }
    }

    /// Run the executor loop (blocking)
    pub async fn run(&self) {
        info!(
            cron = %self.config.cron_expression,
            poll_interval_secs = self.config.poll_interval_secs,
            "Starting reminder executor"
        );

        loop {
            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "Error running reminder tick");
            }

            sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
        }
    }

    /// Check the schedule and run the digest if a run is due.
    ///
    /// Returns whether a digest sweep was executed.
    pub async fn tick(&self, now: DateTime<Utc>) -> prbridge_core::Result<bool> {
        if !self.is_due(now).await? {
            debug!("Reminder not due");
            return Ok(false);
        }

        if !self
            .database
            .try_acquire_lock(REMINDER_LOCK, REMINDER_LOCK_TTL_SECS, now)
            .await?
        {
            debug!("Another instance is running the reminder, skipping");
            return Ok(false);
        }

        let result = self.run_locked().await;

        if let Err(e) = self.database.release_lock(REMINDER_LOCK).await {
            warn!(error = %e, "Failed to release reminder lock");
        }

        result.map(|_| true)
    }

    /// Whether the next scheduled occurrence after the last run has passed.
    async fn is_due(&self, now: DateTime<Utc>) -> prbridge_core::Result<bool> {
        let schedule = CronSchedule::new(&self.config.cron_expression)?;

        // With no history, only an occurrence inside the last poll-ish
        // window counts as due; this keeps a fresh deployment from firing a
        // digest at an arbitrary hour.
        let last = match self.database.get_latest_reminder_run().await? {
            Some(run) => run.started_at,
            None => now - ChronoDuration::hours(1),
        };

        Ok(schedule.next_after(&last)? <= now)
    }

    async fn run_locked(&self) -> prbridge_core::Result<()> {
        let mut run = ReminderRun::new();
        run.id = self.database.insert_reminder_run(&run).await?;

        match self.service.run_once().await {
            Ok(report) => {
                run.mark_finished(
                    report.groups_total as i64,
                    report.groups_failed as i64,
                    report.prs_listed as i64,
                );
                self.database.update_reminder_run(&run).await?;
                info!(
                    groups_total = report.groups_total,
                    groups_failed = report.groups_failed,
                    prs_listed = report.prs_listed,
                    "Reminder digest run finished"
                );
            }
            Err(e) => {
                warn!(error = %e, "Reminder digest run failed");
                run.mark_errored(e.to_string());
                self.database.update_reminder_run(&run).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use prbridge_core::{
        Organization, PostedMessage, PullRequestAction, PullRequestEvent, PullRequestThread,
        SlackIntegration, SlackMessage,
    };
    use std::sync::Mutex;

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
            self.posted.lock().unwrap().push(message.clone());
            Ok(PostedMessage { channel: message.channel.clone(), ts: "4000.000001".to_string() })
        }
    }

    async fn seeded_db() -> Database {
        let db = Database::in_memory().await.unwrap();
        db.upsert_organization(&Organization::new(7, "acme")).await.unwrap();
        db.insert_slack_integration(&SlackIntegration::new(
            7, "T111", "Acme", "xoxb-1", "C123", "eng",
        ))
        .await
        .unwrap();

        let event = PullRequestEvent {
            action: PullRequestAction::Opened,
            pull_request_id: 9001,
            number: 42,
            repository_id: 500,
            repository: "acme/widgets".to_string(),
            organization_id: 7,
            organization: "acme".to_string(),
            actor: "dave".to_string(),
            title: "Add login feature".to_string(),
            url: "https://github.com/acme/widgets/pull/42".to_string(),
            draft: false,
            merged: false,
            requested_reviewers: vec![],
            mentions: vec![],
        };
        let thread = PullRequestThread::from_event(&event);
        db.claim_thread_anchor(&thread, "1.000").await.unwrap();
        db
    }

    fn executor(db: Database, sender: Arc<RecordingSender>) -> ReminderExecutor {
        ReminderExecutor::new(db, sender, ReminderExecutorConfig::default())
    }

    #[tokio::test]
    async fn test_tick_runs_when_due() {
        let db = seeded_db().await;
        let sender = RecordingSender::new();
        let executor = executor(db.clone(), sender.clone());

        // Wednesday 09:05: the 09:00 occurrence just passed.
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 9, 5, 0).unwrap();
        let ran = executor.tick(now).await.unwrap();

        assert!(ran);
        assert_eq!(sender.posted().len(), 1);

        let runs = db.get_reminder_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].groups_total, 1);
        assert_eq!(runs[0].prs_listed, 1);
        assert!(runs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_tick_skips_when_not_due() {
        let db = seeded_db().await;
        let sender = RecordingSender::new();
        let executor = executor(db.clone(), sender.clone());

        // Wednesday 08:00: before the morning run, nothing in the window.
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap();
        let ran = executor.tick(now).await.unwrap();

        assert!(!ran);
        assert!(sender.posted().is_empty());
    }

    #[tokio::test]
    async fn test_tick_skips_weekends() {
        let db = seeded_db().await;
        let sender = RecordingSender::new();
        let executor = executor(db.clone(), sender.clone());

        // Saturday 09:05.
        let now = Utc.with_ymd_and_hms(2025, 1, 18, 9, 5, 0).unwrap();
        let ran = executor.tick(now).await.unwrap();

        assert!(!ran);
    }

    #[tokio::test]
    async fn test_second_tick_same_morning_does_not_rerun() {
        let db = seeded_db().await;
        let sender = RecordingSender::new();
        let executor = executor(db.clone(), sender.clone());

        let now = Utc.with_ymd_and_hms(2025, 1, 15, 9, 5, 0).unwrap();
        assert!(executor.tick(now).await.unwrap());

        // A minute later the 09:00 occurrence is already covered by the
        // recorded run.
        let later = Utc.with_ymd_and_hms(2025, 1, 15, 9, 6, 0).unwrap();
        assert!(!executor.tick(later).await.unwrap());
        assert_eq!(sender.posted().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_prevents_concurrent_run() {
        let db = seeded_db().await;
        let sender = RecordingSender::new();
        let executor = executor(db.clone(), sender.clone());

        let now = Utc.with_ymd_and_hms(2025, 1, 15, 9, 5, 0).unwrap();
        // Another instance holds the lock.
        assert!(db.try_acquire_lock("reminder", 300, now).await.unwrap());

        let ran = executor.tick(now).await.unwrap();
        assert!(!ran);
        assert!(sender.posted().is_empty());
    }
}
