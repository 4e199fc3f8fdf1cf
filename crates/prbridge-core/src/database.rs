//! Database layer for SQLite
//!
//! All durable state lives here: organizations, Slack integrations,
//! username mappings, pull-request threads, the Slack API throttle, the
//! webhook delivery queue, advisory locks, and reminder run history.
//!
//! Two operations carry the concurrency contract for duplicate webhook
//! deliveries:
//! - [`Database::claim_thread_anchor`] is a single conditional upsert; once
//!   a thread has a non-null `thread_ts` no later claim can replace it.
//! - [`Database::try_acquire_lock`] provides TTL'd advisory locks keyed by
//!   name, used for the per-PR root-post critical section and the reminder
//!   executor.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{
    Organization, PullRequestThread, ReminderRun, SlackApiThrottle, SlackIntegration,
    SubscriptionStatus, ThreadState, UsernameMapping,
};
use crate::queue::{WebhookEvent, WebhookEventStatus};
use crate::{Error, Result};

/// TTL of a Slack API throttle record. Acquisition always resets the expiry
/// to now + TTL, so the record is a cooldown marker, not a sliding window.
pub const SLACK_THROTTLE_TTL_SECS: i64 = 15 * 60;

/// Database configuration
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Database connection and operations
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection with default config
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(path, DatabaseConfig::default()).await
    }

    /// Create a new database connection with custom config
    pub async fn with_config(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&url)
            .await?;

        // WAL mode for concurrent webhook handling
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout=5000").execute(&pool).await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(include_str!("../../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ==================== Organization Operations ====================

    /// Insert or refresh an organization record.
    ///
    /// Called from installation callbacks: a reinstall updates the
    /// installation id in place. Organizations are never deleted.
    pub async fn upsert_organization(&self, org: &Organization) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations (id, login, installation_id, subscription_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                login = excluded.login,
                installation_id = excluded.installation_id,
                subscription_status = excluded.subscription_status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(org.id)
        .bind(&org.login)
        .bind(org.installation_id)
        .bind(org.subscription_status.as_str())
        .bind(org.created_at.to_rfc3339())
        .bind(org.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_organization(&self, id: i64) -> Result<Option<Organization>> {
        let row = sqlx::query(
            "SELECT id, login, installation_id, subscription_status, created_at, updated_at
             FROM organizations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| organization_from_row(&r)).transpose()
    }

    pub async fn set_installation(&self, org_id: i64, installation_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE organizations SET installation_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(installation_id)
        .bind(Utc::now().to_rfc3339())
        .bind(org_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_organizations(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM organizations")
            .fetch_one(&self.pool)
            .await?)
    }

    // ==================== Slack Integration Operations ====================

    pub async fn insert_slack_integration(&self, integration: &SlackIntegration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO slack_integrations (
                id, organization_id, team_id, team_name, access_token,
                channel_id, channel_name, is_active, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&integration.id)
        .bind(integration.organization_id)
        .bind(&integration.team_id)
        .bind(&integration.team_name)
        .bind(&integration.access_token)
        .bind(&integration.channel_id)
        .bind(&integration.channel_name)
        .bind(integration.is_active)
        .bind(integration.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Active integrations for an organization, in insertion order.
    pub async fn get_slack_integrations(&self, organization_id: i64) -> Result<Vec<SlackIntegration>> {
        let rows = sqlx::query(
            r#"
            SELECT id, organization_id, team_id, team_name, access_token,
                   channel_id, channel_name, is_active, created_at
            FROM slack_integrations
            WHERE organization_id = ? AND is_active = 1
            ORDER BY rowid ASC
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(slack_integration_from_row).collect()
    }

    // ==================== Username Mapping Operations ====================

    pub async fn upsert_username_mapping(&self, mapping: &UsernameMapping) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO username_mappings (id, organization_id, github_login, slack_user_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(organization_id, github_login) DO UPDATE SET
                slack_user_id = excluded.slack_user_id
            "#,
        )
        .bind(&mapping.id)
        .bind(mapping.organization_id)
        .bind(&mapping.github_login)
        .bind(&mapping.slack_user_id)
        .bind(mapping.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_slack_user_id(
        &self,
        organization_id: i64,
        github_login: &str,
    ) -> Result<Option<String>> {
        let id = sqlx::query_scalar::<_, String>(
            "SELECT slack_user_id FROM username_mappings
             WHERE organization_id = ? AND github_login = ?",
        )
        .bind(organization_id)
        .bind(github_login)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn count_username_mappings(&self, organization_id: i64) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM username_mappings WHERE organization_id = ?",
        )
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await?)
    }

    // ==================== Thread State Operations ====================

    pub async fn get_thread(&self, pr_id: i64) -> Result<Option<PullRequestThread>> {
        let row = sqlx::query(
            r#"
            SELECT pr_id, organization_id, number, repository, title, url,
                   thread_ts, draft, state, created_at, updated_at
            FROM pr_threads WHERE pr_id = ?
            "#,
        )
        .bind(pr_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| thread_from_row(&r)).transpose()
    }

    /// Claim the thread anchor for a pull request.
    ///
    /// Atomic create-if-absent: the COALESCE keeps whatever `thread_ts` is
    /// already stored, so under concurrent duplicate deliveries exactly one
    /// anchor survives and every caller reads back the same value. Returns
    /// the stored row, whose `thread_ts` may differ from the one offered.
    pub async fn claim_thread_anchor(
        &self,
        thread: &PullRequestThread,
        thread_ts: &str,
    ) -> Result<PullRequestThread> {
        sqlx::query(
            r#"
            INSERT INTO pr_threads (
                pr_id, organization_id, number, repository, title, url,
                thread_ts, draft, state, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(pr_id) DO UPDATE SET
                thread_ts = COALESCE(pr_threads.thread_ts, excluded.thread_ts),
                title = excluded.title,
                draft = excluded.draft,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(thread.pr_id)
        .bind(thread.organization_id)
        .bind(thread.number)
        .bind(&thread.repository)
        .bind(&thread.title)
        .bind(&thread.url)
        .bind(thread_ts)
        .bind(thread.draft)
        .bind(thread.state.as_str())
        .bind(thread.created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get_thread(thread.pr_id)
            .await?
            .ok_or_else(|| Error::Other(format!("Thread vanished after claim: {}", thread.pr_id)))
    }

    /// Record the latest known state of a tracked pull request.
    pub async fn record_thread_event(
        &self,
        pr_id: i64,
        draft: bool,
        state: ThreadState,
        title: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE pr_threads SET draft = ?, state = ?, title = ?, updated_at = ? WHERE pr_id = ?",
        )
        .bind(draft)
        .bind(state.as_str())
        .bind(title)
        .bind(Utc::now().to_rfc3339())
        .bind(pr_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Outstanding pull requests for the reminder scan.
    pub async fn list_open_threads(&self) -> Result<Vec<PullRequestThread>> {
        let rows = sqlx::query(
            r#"
            SELECT pr_id, organization_id, number, repository, title, url,
                   thread_ts, draft, state, created_at, updated_at
            FROM pr_threads
            WHERE state = 'open'
            ORDER BY organization_id ASC, number ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(thread_from_row).collect()
    }

    pub async fn count_threads(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM pr_threads")
            .fetch_one(&self.pool)
            .await?)
    }

    // ==================== Slack API Throttle Operations ====================

    /// Try to acquire the cooldown gate for one (team, request type) pair.
    ///
    /// Expired markers are swept, then an `INSERT OR IGNORE` decides the
    /// winner: its row count is the verdict, so concurrent callers cannot
    /// both acquire. `now` is passed in so tests can advance the clock.
    pub async fn try_acquire_throttle(
        &self,
        team_id: &str,
        request_type: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        sqlx::query(
            "DELETE FROM slack_api_throttles
             WHERE team_id = ? AND request_type = ? AND expires_at <= ?",
        )
        .bind(team_id)
        .bind(request_type)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let expires_at = now + chrono::Duration::seconds(SLACK_THROTTLE_TTL_SECS);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO slack_api_throttles (team_id, request_type, last_request_at, expires_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(team_id)
        .bind(request_type)
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_throttle(
        &self,
        team_id: &str,
        request_type: &str,
    ) -> Result<Option<SlackApiThrottle>> {
        let row = sqlx::query(
            "SELECT team_id, request_type, last_request_at, expires_at
             FROM slack_api_throttles WHERE team_id = ? AND request_type = ?",
        )
        .bind(team_id)
        .bind(request_type)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(SlackApiThrottle {
                team_id: r.try_get("team_id")?,
                request_type: r.try_get("request_type")?,
                last_request_at: parse_dt(&r.try_get::<String, _>("last_request_at")?)?,
                expires_at: parse_dt(&r.try_get::<String, _>("expires_at")?)?,
            })
        })
        .transpose()
    }

    // ==================== Advisory Lock Operations ====================

    /// Acquire a named advisory lock with a TTL.
    ///
    /// The TTL bounds how long a crashed holder can wedge its key.
    pub async fn try_acquire_lock(
        &self,
        name: &str,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        sqlx::query("DELETE FROM advisory_locks WHERE name = ? AND expires_at <= ?")
            .bind(name)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;

        let expires_at = now + chrono::Duration::seconds(ttl_secs);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO advisory_locks (name, locked_at, expires_at) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn release_lock(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM advisory_locks WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Webhook Queue Operations ====================

    /// Queue a delivery. Idempotent on the delivery id: a redelivered
    /// webhook collapses onto the existing row and its id is returned.
    pub async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (
                delivery_id, event_type, payload, status, retry_count, max_retries,
                error_message, next_retry_at, received_at, processed_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(delivery_id) DO NOTHING
            "#,
        )
        .bind(&event.delivery_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.status.as_str())
        .bind(event.retry_count)
        .bind(event.max_retries)
        .bind(&event.error_message)
        .bind(event.next_retry_at.map(|dt| dt.to_rfc3339()))
        .bind(event.received_at.to_rfc3339())
        .bind(event.processed_at.map(|dt| dt.to_rfc3339()))
        .bind(event.created_at.to_rfc3339())
        .bind(event.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM webhook_events WHERE delivery_id = ?")
            .bind(&event.delivery_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn get_webhook_event_by_delivery_id(
        &self,
        delivery_id: &str,
    ) -> Result<Option<WebhookEvent>> {
        let row = sqlx::query("SELECT * FROM webhook_events WHERE delivery_id = ?")
            .bind(delivery_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| webhook_event_from_row(&r)).transpose()
    }

    /// Pending deliveries whose retry time (if any) has arrived.
    pub async fn get_pending_webhook_events(&self, limit: i64) -> Result<Vec<WebhookEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM webhook_events
            WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?)
            ORDER BY received_at ASC
            LIMIT ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(webhook_event_from_row).collect()
    }

    pub async fn update_webhook_event(&self, event: &WebhookEvent) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events SET
                status = ?, retry_count = ?, error_message = ?, next_retry_at = ?,
                processed_at = ?, updated_at = ?
            WHERE delivery_id = ?
            "#,
        )
        .bind(event.status.as_str())
        .bind(event.retry_count)
        .bind(&event.error_message)
        .bind(event.next_retry_at.map(|dt| dt.to_rfc3339()))
        .bind(event.processed_at.map(|dt| dt.to_rfc3339()))
        .bind(event.updated_at.to_rfc3339())
        .bind(&event.delivery_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_webhook_events_by_status(
        &self,
        status: WebhookEventStatus,
        limit: i64,
    ) -> Result<Vec<WebhookEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM webhook_events WHERE status = ? ORDER BY received_at ASC LIMIT ?",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(webhook_event_from_row).collect()
    }

    pub async fn count_webhook_events_by_status(&self, status: WebhookEventStatus) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM webhook_events WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?)
    }

    // ==================== Reminder Run Operations ====================

    pub async fn insert_reminder_run(&self, run: &ReminderRun) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO reminder_runs (started_at, finished_at, groups_total, groups_failed, prs_listed, error_message)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.started_at.to_rfc3339())
        .bind(run.finished_at.map(|dt| dt.to_rfc3339()))
        .bind(run.groups_total)
        .bind(run.groups_failed)
        .bind(run.prs_listed)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn update_reminder_run(&self, run: &ReminderRun) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE reminder_runs SET
                finished_at = ?, groups_total = ?, groups_failed = ?, prs_listed = ?, error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(run.finished_at.map(|dt| dt.to_rfc3339()))
        .bind(run.groups_total)
        .bind(run.groups_failed)
        .bind(run.prs_listed)
        .bind(&run.error_message)
        .bind(run.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_latest_reminder_run(&self) -> Result<Option<ReminderRun>> {
        let row = sqlx::query("SELECT * FROM reminder_runs ORDER BY started_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| reminder_run_from_row(&r)).transpose()
    }

    pub async fn get_reminder_runs(&self, limit: i64) -> Result<Vec<ReminderRun>> {
        let rows = sqlx::query("SELECT * FROM reminder_runs ORDER BY started_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(reminder_run_from_row).collect()
    }
}

// ==================== Row Mapping ====================

fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    Ok(s.parse::<DateTime<Utc>>()?)
}

fn parse_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_dt(&s)).transpose()
}

fn organization_from_row(row: &SqliteRow) -> Result<Organization> {
    Ok(Organization {
        id: row.try_get("id")?,
        login: row.try_get("login")?,
        installation_id: row.try_get("installation_id")?,
        subscription_status: SubscriptionStatus::from_str(
            &row.try_get::<String, _>("subscription_status")?,
        )?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn slack_integration_from_row(row: &SqliteRow) -> Result<SlackIntegration> {
    Ok(SlackIntegration {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        team_id: row.try_get("team_id")?,
        team_name: row.try_get("team_name")?,
        access_token: row.try_get("access_token")?,
        channel_id: row.try_get("channel_id")?,
        channel_name: row.try_get("channel_name")?,
        is_active: row.try_get::<i64, _>("is_active")? == 1,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn thread_from_row(row: &SqliteRow) -> Result<PullRequestThread> {
    Ok(PullRequestThread {
        pr_id: row.try_get("pr_id")?,
        organization_id: row.try_get("organization_id")?,
        number: row.try_get("number")?,
        repository: row.try_get("repository")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        thread_ts: row.try_get("thread_ts")?,
        draft: row.try_get::<i64, _>("draft")? == 1,
        state: ThreadState::from_str(&row.try_get::<String, _>("state")?)?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn webhook_event_from_row(row: &SqliteRow) -> Result<WebhookEvent> {
    Ok(WebhookEvent {
        id: Some(row.try_get("id")?),
        delivery_id: row.try_get("delivery_id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        status: WebhookEventStatus::from_str(&row.try_get::<String, _>("status")?)?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        error_message: row.try_get("error_message")?,
        next_retry_at: parse_opt_dt(row.try_get("next_retry_at")?)?,
        received_at: parse_dt(&row.try_get::<String, _>("received_at")?)?,
        processed_at: parse_opt_dt(row.try_get("processed_at")?)?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn reminder_run_from_row(row: &SqliteRow) -> Result<ReminderRun> {
    Ok(ReminderRun {
        id: row.try_get("id")?,
        started_at: parse_dt(&row.try_get::<String, _>("started_at")?)?,
        finished_at: parse_opt_dt(row.try_get("finished_at")?)?,
        groups_total: row.try_get("groups_total")?,
        groups_failed: row.try_get("groups_failed")?,
        prs_listed: row.try_get("prs_listed")?,
        error_message: row.try_get("error_message")?,
    })
}
