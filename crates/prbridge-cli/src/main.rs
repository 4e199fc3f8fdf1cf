//! prbridge CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prbridge_core::{
    Database, Organization, ReminderService, SlackApiClient, SlackIntegration, ThrottleKind,
    UsernameMapping, WebhookEventStatus,
};
use prbridge_github::GitHubAppClient;
use prbridge_web::{
    AppState, ReminderExecutor, ReminderExecutorConfig, WebhookProcessor, WebhookProcessorConfig,
};
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Initialize logging with the specified verbosity level
fn init_logging(verbose: u8, quiet: bool, json: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter =
        EnvFilter::from_default_env().add_directive(format!("prbridge={}", level).parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 1)
        .with_file(verbose >= 2)
        .with_line_number(verbose >= 2);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "prbridge")]
#[command(about = "GitHub pull-request to Slack thread bridge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database path
    #[arg(long, env = "PRBRIDGE_DB_PATH", default_value = "prbridge.db")]
    db_path: String,

    /// Increase verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output logs as JSON (for machine parsing)
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server, event processor, and reminder executor
    Serve {
        #[arg(short, long, env = "PRBRIDGE_PORT", default_value = "8080")]
        port: u16,

        /// GitHub webhook secret; verification is skipped when unset
        #[arg(long, env = "GITHUB_WEBHOOK_SECRET")]
        github_webhook_secret: Option<String>,

        /// Slack signing secret; verification is skipped when unset
        #[arg(long, env = "SLACK_SIGNING_SECRET")]
        slack_signing_secret: Option<String>,
    },
    /// Run one reminder digest sweep immediately
    Remind,
    /// Connect a Slack workspace/channel to an organization
    ConnectSlack {
        /// GitHub account id of the organization
        #[arg(long)]
        org_id: i64,
        /// GitHub login of the organization
        #[arg(long)]
        org_login: String,
        #[arg(long)]
        team_id: String,
        #[arg(long)]
        team_name: String,
        /// Bot access token (xoxb-...)
        #[arg(long, env = "SLACK_BOT_TOKEN")]
        token: String,
        #[arg(long)]
        channel_id: String,
        #[arg(long)]
        channel_name: String,
    },
    /// Map a GitHub login to a Slack user id
    MapUser {
        #[arg(long)]
        org_id: i64,
        #[arg(long)]
        github_login: String,
        #[arg(long)]
        slack_user_id: String,
    },
    /// Sync organization members against the Slack user directory
    SyncMembers {
        #[arg(long)]
        org_id: i64,

        #[arg(long, env = "GITHUB_APP_ID")]
        github_app_id: u64,

        /// Path to the GitHub App private key (PEM)
        #[arg(long, env = "GITHUB_APP_PRIVATE_KEY_PATH")]
        private_key_path: String,
    },
    /// Show bridge status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.log_json)?;

    let db = Database::new(&cli.db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", cli.db_path))?;

    match cli.command {
        Commands::Serve { port, github_webhook_secret, slack_signing_secret } => {
            serve(db, port, github_webhook_secret, slack_signing_secret).await
        }
        Commands::Remind => remind(db).await,
        Commands::ConnectSlack {
            org_id,
            org_login,
            team_id,
            team_name,
            token,
            channel_id,
            channel_name,
        } => {
            connect_slack(db, org_id, &org_login, &team_id, &team_name, &token, &channel_id, &channel_name)
                .await
        }
        Commands::MapUser { org_id, github_login, slack_user_id } => {
            map_user(db, org_id, &github_login, &slack_user_id).await
        }
        Commands::SyncMembers { org_id, github_app_id, private_key_path } => {
            sync_members(db, org_id, github_app_id, &private_key_path).await
        }
        Commands::Status => status(db).await,
    }
}

async fn serve(
    db: Database,
    port: u16,
    github_webhook_secret: Option<String>,
    slack_signing_secret: Option<String>,
) -> Result<()> {
    let slack = Arc::new(SlackApiClient::new());

    let state = Arc::new(AppState::new(
        db.clone(),
        github_webhook_secret.map(SecretString::from),
        slack_signing_secret.map(SecretString::from),
    ));
    let router = prbridge_web::create_router(state);

    let processor =
        WebhookProcessor::new(db.clone(), slack.clone(), WebhookProcessorConfig::default());
    tokio::spawn(async move { processor.run().await });

    let executor = ReminderExecutor::new(db, slack, ReminderExecutorConfig::default());
    tokio::spawn(async move { executor.run().await });

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting prbridge server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, router).await.context("Server error")?;

    Ok(())
}

async fn remind(db: Database) -> Result<()> {
    let slack = Arc::new(SlackApiClient::new());
    let service = ReminderService::new(db, slack);

    let report = service.run_once().await?;
    println!(
        "Reminder digest: {} groups ({} failed), {} PRs listed",
        report.groups_total, report.groups_failed, report.prs_listed
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn connect_slack(
    db: Database,
    org_id: i64,
    org_login: &str,
    team_id: &str,
    team_name: &str,
    token: &str,
    channel_id: &str,
    channel_name: &str,
) -> Result<()> {
    if db.get_organization(org_id).await?.is_none() {
        db.upsert_organization(&Organization::new(org_id, org_login)).await?;
    }

    let integration =
        SlackIntegration::new(org_id, team_id, team_name, token, channel_id, channel_name);
    db.insert_slack_integration(&integration).await?;

    println!(
        "Connected Slack team {} (channel #{}) to organization {}",
        team_name, channel_name, org_login
    );
    Ok(())
}

async fn map_user(db: Database, org_id: i64, github_login: &str, slack_user_id: &str) -> Result<()> {
    db.upsert_username_mapping(&UsernameMapping::new(org_id, github_login, slack_user_id))
        .await?;
    println!("Mapped {} -> {}", github_login, slack_user_id);
    Ok(())
}

/// Match organization members against the Slack workspace directory and map
/// exact login/username matches. The Slack user listing is an
/// administrative call, gated by the per-team cooldown throttle.
async fn sync_members(
    db: Database,
    org_id: i64,
    github_app_id: u64,
    private_key_path: &str,
) -> Result<()> {
    let org = db
        .get_organization(org_id)
        .await?
        .with_context(|| format!("Organization {} not found", org_id))?;
    let installation_id = org
        .installation_id
        .with_context(|| format!("Organization {} has no GitHub App installation", org_id))?;

    let integrations = db.get_slack_integrations(org_id).await?;
    let integration = integrations
        .first()
        .with_context(|| format!("Organization {} has no Slack integration", org_id))?;

    let acquired = db
        .try_acquire_throttle(
            &integration.team_id,
            ThrottleKind::UserList.as_str(),
            chrono::Utc::now(),
        )
        .await?;
    if !acquired {
        println!("User directory was refreshed recently; try again later.");
        return Ok(());
    }

    let private_key = std::fs::read_to_string(private_key_path)
        .with_context(|| format!("Failed to read private key at {}", private_key_path))?;
    let github = GitHubAppClient::new(github_app_id, private_key)?;

    let members = github
        .list_org_members(installation_id as u64, &org.login)
        .await?;

    let slack = SlackApiClient::new();
    let users = slack.list_users(&integration.access_token).await?;

    let mut mapped = 0usize;
    for member in &members {
        let matched = users
            .iter()
            .find(|u| !u.deleted && !u.is_bot && u.name.eq_ignore_ascii_case(&member.login));
        if let Some(user) = matched {
            db.upsert_username_mapping(&UsernameMapping::new(org_id, &member.login, &user.id))
                .await?;
            mapped += 1;
        }
    }

    println!(
        "Synced {} of {} members for {} (Slack team {})",
        mapped,
        members.len(),
        org.login,
        integration.team_name
    );
    Ok(())
}

async fn status(db: Database) -> Result<()> {
    let organizations = db.count_organizations().await?;
    let threads = db.count_threads().await?;
    let open = db.list_open_threads().await?.len();
    let pending = db.count_webhook_events_by_status(WebhookEventStatus::Pending).await?;
    let dead = db.count_webhook_events_by_status(WebhookEventStatus::DeadLetter).await?;

    println!("organizations:   {}", organizations);
    println!("tracked PRs:     {} ({} open)", threads, open);
    println!("pending events:  {}", pending);
    println!("dead-lettered:   {}", dead);

    if let Some(run) = db.get_latest_reminder_run().await? {
        println!(
            "last reminder:   {} ({} groups, {} failed)",
            run.started_at.format("%Y-%m-%d %H:%M UTC"),
            run.groups_total,
            run.groups_failed
        );
    }

    Ok(())
}
