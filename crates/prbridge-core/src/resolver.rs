//! Organization / integration resolution
//!
//! Maps an organization id to its active Slack integration and GitHub
//! logins to Slack user ids. Zero integrations is not an error; it means
//! the organization has not connected Slack yet and event processing stops
//! quietly. More than one active integration is tolerated (migrations,
//! testing): the first by insertion order wins and the anomaly is logged.

use tracing::{debug, warn};

use crate::model::SlackIntegration;
use crate::{Database, Result};

#[derive(Clone)]
pub struct IntegrationResolver {
    db: Database,
}

impl IntegrationResolver {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Resolve the Slack integration for an organization, if any.
    pub async fn resolve(&self, organization_id: i64) -> Result<Option<SlackIntegration>> {
        let mut integrations = self.db.get_slack_integrations(organization_id).await?;

        if integrations.len() > 1 {
            warn!(
                organization_id,
                count = integrations.len(),
                "Multiple active Slack integrations, using the first"
            );
        }

        if integrations.is_empty() {
            debug!(organization_id, "No Slack integration connected");
            return Ok(None);
        }

        Ok(Some(integrations.remove(0)))
    }

    /// Resolve a GitHub login to a Slack user id, if mapped.
    pub async fn resolve_slack_user(
        &self,
        organization_id: i64,
        github_login: &str,
    ) -> Result<Option<String>> {
        self.db.get_slack_user_id(organization_id, github_login).await
    }

    /// Render a GitHub login as a Slack mention tag, degrading to the plain
    /// login text when no mapping exists.
    pub async fn mention_tag(&self, organization_id: i64, github_login: &str) -> Result<String> {
        Ok(match self.resolve_slack_user(organization_id, github_login).await? {
            Some(slack_id) => format!("<@{}>", slack_id),
            None => github_login.to_string(),
        })
    }
}
