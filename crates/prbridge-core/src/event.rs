//! GitHub pull_request event normalization
//!
//! Raw webhook payloads are decoded into a canonical [`PullRequestEvent`]
//! before any routing decision is made. The decode fails closed: payloads
//! that cannot be attributed to an organization, or that are missing the
//! fields an action needs, normalize to `None` and are skipped rather than
//! crashing the delivery.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::Result;

static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([A-Za-z0-9][A-Za-z0-9-]*)").expect("valid mention regex"));

/// Known pull_request actions.
///
/// GitHub keeps adding action values; anything unrecognized lands in
/// `Unknown` and is routed as a no-op rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullRequestAction {
    Opened,
    Closed,
    Reopened,
    ReadyForReview,
    ConvertedToDraft,
    ReviewRequested,
    Unknown(String),
}

impl PullRequestAction {
    pub fn parse(s: &str) -> Self {
        match s {
            "opened" => Self::Opened,
            "closed" => Self::Closed,
            "reopened" => Self::Reopened,
            "ready_for_review" => Self::ReadyForReview,
            "converted_to_draft" => Self::ConvertedToDraft,
            "review_requested" => Self::ReviewRequested,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Reopened => "reopened",
            Self::ReadyForReview => "ready_for_review",
            Self::ConvertedToDraft => "converted_to_draft",
            Self::ReviewRequested => "review_requested",
            Self::Unknown(s) => s,
        }
    }

    /// Whether this action produces a Slack notification at all.
    pub fn notifies(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

/// Canonical shape of a pull_request webhook event.
#[derive(Debug, Clone)]
pub struct PullRequestEvent {
    pub action: PullRequestAction,
    /// Global pull request id. Immutable and unique across repositories,
    /// unlike the per-repository number.
    pub pull_request_id: i64,
    pub number: i64,
    pub repository_id: i64,
    /// Repository full name, e.g. "acme/widgets".
    pub repository: String,
    /// GitHub account id of the owning organization.
    pub organization_id: i64,
    pub organization: String,
    /// Login of the user whose action triggered the event.
    pub actor: String,
    pub title: String,
    pub url: String,
    pub draft: bool,
    pub merged: bool,
    pub requested_reviewers: Vec<String>,
    /// Logins @-mentioned in the pull request body.
    pub mentions: Vec<String>,
}

impl PullRequestEvent {
    /// Decode a raw pull_request payload.
    ///
    /// Returns `Ok(None)` when the event cannot be processed: the payload
    /// has no resolvable owner (some installation events omit it), or a
    /// field required for routing is missing. Only invalid JSON is an error.
    pub fn from_payload(payload: &str) -> Result<Option<Self>> {
        let value: Value = serde_json::from_str(payload)?;

        let action = match value.get("action").and_then(Value::as_str) {
            Some(a) => PullRequestAction::parse(a),
            None => {
                warn!("Payload has no action field, skipping");
                return Ok(None);
            }
        };

        let pr = match value.get("pull_request") {
            Some(pr) => pr,
            None => {
                warn!(action = action.as_str(), "Payload has no pull_request field, skipping");
                return Ok(None);
            }
        };

        let repository = match value.get("repository") {
            Some(r) => r,
            None => {
                warn!(action = action.as_str(), "Payload has no repository field, skipping");
                return Ok(None);
            }
        };

        // Owner login is absent on some installation-related deliveries;
        // without it the event cannot be mapped to an organization.
        let owner = repository.get("owner");
        let (organization_id, organization) = match (
            owner.and_then(|o| o.get("id")).and_then(Value::as_i64),
            owner.and_then(|o| o.get("login")).and_then(Value::as_str),
        ) {
            (Some(id), Some(login)) => (id, login.to_string()),
            _ => {
                warn!(action = action.as_str(), "Repository owner unresolvable, skipping");
                return Ok(None);
            }
        };

        let pull_request_id = match pr.get("id").and_then(Value::as_i64) {
            Some(id) => id,
            None => {
                warn!(action = action.as_str(), "Pull request has no id, skipping");
                return Ok(None);
            }
        };

        let number = pr.get("number").and_then(Value::as_i64).unwrap_or(0);
        let repository_id = repository.get("id").and_then(Value::as_i64).unwrap_or(0);
        let repository_name = repository
            .get("full_name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let actor = value
            .get("sender")
            .and_then(|s| s.get("login"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let title = pr.get("title").and_then(Value::as_str).unwrap_or("").to_string();
        let url = pr.get("html_url").and_then(Value::as_str).unwrap_or("").to_string();

        // ready_for_review flips the draft flag off even when the payload
        // still carries the old value.
        let draft = if action == PullRequestAction::ReadyForReview {
            false
        } else {
            pr.get("draft").and_then(Value::as_bool).unwrap_or(false)
        };

        let merged = pr.get("merged").and_then(Value::as_bool).unwrap_or(false);

        let requested_reviewers = pr
            .get("requested_reviewers")
            .and_then(Value::as_array)
            .map(|reviewers| {
                reviewers
                    .iter()
                    .filter_map(|r| r.get("login").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mentions = pr
            .get("body")
            .and_then(Value::as_str)
            .map(extract_mentions)
            .unwrap_or_default();

        if let PullRequestAction::Unknown(ref a) = action {
            debug!(action = %a, pull_request_id, "Unrecognized action, will route as no-op");
        }

        Ok(Some(Self {
            action,
            pull_request_id,
            number,
            repository_id,
            repository: repository_name,
            organization_id,
            organization,
            actor,
            title,
            url,
            draft,
            merged,
            requested_reviewers,
            mentions,
        }))
    }
}

/// Extract @-mentioned logins from free-form text, deduplicated in order.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for capture in MENTION_RE.captures_iter(text) {
        let login = capture[1].to_string();
        if !seen.contains(&login) {
            seen.push(login);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr_payload(action: &str) -> serde_json::Value {
        serde_json::json!({
            "action": action,
            "number": 42,
            "pull_request": {
                "id": 9001,
                "number": 42,
                "title": "Add login feature",
                "html_url": "https://github.com/acme/widgets/pull/42",
                "draft": false,
                "merged": false,
                "body": "Implements login.\n\ncc @alice and @bob",
                "requested_reviewers": [
                    {"login": "carol"}
                ]
            },
            "repository": {
                "id": 500,
                "full_name": "acme/widgets",
                "owner": {"id": 7, "login": "acme"}
            },
            "sender": {"login": "dave"}
        })
    }

    #[test]
    fn test_normalizes_opened_event() {
        let event = PullRequestEvent::from_payload(&pr_payload("opened").to_string())
            .unwrap()
            .unwrap();

        assert_eq!(event.action, PullRequestAction::Opened);
        assert_eq!(event.pull_request_id, 9001);
        assert_eq!(event.number, 42);
        assert_eq!(event.organization_id, 7);
        assert_eq!(event.organization, "acme");
        assert_eq!(event.repository, "acme/widgets");
        assert_eq!(event.actor, "dave");
        assert!(!event.draft);
        assert_eq!(event.requested_reviewers, vec!["carol"]);
        assert_eq!(event.mentions, vec!["alice", "bob"]);
    }

    #[test]
    fn test_ready_for_review_forces_draft_off() {
        let mut payload = pr_payload("ready_for_review");
        // GitHub has been observed sending the stale draft flag alongside
        // the ready_for_review action.
        payload["pull_request"]["draft"] = serde_json::json!(true);

        let event = PullRequestEvent::from_payload(&payload.to_string())
            .unwrap()
            .unwrap();

        assert_eq!(event.action, PullRequestAction::ReadyForReview);
        assert!(!event.draft);
    }

    #[test]
    fn test_unknown_action_is_accepted_as_noop() {
        let event = PullRequestEvent::from_payload(&pr_payload("auto_merge_enabled").to_string())
            .unwrap()
            .unwrap();

        assert_eq!(
            event.action,
            PullRequestAction::Unknown("auto_merge_enabled".to_string())
        );
        assert!(!event.action.notifies());
    }

    #[test]
    fn test_missing_owner_is_skipped() {
        let mut payload = pr_payload("opened");
        payload["repository"].as_object_mut().unwrap().remove("owner");

        let event = PullRequestEvent::from_payload(&payload.to_string()).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn test_missing_pull_request_is_skipped() {
        let payload = serde_json::json!({"action": "opened"});
        let event = PullRequestEvent::from_payload(&payload.to_string()).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn test_missing_pull_request_id_is_skipped() {
        let mut payload = pr_payload("opened");
        payload["pull_request"].as_object_mut().unwrap().remove("id");

        let event = PullRequestEvent::from_payload(&payload.to_string()).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(PullRequestEvent::from_payload("not json").is_err());
    }

    #[test]
    fn test_merged_flag_on_closed_event() {
        let mut payload = pr_payload("closed");
        payload["pull_request"]["merged"] = serde_json::json!(true);

        let event = PullRequestEvent::from_payload(&payload.to_string())
            .unwrap()
            .unwrap();

        assert_eq!(event.action, PullRequestAction::Closed);
        assert!(event.merged);
    }

    #[test]
    fn test_extract_mentions_deduplicates() {
        let mentions = extract_mentions("@alice please review, @bob too. Thanks @alice!");
        assert_eq!(mentions, vec!["alice", "bob"]);
    }

    #[test]
    fn test_extract_mentions_empty_body() {
        assert!(extract_mentions("no mentions here").is_empty());
    }

    #[test]
    fn test_action_round_trip() {
        for action in ["opened", "closed", "reopened", "ready_for_review",
                       "converted_to_draft", "review_requested"] {
            assert_eq!(PullRequestAction::parse(action).as_str(), action);
        }
        assert_eq!(PullRequestAction::parse("labeled").as_str(), "labeled");
    }
}
