//! Slack Web API types and client
//!
//! A small Block Kit subset (sections, context lines, headers, dividers)
//! plus the `chat.postMessage` / `users.list` client. The client is plain
//! data behind the [`SlackSender`] trait so the dispatcher can be exercised
//! with a recording fake; nothing here is a process-wide singleton.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

pub const SLACK_API_BASE: &str = "https://slack.com/api";

/// Slack message block types (the subset the bridge composes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlackBlock {
    Section {
        text: SlackText,
    },
    Divider,
    Context {
        elements: Vec<SlackText>,
    },
    Header {
        text: SlackText,
    },
}

/// Slack text object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackText {
    #[serde(rename = "type")]
    pub text_type: TextType,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emoji: Option<bool>,
}

impl SlackText {
    pub fn mrkdwn(text: impl Into<String>) -> Self {
        Self {
            text_type: TextType::Mrkdwn,
            text: text.into(),
            emoji: None,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text_type: TextType::PlainText,
            text: text.into(),
            emoji: Some(true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TextType {
    PlainText,
    Mrkdwn,
}

/// A message to post, either as a thread root or a threaded reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackMessage {
    pub channel: String,
    /// Fallback text for notifications and non-block clients.
    pub text: String,
    pub blocks: Vec<SlackBlock>,
    pub thread_ts: Option<String>,
    pub unfurl_links: Option<bool>,
}

impl SlackMessage {
    pub fn new(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            text: text.into(),
            blocks: Vec::new(),
            thread_ts: None,
            unfurl_links: Some(false),
        }
    }

    pub fn with_blocks(mut self, blocks: Vec<SlackBlock>) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn in_thread(mut self, thread_ts: impl Into<String>) -> Self {
        self.thread_ts = Some(thread_ts.into());
        self
    }

    pub fn is_reply(&self) -> bool {
        self.thread_ts.is_some()
    }
}

/// Successful `chat.postMessage` result. The `ts` becomes the thread anchor
/// when the message was a root post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostedMessage {
    pub channel: String,
    pub ts: String,
}

/// A workspace member from `users.list`.
#[derive(Debug, Clone, Deserialize)]
pub struct SlackUser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub is_bot: bool,
}

/// Posting seam between the dispatcher and the Slack Web API.
#[async_trait]
pub trait SlackSender: Send + Sync {
    /// Post a message; returns the assigned `ts`.
    async fn post_message(&self, token: &str, message: &SlackMessage) -> Result<PostedMessage>;
}

/// Real Slack Web API client over reqwest.
///
/// Constructed per process and passed in explicitly; the base URL is
/// overridable for tests.
#[derive(Clone)]
pub struct SlackApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl SlackApiClient {
    pub fn new() -> Self {
        Self::with_base_url(SLACK_API_BASE)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn build_post_body(message: &SlackMessage) -> serde_json::Value {
        let mut body = serde_json::json!({
            "channel": message.channel,
            "text": message.text,
        });
        if !message.blocks.is_empty() {
            body["blocks"] = serde_json::to_value(&message.blocks).unwrap_or_default();
        }
        if let Some(ref ts) = message.thread_ts {
            body["thread_ts"] = serde_json::json!(ts);
        }
        if let Some(unfurl) = message.unfurl_links {
            body["unfurl_links"] = serde_json::json!(unfurl);
        }
        body
    }

    /// List workspace users. This is an administrative call and callers are
    /// expected to hold the per-team throttle before invoking it.
    pub async fn list_users(&self, token: &str) -> Result<Vec<SlackUser>> {
        let url = format!("{}/users.list", self.base_url);
        let response = self.http.get(&url).bearer_auth(token).send().await?;

        let data: serde_json::Value = response.json().await?;
        if data.get("ok") != Some(&serde_json::Value::Bool(true)) {
            let err = data
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown");
            return Err(Error::Slack(format!("users.list rejected: {}", err)));
        }

        let members = data
            .get("members")
            .cloned()
            .unwrap_or(serde_json::Value::Array(Vec::new()));
        Ok(serde_json::from_value(members)?)
    }
}

impl Default for SlackApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SlackSender for SlackApiClient {
    async fn post_message(&self, token: &str, message: &SlackMessage) -> Result<PostedMessage> {
        let url = format!("{}/chat.postMessage", self.base_url);
        let body = Self::build_post_body(message);

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let data: serde_json::Value = response.json().await?;
        if data.get("ok") != Some(&serde_json::Value::Bool(true)) {
            let err = data
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown");
            warn!(channel = %message.channel, error = %err, "chat.postMessage rejected");
            return Err(Error::Slack(format!("chat.postMessage rejected: {}", err)));
        }

        let ts = data
            .get("ts")
            .and_then(|t| t.as_str())
            .ok_or_else(|| Error::Slack("chat.postMessage response missing ts".to_string()))?
            .to_string();
        let channel = data
            .get("channel")
            .and_then(|c| c.as_str())
            .unwrap_or(&message.channel)
            .to_string();

        Ok(PostedMessage { channel, ts })
    }
}
