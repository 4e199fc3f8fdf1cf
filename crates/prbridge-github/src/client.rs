//! GitHub App API client
//!
//! Authenticates as a GitHub App: a short-lived RS256 JWT signed with the
//! App's private key buys an installation access token, which is cached per
//! installation until shortly before expiry. The bridge only needs two REST
//! calls beyond token minting: organization membership for the username
//! sync, and nothing on the webhook path (webhooks are push, not pull).

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info};

const GITHUB_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "prbridge";

/// Refresh an installation token when it has less than this long to live.
const TOKEN_REFRESH_BUFFER_SECS: u64 = 300;

#[derive(Debug, serde::Serialize)]
struct AppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

/// A member of an organization, from `GET /orgs/{org}/members`.
#[derive(Debug, Clone, Deserialize)]
pub struct OrgMember {
    pub login: String,
    pub id: i64,
}

/// GitHub App client with per-installation token caching.
#[derive(Clone)]
pub struct GitHubAppClient {
    client: reqwest::Client,
    base_url: String,
    app_id: u64,
    private_key: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
}

impl GitHubAppClient {
    pub fn new(app_id: u64, private_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: GITHUB_API_BASE.to_string(),
            app_id,
            private_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Override the API base URL (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        // Backdate iat by 60s to absorb clock skew; GitHub caps exp at 10
        // minutes out.
        let claims = AppClaims {
            iss: self.app_id,
            iat: now - 60,
            exp: now + 600,
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("Failed to parse App private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode App JWT")
    }

    /// Get (or mint) an installation access token.
    pub async fn installation_token(&self, installation_id: u64) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                let remaining = expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs();
                if remaining > TOKEN_REFRESH_BUFFER_SECS {
                    debug!(installation_id, "Using cached installation token");
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.base_url, installation_id
        );

        info!(installation_id, "Requesting installation access token");

        let response = self
            .client
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .context("Failed to send installation token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Installation token request failed: {} - {}", status, body));
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);
        let expires_at_system =
            UNIX_EPOCH + std::time::Duration::from_secs(expires_at.timestamp().max(0) as u64);

        {
            let mut cache = self.token_cache.write().await;
            cache.insert(installation_id, (token_response.token.clone(), expires_at_system));
        }

        Ok(token_response.token)
    }

    /// List the members of an organization the installation can see.
    pub async fn list_org_members(
        &self,
        installation_id: u64,
        org: &str,
    ) -> Result<Vec<OrgMember>> {
        let token = self.installation_token(installation_id).await?;
        let url = format!("{}/orgs/{}/members", self.base_url, org);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github.v3+json")
            .query(&[("per_page", "100")])
            .send()
            .await
            .context("Failed to send org members request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Org members request failed: {} - {}", status, body));
        }

        response
            .json::<Vec<OrgMember>>()
            .await
            .context("Failed to parse org members response")
    }
}
