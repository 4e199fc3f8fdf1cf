//! prbridge GitHub - GitHub REST API client
//!
//! GitHub App authentication (signed JWT → installation access token) and
//! the small set of REST calls the bridge consumes.

pub mod client;

pub use client::{GitHubAppClient, OrgMember};
