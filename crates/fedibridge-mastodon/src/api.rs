//! Wire types for the slice of the Mastodon client API the bridge uses.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// An account as returned by lookup or embedded in a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub id: String,
    /// Webfinger address; bare username for accounts on the local instance.
    pub acct: String,
    /// Profile bio, HTML.
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub group: bool,
}

/// Follow relationship flags between the bridge account and another account.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Relationship {
    #[serde(default)]
    pub following: bool,
    #[serde(default)]
    pub requested: bool,
    #[serde(default)]
    pub followed_by: bool,
    #[serde(default)]
    pub requested_by: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaAttachment {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Poll {
    pub id: String,
}

/// A status, trimmed to the fields the bridge inspects.
#[derive(Debug, Clone, Deserialize)]
pub struct Status {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub in_reply_to_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub spoiler_text: String,
    #[serde(default)]
    pub media_attachments: Vec<MediaAttachment>,
    #[serde(default)]
    pub poll: Option<Poll>,
    /// Public URL of the post.
    #[serde(default)]
    pub url: Option<String>,
}

/// One event from the user notification stream.
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub account: Account,
    #[serde(default)]
    pub status: Option<Status>,
}

/// Credentials of the bridge's own account.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialAccount {
    pub id: String,
    #[serde(default)]
    pub locked: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceStatusesConfig {
    #[serde(default)]
    pub max_characters: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceConfiguration {
    #[serde(default)]
    pub statuses: Option<InstanceStatusesConfig>,
}

/// Instance metadata, trimmed to the statuses configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    #[serde(default)]
    pub configuration: InstanceConfiguration,
}

impl Instance {
    pub fn max_characters(&self) -> Option<usize> {
        self.configuration
            .statuses
            .as_ref()
            .and_then(|s| s.max_characters)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainBlock {
    pub domain: String,
}
