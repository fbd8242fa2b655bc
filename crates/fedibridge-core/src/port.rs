//! Capability seams between the core and the two universes.
//!
//! The core is executed from two very different contexts: the persistent
//! XMPP session of the XMPP listener, and the synchronous notification
//! handler of the Fediverse listener (which dials a throwaway XMPP session
//! when it has to touch the roster). Both hand the core a [`ChatPort`] and
//! a [`FediPort`]; the core never cares which concrete session kind is
//! behind them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::TransportError;

/// Presence stanza kinds the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
}

/// Mutual presence subscription state with a contact (RFC 6121).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    None,
    To,
    From,
    Both,
}

/// The slice of a Fediverse account the registrar inspects.
#[derive(Debug, Clone, Default)]
pub struct Account {
    pub id: String,
    /// Profile bio, HTML as served by the instance.
    pub note: String,
    pub bot: bool,
    pub group: bool,
}

/// The slice of a status used by the activity heuristic.
#[derive(Debug, Clone)]
pub struct StatusInfo {
    pub created_at: DateTime<Utc>,
    pub language: Option<String>,
}

/// Follow relationship between the bridge account and a user.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relationship {
    pub following: bool,
    pub requested: bool,
    pub followed_by: bool,
    pub requested_by: bool,
}

/// XMPP capability: send chat messages and manage presence subscriptions.
#[async_trait]
pub trait ChatPort: Send + Sync {
    /// Send a chat message; returns the stanza id recorded in the
    /// correspondence log.
    async fn send_chat(&self, to: &str, body: &str, lang: &str) -> Result<String, TransportError>;

    /// Send a presence subscription stanza.
    async fn presence(&self, to: &str, kind: PresenceKind) -> Result<(), TransportError>;

    /// Mutual subscription state with `jid`. Transient sessions answer
    /// [`TransportError::Unsupported`]; callers fall back to a generic
    /// contact message.
    async fn subscription_state(&self, jid: &str) -> Result<SubState, TransportError>;

    /// Sever the relation with `jid` entirely: `unsubscribe`,
    /// `unsubscribed`, then drop the roster item.
    async fn remove_contact(&self, jid: &str) -> Result<(), TransportError>;
}

/// ActivityPub capability: the Mastodon client API calls the core relies on.
#[async_trait]
pub trait FediPort: Send + Sync {
    async fn lookup_account(&self, acct: &str) -> Result<Account, TransportError>;

    /// Up to `limit` most recent statuses of an account.
    async fn recent_statuses(
        &self,
        id: &str,
        limit: u32,
    ) -> Result<Vec<StatusInfo>, TransportError>;

    /// Follow without boosts or notifications.
    async fn follow(&self, id: &str) -> Result<(), TransportError>;

    async fn unfollow(&self, id: &str) -> Result<(), TransportError>;

    async fn relationship(&self, id: &str) -> Result<Relationship, TransportError>;

    /// Post one direct-visibility status; returns its id.
    async fn post_direct(
        &self,
        body: &str,
        in_reply_to: Option<&str>,
        lang: &str,
    ) -> Result<String, TransportError>;

    async fn authorize_follow(&self, id: &str) -> Result<(), TransportError>;

    async fn reject_follow(&self, id: &str) -> Result<(), TransportError>;

    /// Domains blocked by the local instance itself.
    async fn domain_blocks(&self) -> Result<Vec<String>, TransportError>;
}
