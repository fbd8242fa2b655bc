//! Mastodon client API surface used by the bridge.
//!
//! A thin reqwest wrapper over the handful of endpoints the core consumes,
//! plus the user notification stream. The [`MastodonClient`] implements
//! [`fedibridge_core::port::FediPort`] so the core never sees HTTP.

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument};

use fedibridge_core::error::TransportError;
use fedibridge_core::port;

pub mod api;
pub mod stream;

pub use api::{Account, CredentialAccount, Instance, Notification, Relationship, Status};
pub use stream::NotificationStream;

/// Mastodon API failure.
#[derive(Error, Debug)]
pub enum MastodonError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

impl From<MastodonError> for TransportError {
    fn from(e: MastodonError) -> TransportError {
        TransportError::Fedi(e.to_string())
    }
}

/// Client bound to one instance and one access token.
#[derive(Clone)]
pub struct MastodonClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl MastodonClient {
    /// Build a client for `instance` (a bare domain, or a full URL).
    pub fn new(instance: &str, token: &str, user_agent: &str) -> Result<MastodonClient, MastodonError> {
        let http = reqwest::Client::builder().user_agent(user_agent).build()?;
        let base = if instance.starts_with("http://") || instance.starts_with("https://") {
            instance.trim_end_matches('/').to_string()
        } else {
            format!("https://{instance}")
        };
        Ok(MastodonClient {
            http,
            base,
            token: token.to_string(),
        })
    }

    /// The underlying HTTP client (shared with the nodeinfo probe).
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn expect_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, MastodonError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MastodonError::Api {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    /// `GET /api/v1/accounts/verify_credentials`
    pub async fn verify_credentials(&self) -> Result<CredentialAccount, MastodonError> {
        self.expect_json(self.http.get(self.url("/api/v1/accounts/verify_credentials")))
            .await
    }

    /// `GET /api/v1/instance`
    pub async fn instance(&self) -> Result<Instance, MastodonError> {
        self.expect_json(self.http.get(self.url("/api/v1/instance"))).await
    }

    /// `GET /api/v1/accounts/lookup?acct=`
    pub async fn account_lookup(&self, acct: &str) -> Result<Account, MastodonError> {
        self.expect_json(
            self.http
                .get(self.url("/api/v1/accounts/lookup"))
                .query(&[("acct", acct)]),
        )
        .await
    }

    /// `GET /api/v1/accounts/{id}/statuses?limit=`
    pub async fn account_statuses(&self, id: &str, limit: u32) -> Result<Vec<Status>, MastodonError> {
        self.expect_json(
            self.http
                .get(self.url(&format!("/api/v1/accounts/{id}/statuses")))
                .query(&[("limit", limit.to_string())]),
        )
        .await
    }

    /// `POST /api/v1/accounts/{id}/follow` without boosts or notifications.
    pub async fn account_follow(&self, id: &str) -> Result<Relationship, MastodonError> {
        self.expect_json(
            self.http
                .post(self.url(&format!("/api/v1/accounts/{id}/follow")))
                .json(&json!({"reblogs": false, "notify": false})),
        )
        .await
    }

    /// `POST /api/v1/accounts/{id}/unfollow`
    pub async fn account_unfollow(&self, id: &str) -> Result<Relationship, MastodonError> {
        self.expect_json(
            self.http
                .post(self.url(&format!("/api/v1/accounts/{id}/unfollow"))),
        )
        .await
    }

    /// `GET /api/v1/accounts/relationships?id[]=`
    pub async fn account_relationship(&self, id: &str) -> Result<Relationship, MastodonError> {
        let all: Vec<Relationship> = self
            .expect_json(
                self.http
                    .get(self.url("/api/v1/accounts/relationships"))
                    .query(&[("id[]", id)]),
            )
            .await?;
        Ok(all.into_iter().next().unwrap_or_default())
    }

    /// `POST /api/v1/statuses` with direct visibility.
    #[instrument(skip(self, status))]
    pub async fn status_post_direct(
        &self,
        status: &str,
        in_reply_to_id: Option<&str>,
        language: &str,
    ) -> Result<Status, MastodonError> {
        self.expect_json(self.http.post(self.url("/api/v1/statuses")).json(&json!({
            "status": status,
            "in_reply_to_id": in_reply_to_id,
            "visibility": "direct",
            "language": language,
        })))
        .await
    }

    /// `POST /api/v1/follow_requests/{id}/authorize`
    pub async fn follow_request_authorize(&self, id: &str) -> Result<Relationship, MastodonError> {
        self.expect_json(
            self.http
                .post(self.url(&format!("/api/v1/follow_requests/{id}/authorize"))),
        )
        .await
    }

    /// `POST /api/v1/follow_requests/{id}/reject`
    pub async fn follow_request_reject(&self, id: &str) -> Result<Relationship, MastodonError> {
        self.expect_json(
            self.http
                .post(self.url(&format!("/api/v1/follow_requests/{id}/reject"))),
        )
        .await
    }

    /// `GET /api/v1/instance/domain_blocks`
    pub async fn instance_domain_blocks(&self) -> Result<Vec<String>, MastodonError> {
        let blocks: Vec<api::DomainBlock> = self
            .expect_json(self.http.get(self.url("/api/v1/instance/domain_blocks")))
            .await?;
        Ok(blocks.into_iter().map(|b| b.domain).collect())
    }

    /// Open the user notification stream
    /// (`GET /api/v1/streaming/user/notification`).
    pub async fn notification_stream(&self) -> Result<NotificationStream, MastodonError> {
        let response = self
            .http
            .get(self.url("/api/v1/streaming/user/notification"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MastodonError::Api {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        debug!("notification stream established");
        let chunks = response.bytes_stream().map_err(MastodonError::from);
        Ok(NotificationStream::from_chunks(chunks))
    }
}

#[async_trait]
impl port::FediPort for MastodonClient {
    async fn lookup_account(&self, acct: &str) -> Result<port::Account, TransportError> {
        let account = self.account_lookup(acct).await?;
        Ok(port::Account {
            id: account.id,
            note: account.note,
            bot: account.bot,
            group: account.group,
        })
    }

    async fn recent_statuses(
        &self,
        id: &str,
        limit: u32,
    ) -> Result<Vec<port::StatusInfo>, TransportError> {
        let statuses = self.account_statuses(id, limit).await?;
        Ok(statuses
            .into_iter()
            .map(|s| port::StatusInfo {
                created_at: s.created_at,
                language: s.language,
            })
            .collect())
    }

    async fn follow(&self, id: &str) -> Result<(), TransportError> {
        self.account_follow(id).await?;
        Ok(())
    }

    async fn unfollow(&self, id: &str) -> Result<(), TransportError> {
        self.account_unfollow(id).await?;
        Ok(())
    }

    async fn relationship(&self, id: &str) -> Result<port::Relationship, TransportError> {
        let rel = self.account_relationship(id).await?;
        Ok(port::Relationship {
            following: rel.following,
            requested: rel.requested,
            followed_by: rel.followed_by,
            requested_by: rel.requested_by,
        })
    }

    async fn post_direct(
        &self,
        body: &str,
        in_reply_to: Option<&str>,
        lang: &str,
    ) -> Result<String, TransportError> {
        let status = self.status_post_direct(body, in_reply_to, lang).await?;
        Ok(status.id)
    }

    async fn authorize_follow(&self, id: &str) -> Result<(), TransportError> {
        self.follow_request_authorize(id).await?;
        Ok(())
    }

    async fn reject_follow(&self, id: &str) -> Result<(), TransportError> {
        self.follow_request_reject(id).await?;
        Ok(())
    }

    async fn domain_blocks(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.instance_domain_blocks().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> MastodonClient {
        MastodonClient::new(&server.uri(), "test-token", "fedibridge-tests").unwrap()
    }

    #[tokio::test]
    async fn lookup_sends_token_and_maps_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/accounts/lookup"))
            .and(query_param("acct", "ann@fedi.example"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "7", "acct": "ann@fedi.example",
                "note": "<p>hello</p>", "bot": true, "group": false,
            })))
            .mount(&server)
            .await;

        let account = client(&server).await.account_lookup("ann@fedi.example").await.unwrap();
        assert_eq!(account.id, "7");
        assert!(account.bot);
        assert_eq!(account.note, "<p>hello</p>");
    }

    #[tokio::test]
    async fn status_post_is_direct_and_threaded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/statuses"))
            .and(body_partial_json(serde_json::json!({
                "visibility": "direct",
                "in_reply_to_id": "41",
                "language": "en",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "42", "content": "", "created_at": "2025-05-01T10:00:00.000Z",
            })))
            .mount(&server)
            .await;

        let status = client(&server)
            .await
            .status_post_direct("hello", Some("41"), "en")
            .await
            .unwrap();
        assert_eq!(status.id, "42");
    }

    #[tokio::test]
    async fn empty_relationship_array_defaults_to_no_relation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/accounts/relationships"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let rel = client(&server).await.account_relationship("7").await.unwrap();
        assert!(!rel.following && !rel.requested);
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/instance"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let err = client(&server).await.instance().await.unwrap_err();
        match err {
            MastodonError::Api { status, body } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(body, "unauthorized");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
