//! Shared fixtures for the core integration tests: an in-memory store, the
//! shipped translation catalog, tempdir-backed state files and recording
//! mock implementations of both capability ports.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use fedibridge_core::config::BridgeConfig;
use fedibridge_core::error::TransportError;
use fedibridge_core::i18n::Messages;
use fedibridge_core::pipeline::BridgeContext;
use fedibridge_core::port::{
    Account, ChatPort, FediPort, PresenceKind, Relationship, StatusInfo, SubState,
};
use fedibridge_core::state::StateFiles;
use fedibridge_core::store::{BridgeStore, UserRow};
use fedibridge_core::Side;

/// One chat message captured by [`MockChat`].
#[derive(Debug, Clone)]
pub struct SentChat {
    pub to: String,
    pub body: String,
    pub lang: String,
}

/// Recording [`ChatPort`].
#[derive(Default)]
pub struct MockChat {
    pub sent: Mutex<Vec<SentChat>>,
    pub presences: Mutex<Vec<(String, PresenceKind)>>,
    pub removed: Mutex<Vec<String>>,
    /// Subscription state reported for every contact; `None` simulates a
    /// transient session that cannot answer.
    pub sub_state: Mutex<Option<SubState>>,
    pub fail_send: AtomicBool,
    counter: AtomicU32,
}

#[async_trait]
impl ChatPort for MockChat {
    async fn send_chat(&self, to: &str, body: &str, lang: &str) -> Result<String, TransportError> {
        if self.fail_send.load(Ordering::Relaxed) {
            return Err(TransportError::Xmpp("mock send failure".into()));
        }
        self.sent.lock().unwrap().push(SentChat {
            to: to.to_string(),
            body: body.to_string(),
            lang: lang.to_string(),
        });
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("xm{n}"))
    }

    async fn presence(&self, to: &str, kind: PresenceKind) -> Result<(), TransportError> {
        self.presences.lock().unwrap().push((to.to_string(), kind));
        Ok(())
    }

    async fn subscription_state(&self, _jid: &str) -> Result<SubState, TransportError> {
        self.sub_state
            .lock()
            .unwrap()
            .ok_or(TransportError::Unsupported)
    }

    async fn remove_contact(&self, jid: &str) -> Result<(), TransportError> {
        self.removed.lock().unwrap().push(jid.to_string());
        Ok(())
    }
}

/// One status captured by [`MockFedi`].
#[derive(Debug, Clone)]
pub struct PostedStatus {
    pub body: String,
    pub in_reply_to: Option<String>,
    pub lang: String,
}

/// Recording [`FediPort`].
#[derive(Default)]
pub struct MockFedi {
    pub accounts: Mutex<HashMap<String, Account>>,
    pub statuses: Mutex<Vec<StatusInfo>>,
    pub relationship: Mutex<Relationship>,
    pub posts: Mutex<Vec<PostedStatus>>,
    pub follows: Mutex<Vec<String>>,
    pub unfollows: Mutex<Vec<String>>,
    pub blocked_domains: Mutex<Vec<String>>,
    pub fail_post: AtomicBool,
    pub fail_statuses: AtomicBool,
    counter: AtomicU32,
}

impl MockFedi {
    /// Make `acct` resolvable with a plain human account.
    pub fn add_account(&self, acct: &str, id: &str) {
        self.accounts.lock().unwrap().insert(
            acct.to_string(),
            Account {
                id: id.to_string(),
                note: String::new(),
                bot: false,
                group: false,
            },
        );
    }

    /// Seed `count` statuses recent enough for the activity heuristic.
    pub fn seed_recent_statuses(&self, count: usize, language: Option<&str>) {
        let mut statuses = self.statuses.lock().unwrap();
        for i in 0..count {
            statuses.push(StatusInfo {
                created_at: Utc::now() - chrono::Duration::days(i as i64 % 20),
                language: language.map(str::to_string),
            });
        }
    }
}

#[async_trait]
impl FediPort for MockFedi {
    async fn lookup_account(&self, acct: &str) -> Result<Account, TransportError> {
        self.accounts
            .lock()
            .unwrap()
            .get(acct)
            .cloned()
            .ok_or_else(|| TransportError::Fedi(format!("no such account {acct}")))
    }

    async fn recent_statuses(
        &self,
        _id: &str,
        limit: u32,
    ) -> Result<Vec<StatusInfo>, TransportError> {
        if self.fail_statuses.load(Ordering::Relaxed) {
            return Err(TransportError::Fedi("mock status failure".into()));
        }
        let statuses = self.statuses.lock().unwrap();
        Ok(statuses.iter().take(limit as usize).cloned().collect())
    }

    async fn follow(&self, id: &str) -> Result<(), TransportError> {
        self.follows.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn unfollow(&self, id: &str) -> Result<(), TransportError> {
        self.unfollows.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn relationship(&self, _id: &str) -> Result<Relationship, TransportError> {
        Ok(*self.relationship.lock().unwrap())
    }

    async fn post_direct(
        &self,
        body: &str,
        in_reply_to: Option<&str>,
        lang: &str,
    ) -> Result<String, TransportError> {
        if self.fail_post.load(Ordering::Relaxed) {
            return Err(TransportError::Fedi("mock post failure".into()));
        }
        self.posts.lock().unwrap().push(PostedStatus {
            body: body.to_string(),
            in_reply_to: in_reply_to.map(str::to_string),
            lang: lang.to_string(),
        });
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("st{n}"))
    }

    async fn authorize_follow(&self, _id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn reject_follow(&self, _id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn domain_blocks(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.blocked_domains.lock().unwrap().clone())
    }
}

/// Everything a core test needs, wired together.
pub struct Fixture {
    pub dir: TempDir,
    pub config: BridgeConfig,
    pub messages: Messages,
    pub store: BridgeStore,
    pub state: StateFiles,
    pub chat: MockChat,
    pub fedi: MockFedi,
    pub http: reqwest::Client,
}

fn translations_dir() -> String {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../translations")
        .display()
        .to_string()
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let commands = [
        "register", "unregister", "report", "help", "block", "unblock", "blocks", "start",
        "stop", "users", "ablocks", "ablock", "aunblock", "ahelp", "redadd", "greenadd",
        "reddel", "greendel", "redlist", "greenlist", "open", "close", "status",
    ]
    .map(|c| format!("\"{c}\""))
    .join(", ");
    let path = dir.join("bridge.toml");
    std::fs::write(
        &path,
        format!(
            r#"
ap-bridge-jid = "bridge@xmpp.example"
ap-bridge-pass = "secret"
ap-instance = "fedi.example"
ap-admin = ["admin@fedi.example"]
xmpp-bridge-name = "bridge@fedi.example"
xmpp-bridge-token = "token"
xmpp-instance = "xmpp.example"
xmpp-admin = ["admin@xmpp.example"]
user-agent = "fedibridge-tests"
database-file = "{db}"
bridge-files-dir = "{files}"
default-lang = "en"
unknown-lang = "en"
command-list = [{commands}]
prefixes = ["@", "xmpp:", "!", "lang="]
max-char-per-post = 500
max-dest-to-send = 5
max-minutes-for-reply = 15
max-retention-days-revoked-user = 30
comm-max-limit-days = 30
translation-dir = "{translations}"
"#,
            db = dir.join("bridge.db").display(),
            files = dir.join("state").display(),
            translations = translations_dir(),
        ),
    )
    .unwrap();
    path
}

impl Fixture {
    pub async fn new() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (config, messages) = BridgeConfig::load(&write_config(dir.path())).unwrap();
        let state = StateFiles::new(&config);
        state.ensure_defaults().unwrap();
        let store = BridgeStore::in_memory().await.unwrap();
        Fixture {
            dir,
            config,
            messages,
            store,
            state,
            chat: MockChat::default(),
            fedi: MockFedi::default(),
            http: reqwest::Client::new(),
        }
    }

    /// Rebuild the state files after a config tweak that moves them.
    pub fn reload_state(&mut self) {
        self.state = StateFiles::new(&self.config);
        self.state.ensure_defaults().unwrap();
    }

    pub fn ctx(&self) -> BridgeContext<'_> {
        BridgeContext {
            config: &self.config,
            messages: &self.messages,
            store: &self.store,
            state: &self.state,
            chat: &self.chat,
            fedi: &self.fedi,
            http: &self.http,
        }
    }

    /// Insert an already-active registration directly.
    pub async fn seed_user(&self, side: Side, user: &str, app: &str) {
        self.seed_user_at(side, user, app, Utc::now()).await;
    }

    pub async fn seed_user_at(&self, side: Side, user: &str, app: &str, at: DateTime<Utc>) {
        self.store
            .insert_user(&UserRow {
                side,
                user: user.to_string(),
                req_date: Some(at),
                nb_reg: 1,
                lang: "en".to_string(),
                revoke_date: None,
                app: app.to_string(),
                acc_id: format!("id-{user}"),
            })
            .await
            .unwrap();
    }

    /// The message text for `key` in English, with placeholders unfilled.
    pub fn msg(&self, key: &str) -> String {
        self.messages.text(key, "en")
    }

    /// Leading part of a catalog entry, handy for `contains` assertions on
    /// templates with placeholders.
    pub fn msg_head(&self, key: &str) -> String {
        let text = self.msg(key);
        text.split("{}").next().unwrap_or_default().trim_end().to_string()
    }
}
