//! Bridge configuration.
//!
//! Loaded once at startup from a TOML file; the two secrets can be
//! overridden through environment variables so the file itself can be
//! world-readable. Token-extraction regexes are compiled here, once, and
//! carried alongside the plain values.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;
use crate::i18n::Messages;

/// Environment override for the bridge JID password.
pub const ENV_BRIDGE_PASS: &str = "FEDIBRIDGE_XMPP_PASS";
/// Environment override for the Mastodon API token.
pub const ENV_BRIDGE_TOKEN: &str = "FEDIBRIDGE_AP_TOKEN";

/// Command-slot indices into `command_list`.
///
/// The vocabulary itself is operator-configured (so commands can be
/// localized); slots are fixed by position.
pub mod cmd {
    pub const REGISTER: usize = 0;
    pub const UNREGISTER: usize = 1;
    pub const REPORT: usize = 2;
    pub const HELP: usize = 3;
    pub const BLOCK: usize = 4;
    pub const UNBLOCK: usize = 5;
    pub const LIST_BLOCKS: usize = 6;
    pub const START: usize = 7;
    pub const STOP: usize = 8;
    pub const LIST_USERS: usize = 9;
    pub const LIST_INST_BLOCKS: usize = 10;
    pub const ADMIN_BLOCK: usize = 11;
    pub const ADMIN_UNBLOCK: usize = 12;
    pub const ADMIN_HELP: usize = 13;
    pub const ADD_RED: usize = 14;
    pub const ADD_GREEN: usize = 15;
    pub const DEL_RED: usize = 16;
    pub const DEL_GREEN: usize = 17;
    pub const LIST_RED: usize = 18;
    pub const LIST_GREEN: usize = 19;
    pub const OPEN: usize = 20;
    pub const CLOSE: usize = 21;
    pub const STATUS: usize = 22;

    /// Number of slots a valid `command-list` must carry.
    pub const COUNT: usize = 23;
}

/// Raw on-disk shape of the config file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    ap_bridge_jid: String,
    #[serde(default)]
    ap_bridge_pass: String,
    ap_instance: String,
    #[serde(default)]
    ap_admin: Vec<String>,
    xmpp_bridge_name: String,
    #[serde(default)]
    xmpp_bridge_token: String,
    xmpp_instance: String,
    #[serde(default)]
    xmpp_admin: Vec<String>,
    user_agent: String,
    log_file: Option<PathBuf>,
    database_file: PathBuf,
    bridge_files_dir: PathBuf,
    default_lang: String,
    unknown_lang: String,
    command_list: Vec<String>,
    prefixes: Vec<String>,
    max_char_per_post: usize,
    #[serde(default)]
    min_ap_activity_posts: u32,
    #[serde(default)]
    greenlist_mode: bool,
    #[serde(default)]
    max_ap_registrations: i64,
    #[serde(default)]
    max_reg_users: i64,
    max_dest_to_send: usize,
    #[serde(default)]
    max_minutes_for_reply: i64,
    #[serde(default)]
    max_user_rate: usize,
    #[serde(default)]
    max_retention_days_revoked_user: i64,
    #[serde(default)]
    comm_max_limit_days: i64,
    #[serde(default)]
    silent_block: bool,
    #[serde(default)]
    silent_send: bool,
    #[serde(default)]
    help_url: HashMap<String, String>,
    #[serde(default)]
    ahelp_url: HashMap<String, String>,
    translation_dir: PathBuf,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// The bridge's own XMPP JID.
    pub ap_bridge_jid: String,
    /// Password for the bridge JID.
    pub ap_bridge_pass: String,
    /// Domain of the local Fediverse instance.
    pub ap_instance: String,
    /// Fediverse accounts with admin rights over the bridge.
    pub ap_admin: Vec<String>,
    /// The bridge's own Fediverse account (`name@domain`).
    pub xmpp_bridge_name: String,
    /// Mastodon API access token of the bridge account.
    pub xmpp_bridge_token: String,
    /// Domain of the local XMPP server.
    pub xmpp_instance: String,
    /// JIDs with admin rights over the bridge.
    pub xmpp_admin: Vec<String>,
    /// User-Agent header for all outbound HTTP.
    pub user_agent: String,
    /// Optional log file; stderr when unset.
    pub log_file: Option<PathBuf>,
    /// SQLite database path shared by both listeners.
    pub database_file: PathBuf,
    /// Relay on/off token file.
    pub start_file: PathBuf,
    /// Registration open/closed token file.
    pub open_file: PathBuf,
    /// Domain redlist file.
    pub dred_file: PathBuf,
    /// Domain greenlist file.
    pub dgreen_file: PathBuf,
    /// Language used for users the bridge has never seen.
    pub default_lang: String,
    /// Language substituted for unsupported codes.
    pub unknown_lang: String,
    /// The 23 command tokens, indexed by [`cmd`].
    pub command_list: Vec<String>,
    /// `[ap mention, xmpp, command, language]` prefixes.
    pub pfix: [String; 4],
    /// Max characters per Fediverse post (may be refreshed from the instance).
    pub char_limit: usize,
    /// Minimum recent posts for Fediverse admission (0 disables, capped at 40).
    pub min_active: u32,
    /// When set, only local and greenlisted domains may register.
    pub green_mode: bool,
    /// Re-registration cap per user (0 disables).
    pub max_reg: i64,
    /// Cap on simultaneously active users (0 disables).
    pub max_reg_users: i64,
    /// Max recipients of one dispatch (>= 1).
    pub max_dest: usize,
    /// Window in minutes for address-less replies/resends (0 disables).
    pub max_reply: i64,
    /// Max messages per sender per 5 minutes (0 disables).
    pub max_rate: usize,
    /// Days a revoked user row is retained (0 disables the sweep).
    pub retention: i64,
    /// Days a correspondence row is retained (0 disables the sweep).
    pub comm_limit: i64,
    /// Suppress the "you are blocked" warning direction.
    pub silent_block: bool,
    /// Suppress per-recipient success notices.
    pub silent_send: bool,
    /// Per-language user help URL.
    pub help_url: HashMap<String, String>,
    /// Per-language admin help URL.
    pub ahelp_url: HashMap<String, String>,
    /// Translation catalog directory.
    pub translation_dir: PathBuf,
    /// Whether the bridge's Fediverse account requires follow approval.
    pub account_locked: bool,
    /// Compiled token-extraction patterns.
    pub patterns: Patterns,
}

/// Token-extraction regexes, compiled once per process.
#[derive(Debug, Clone)]
pub struct Patterns {
    /// `!command` tokens.
    pub command: Regex,
    /// `lang=xx` directives.
    pub lang: Regex,
    /// `xmpp:user@domain(/resource)` addresses.
    pub xmpp_jid: Regex,
    /// `@user@domain` addresses.
    pub ap_addr: Regex,
    /// Bare `user@domain` (email form, used for removal before domain scan).
    pub email: Regex,
    /// Short `@name` mentions.
    pub ap_short: Regex,
    /// Bare `host.tld` tokens.
    pub domain: Regex,
    /// The bridge's own Fediverse mention, for stripping.
    pub own_mention: Regex,
}

impl Patterns {
    fn compile(pfix: &[String; 4], xmpp_bridge_name: &str) -> Result<Patterns, ConfigError> {
        let build = |raw: String| {
            Regex::new(&raw).map_err(|e| ConfigError::Invalid(format!("bad pattern {raw}: {e}")))
        };
        let addr = r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}";
        Ok(Patterns {
            command: build(format!(r"(?m)(?:^|\s)({}[a-zA-Z]+)\b", regex::escape(&pfix[2])))?,
            lang: build(format!(r"(?m)(?:^|\s)({}[a-zA-Z]{{2}})\b", regex::escape(&pfix[3])))?,
            xmpp_jid: build(format!(
                r"\b{}{}(?:/[\w-]+)?\b",
                regex::escape(&pfix[1]),
                addr
            ))?,
            ap_addr: build(format!(r"{}{}\b", regex::escape(&pfix[0]), addr))?,
            email: build(format!(r"{}\b", addr))?,
            ap_short: build(format!(r"{}[a-zA-Z0-9._%+-]+", regex::escape(&pfix[0])))?,
            domain: build(r"[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}\b".to_string())?,
            own_mention: build(format!(
                r"(?i){}{}",
                regex::escape(&pfix[0]),
                regex::escape(xmpp_bridge_name)
            ))?,
        })
    }
}

impl BridgeConfig {
    /// Load and validate the config file, then load the translation catalog
    /// it points at. Secrets fall back to the environment.
    pub fn load(path: &Path) -> Result<(BridgeConfig, Messages), ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&raw)?;

        if raw.command_list.len() != cmd::COUNT {
            return Err(ConfigError::Invalid(format!(
                "command-list must hold {} entries, got {}",
                cmd::COUNT,
                raw.command_list.len()
            )));
        }
        let pfix: [String; 4] = raw
            .prefixes
            .try_into()
            .map_err(|v: Vec<String>| {
                ConfigError::Invalid(format!("prefixes must hold 4 entries, got {}", v.len()))
            })?;

        let ap_bridge_pass = env::var(ENV_BRIDGE_PASS).unwrap_or(raw.ap_bridge_pass);
        let xmpp_bridge_token = env::var(ENV_BRIDGE_TOKEN).unwrap_or(raw.xmpp_bridge_token);
        if ap_bridge_pass.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "ap-bridge-pass missing (set it or {})",
                ENV_BRIDGE_PASS
            )));
        }
        if xmpp_bridge_token.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "xmpp-bridge-token missing (set it or {})",
                ENV_BRIDGE_TOKEN
            )));
        }

        let patterns = Patterns::compile(&pfix, &raw.xmpp_bridge_name)?;

        // Clamp rather than reject: 0 recipients would make every send fail,
        // a rate lower than max-dest would let one fan-out trip the limiter,
        // and the Fediverse API caps status page sizes at 40.
        let mut max_dest = raw.max_dest_to_send.max(1);
        if raw.max_user_rate > 0 {
            max_dest = max_dest.min(raw.max_user_rate);
        }
        let min_active = raw.min_ap_activity_posts.min(40);

        let messages = Messages::load(&raw.translation_dir)?;
        if !messages.has_language(&raw.default_lang) {
            return Err(ConfigError::Invalid(format!(
                "default-lang {} has no translation file",
                raw.default_lang
            )));
        }
        if !messages.has_language(&raw.unknown_lang) {
            return Err(ConfigError::Invalid(format!(
                "unknown-lang {} has no translation file",
                raw.unknown_lang
            )));
        }

        let mut help_url = raw.help_url;
        let mut ahelp_url = raw.ahelp_url;
        let fallback_url = format!("https://{}/@{}", raw.ap_instance, raw.xmpp_bridge_name);
        for lang in messages.languages() {
            help_url.entry(lang.clone()).or_insert_with(|| fallback_url.clone());
            ahelp_url.entry(lang.clone()).or_insert_with(|| fallback_url.clone());
        }

        let config = BridgeConfig {
            ap_bridge_jid: raw.ap_bridge_jid.to_lowercase(),
            ap_bridge_pass,
            ap_instance: raw.ap_instance,
            ap_admin: raw.ap_admin,
            xmpp_bridge_name: raw.xmpp_bridge_name.to_lowercase(),
            xmpp_bridge_token,
            xmpp_instance: raw.xmpp_instance,
            xmpp_admin: raw.xmpp_admin,
            user_agent: raw.user_agent,
            log_file: raw.log_file,
            database_file: raw.database_file,
            start_file: raw.bridge_files_dir.join("bridge-start.txt"),
            open_file: raw.bridge_files_dir.join("bridge-open.txt"),
            dred_file: raw.bridge_files_dir.join("bridge-red.txt"),
            dgreen_file: raw.bridge_files_dir.join("bridge-green.txt"),
            default_lang: raw.default_lang,
            unknown_lang: raw.unknown_lang,
            command_list: raw.command_list,
            pfix,
            char_limit: raw.max_char_per_post,
            min_active,
            green_mode: raw.greenlist_mode,
            max_reg: raw.max_ap_registrations,
            max_reg_users: raw.max_reg_users,
            max_dest,
            max_reply: raw.max_minutes_for_reply,
            max_rate: raw.max_user_rate,
            retention: raw.max_retention_days_revoked_user,
            comm_limit: raw.comm_max_limit_days,
            silent_block: raw.silent_block,
            silent_send: raw.silent_send,
            help_url,
            ahelp_url,
            translation_dir: raw.translation_dir,
            account_locked: false,
            patterns,
        };
        Ok((config, messages))
    }

    /// Apply the settings fetched from the local Fediverse instance at
    /// startup. Either value is optional: on fetch failure the configured
    /// defaults stand.
    pub fn apply_instance_settings(&mut self, locked: Option<bool>, char_limit: Option<usize>) {
        if let Some(locked) = locked {
            self.account_locked = locked;
        }
        if let Some(limit) = char_limit {
            self.char_limit = limit;
        }
        info!(
            locked = self.account_locked,
            char_limit = self.char_limit,
            "instance settings applied"
        );
    }

    /// The command token stored in slot `idx`.
    pub fn command(&self, idx: usize) -> &str {
        &self.command_list[idx]
    }

    /// True when `domain` is one of the two local instances.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        domain == self.ap_instance || domain == self.xmpp_instance
    }

    /// Admin list for the given side.
    pub fn admins(&self, side: crate::Side) -> &[String] {
        match side {
            crate::Side::Fedi => &self.ap_admin,
            crate::Side::Xmpp => &self.xmpp_admin,
        }
    }

    /// The bridge's own address on the given side.
    pub fn bridge_address(&self, side: crate::Side) -> &str {
        match side {
            crate::Side::Fedi => &self.xmpp_bridge_name,
            crate::Side::Xmpp => &self.ap_bridge_jid,
        }
    }

    /// Address prefix used when writing addresses of the given side.
    pub fn prefix_for(&self, side: crate::Side) -> &str {
        match side {
            crate::Side::Fedi => &self.pfix[0],
            crate::Side::Xmpp => &self.pfix[1],
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a config without touching the filesystem; used across the
    /// crate's unit tests.
    pub fn test_config() -> BridgeConfig {
        let pfix = [
            "@".to_string(),
            "xmpp:".to_string(),
            "!".to_string(),
            "lang=".to_string(),
        ];
        let command_list: Vec<String> = [
            "register", "unregister", "report", "help", "block", "unblock", "blocks", "start",
            "stop", "users", "ablocks", "ablock", "aunblock", "ahelp", "redadd", "greenadd",
            "reddel", "greendel", "redlist", "greenlist", "open", "close", "status",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let patterns = Patterns::compile(&pfix, "bridge@fedi.example").unwrap();
        BridgeConfig {
            ap_bridge_jid: "bridge@xmpp.example".into(),
            ap_bridge_pass: "secret".into(),
            ap_instance: "fedi.example".into(),
            ap_admin: vec!["admin@fedi.example".into()],
            xmpp_bridge_name: "bridge@fedi.example".into(),
            xmpp_bridge_token: "token".into(),
            xmpp_instance: "xmpp.example".into(),
            xmpp_admin: vec!["admin@xmpp.example".into()],
            user_agent: "fedibridge-test".into(),
            log_file: None,
            database_file: ":memory:".into(),
            start_file: PathBuf::new(),
            open_file: PathBuf::new(),
            dred_file: PathBuf::new(),
            dgreen_file: PathBuf::new(),
            default_lang: "en".into(),
            unknown_lang: "en".into(),
            command_list,
            pfix,
            char_limit: 500,
            min_active: 0,
            green_mode: false,
            max_reg: 0,
            max_reg_users: 0,
            max_dest: 5,
            max_reply: 15,
            max_rate: 0,
            retention: 30,
            comm_limit: 30,
            silent_block: false,
            silent_send: false,
            help_url: HashMap::new(),
            ahelp_url: HashMap::new(),
            translation_dir: PathBuf::new(),
            account_locked: false,
            patterns,
        }
    }
}
