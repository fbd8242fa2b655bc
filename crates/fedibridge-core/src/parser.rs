//! Inbound message parsing.
//!
//! Turns a raw body (HTML when it comes from the Fediverse, plain text from
//! XMPP) into the structured token sets the rest of the pipeline works on:
//! commands, language directives, XMPP JIDs, ActivityPub addresses and bare
//! domains. Parsing is pure; all patterns are compiled once at config time.
//!
//! The Fediverse HTML is the machine-generated markup Mastodon-compatible
//! servers emit (`p`/`br`/`span` plus anchor mentions), so normalization
//! works on that shape rather than on arbitrary documents: anchors are
//! rewritten first, `<br>` becomes a newline, remaining tags are stripped
//! and entities decoded.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use url::Url;

use crate::config::BridgeConfig;
use crate::Side;

/// Structured view of one inbound message body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedContent {
    /// Command tokens, prefix stripped, lowercased, deduplicated.
    pub commands: Vec<String>,
    /// Two-letter language codes from `lang=` directives.
    pub lang_codes: Vec<String>,
    /// Bare JIDs addressed in the body (resource stripped).
    pub xmpp_jids: Vec<String>,
    /// Fully-qualified ActivityPub addresses in the body.
    pub ap_addrs: Vec<String>,
    /// Bare domain tokens (for the red/green list commands).
    pub domains: Vec<String>,
    /// Plain-text body, bridge's own mention removed.
    pub body: String,
    /// XMPP-side body contained a short `@name` mention with no domain.
    pub short_ap: bool,
}

impl ParsedContent {
    /// Addresses this message targets on the opposite side.
    pub fn recipients(&self, side: Side) -> &[String] {
        match side {
            Side::Fedi => &self.xmpp_jids,
            Side::Xmpp => &self.ap_addrs,
        }
    }
}

fn anchor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?is)<a\b([^>]*)>(.*?)</a>"#).unwrap())
}

fn attr_re(name: &str) -> Regex {
    Regex::new(&format!(r#"(?i){name}\s*=\s*["']([^"']*)["']"#)).unwrap()
}

fn br_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<br\s*/?>").unwrap())
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").unwrap())
}

fn inner_text(fragment: &str) -> String {
    tag_re().replace_all(fragment, "").into_owned()
}

/// Convert a Fediverse status body to plain text.
///
/// Anchor handling per the addressing rules: an `xmpp:` link keeps its text
/// followed by a space (so the JID token is whitespace-delimited), an
/// `http(s)` mention-class link whose text holds exactly one `@` is
/// qualified with the link's host (the local instance when absent), any
/// other anchor collapses to its text.
pub fn html_to_text(html: &str, ap_instance: &str) -> String {
    static HREF: OnceLock<Regex> = OnceLock::new();
    static CLASS: OnceLock<Regex> = OnceLock::new();
    let href_re = HREF.get_or_init(|| attr_re("href"));
    let class_re = CLASS.get_or_init(|| attr_re("class"));

    let rewritten = anchor_re().replace_all(html, |caps: &Captures| {
        let attrs = &caps[1];
        let text = inner_text(&caps[2]);
        let href = href_re.captures(attrs).map(|c| c[1].to_string());
        let class = class_re.captures(attrs).map(|c| c[1].to_string());
        match href.as_deref().and_then(|h| Url::parse(h).ok()) {
            Some(url) if url.scheme() == "xmpp" => format!("{text} "),
            Some(url)
                if matches!(url.scheme(), "http" | "https")
                    && class.as_deref().is_some_and(|c| c.contains("mention"))
                    && text.matches('@').count() == 1 =>
            {
                let host = url.host_str().unwrap_or(ap_instance);
                format!("{text}@{host}")
            }
            _ => text,
        }
    });
    let with_breaks = br_re().replace_all(&rewritten, "\n");
    let stripped = tag_re().replace_all(&with_breaks, "");
    html_escape::decode_html_entities(&stripped).into_owned()
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

/// Parse one inbound body into its token sets.
pub fn parse_content(config: &BridgeConfig, side: Side, raw: &str) -> ParsedContent {
    let patterns = &config.patterns;
    let mut body = match side {
        Side::Fedi => html_to_text(raw, &config.ap_instance),
        Side::Xmpp => raw.to_string(),
    };

    let lowered = body.to_lowercase();
    // Command tokens whose stem is the language prefix (e.g. "!lang" for a
    // "!lang=" directive prefix) are directives, not commands.
    let lang_stem = &config.pfix[3][..config.pfix[3].len().saturating_sub(1)];
    let mut commands = Vec::new();
    for caps in patterns.command.captures_iter(&lowered) {
        let token = &caps[1];
        if token == lang_stem {
            continue;
        }
        push_unique(
            &mut commands,
            token.strip_prefix(config.pfix[2].as_str()).unwrap_or(token).to_string(),
        );
    }

    let mut lang_codes = Vec::new();
    for caps in patterns.lang.captures_iter(&lowered) {
        let token = &caps[1];
        push_unique(&mut lang_codes, token[token.len() - 2..].to_string());
    }

    let mut xmpp_jids = Vec::new();
    for m in patterns.xmpp_jid.find_iter(&body) {
        let token = m.as_str();
        let bare = token
            .strip_prefix(config.pfix[1].as_str())
            .unwrap_or(token)
            .split('/')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        if bare != config.ap_bridge_jid {
            push_unique(&mut xmpp_jids, bare);
        }
    }

    let mut ap_addrs = Vec::new();
    for m in patterns.ap_addr.find_iter(&body) {
        let token = m.as_str();
        let acct = token
            .strip_prefix(config.pfix[0].as_str())
            .unwrap_or(token)
            .to_lowercase();
        if acct != config.xmpp_bridge_name {
            push_unique(&mut ap_addrs, acct);
        }
    }
    body = patterns.own_mention.replace_all(&body, "").into_owned();

    // Domains and short mentions are what is left once every fully
    // qualified address form is removed.
    let without_ap = patterns.ap_addr.replace_all(&body, "");
    let without_addrs = patterns.email.replace_all(&without_ap, "");
    let has_short_ap = patterns.ap_short.is_match(&without_addrs);
    let mut domains = Vec::new();
    for m in patterns.domain.find_iter(&without_addrs) {
        push_unique(&mut domains, m.as_str().to_lowercase());
    }

    ParsedContent {
        commands,
        lang_codes,
        xmpp_jids,
        ap_addrs,
        domains,
        body,
        short_ap: has_short_ap && side == Side::Xmpp,
    }
}
