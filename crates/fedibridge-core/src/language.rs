//! Per-user UI language.
//!
//! Every reply the bridge sends is localized to the sender's stored
//! language; users change it with a `lang=xx` directive in any message.

use tracing::debug;

use crate::config::BridgeConfig;
use crate::error::StoreError;
use crate::i18n::Messages;
use crate::store::BridgeStore;
use crate::Side;

/// Language to use for this user right now: their stored language when it is
/// still a loaded one, the configured unknown-language fallback when it is
/// not, the default for users the bridge has never seen.
pub async fn current_language(
    store: &BridgeStore,
    messages: &Messages,
    config: &BridgeConfig,
    side: Side,
    user: &str,
) -> Result<String, StoreError> {
    Ok(match store.user(side, user).await? {
        Some(row) if messages.has_language(&row.lang) => row.lang,
        Some(_) => config.unknown_lang.clone(),
        None => config.default_lang.clone(),
    })
}

/// Result of processing the `lang=` directives of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageOutcome {
    /// Reply fragment (empty when there was nothing to say).
    pub reply: String,
    /// Language the rest of the pipeline should answer in.
    pub lang: String,
}

/// Apply the language directives extracted from a message.
///
/// No directive is a no-op; more than one is rejected; exactly one sets the
/// user's language (substituting the unknown-language fallback for an
/// unsupported code); only registered users have a row to update, so
/// unregistered senders get a "register first" notice instead.
pub async fn process_language(
    store: &BridgeStore,
    messages: &Messages,
    config: &BridgeConfig,
    side: Side,
    user: &str,
    lang_codes: &[String],
    current: &str,
) -> Result<LanguageOutcome, StoreError> {
    if lang_codes.len() > 1 {
        return Ok(LanguageOutcome {
            reply: messages.fill("onelang", current, &[config.pfix[3].as_str()]),
            lang: current.to_string(),
        });
    }
    let Some(code) = lang_codes.first() else {
        return Ok(LanguageOutcome {
            reply: String::new(),
            lang: current.to_string(),
        });
    };

    let mut reply = String::new();
    let lang = if messages.has_language(code) {
        code.clone()
    } else {
        reply.push_str(&messages.fill("unknownlang", current, &[code.as_str()]));
        config.unknown_lang.clone()
    };

    if store.set_lang(side, user, &lang).await? {
        debug!(%side, user, %lang, "language updated");
        reply.push_str(&messages.text("langset", &lang));
    } else {
        reply.push_str(&messages.text("langneedsreg", &lang));
    }
    Ok(LanguageOutcome { reply, lang })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::test_config;
    use crate::i18n::test_support::marker_catalog;
    use crate::store::UserRow;
    use chrono::Utc;

    fn catalog() -> Messages {
        marker_catalog(&["onelang", "unknownlang", "langset", "langneedsreg"])
    }

    async fn store_with_user(lang: &str) -> BridgeStore {
        let store = BridgeStore::in_memory().await.unwrap();
        store
            .insert_user(&UserRow {
                side: Side::Xmpp,
                user: "u@xmpp.example".into(),
                req_date: Some(Utc::now()),
                nb_reg: 1,
                lang: lang.into(),
                revoke_date: None,
                app: "XMPP".into(),
                acc_id: "0".into(),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn no_directive_is_a_noop() {
        let store = store_with_user("en").await;
        let out = process_language(
            &store,
            &catalog(),
            &test_config(),
            Side::Xmpp,
            "u@xmpp.example",
            &[],
            "en",
        )
        .await
        .unwrap();
        assert_eq!(out.reply, "");
        assert_eq!(out.lang, "en");
    }

    #[tokio::test]
    async fn several_directives_are_rejected_without_write() {
        let store = store_with_user("en").await;
        let out = process_language(
            &store,
            &catalog(),
            &test_config(),
            Side::Xmpp,
            "u@xmpp.example",
            &["fr".into(), "de".into()],
            "en",
        )
        .await
        .unwrap();
        assert_eq!(out.reply, "<onelang>");
        assert_eq!(out.lang, "en");
        let row = store.user(Side::Xmpp, "u@xmpp.example").await.unwrap().unwrap();
        assert_eq!(row.lang, "en");
    }

    #[tokio::test]
    async fn unknown_code_falls_back_and_still_writes() {
        let store = store_with_user("en").await;
        let out = process_language(
            &store,
            &catalog(),
            &test_config(),
            Side::Xmpp,
            "u@xmpp.example",
            &["zz".into()],
            "en",
        )
        .await
        .unwrap();
        // unknown-lang in the test config is "en"
        assert_eq!(out.lang, "en");
        assert!(out.reply.contains("<unknownlang>"));
        assert!(out.reply.contains("<langset>"));
    }

    #[tokio::test]
    async fn unregistered_sender_is_told_to_register() {
        let store = BridgeStore::in_memory().await.unwrap();
        let out = process_language(
            &store,
            &catalog(),
            &test_config(),
            Side::Xmpp,
            "ghost@xmpp.example",
            &["en".into()],
            "en",
        )
        .await
        .unwrap();
        assert_eq!(out.reply, "<langneedsreg>");
    }
}
