//! Fediverse listener.
//!
//! Subscribes to the bridge account's notification stream and reacts to
//! mentions (relay), follows and follow requests (registration). XMPP-side
//! effects go through one-shot sessions. The stream is re-established after
//! a short delay whenever it drops.

use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use fedibridge_bots::{apply_instance_settings, startup, RECONNECT_DELAY_SECS};
use fedibridge_core::pipeline::{handle_dispatch, BridgeContext, Dispatch};
use fedibridge_core::state::StateFiles;
use fedibridge_core::store::BridgeStore;
use fedibridge_core::{init, language, registrar, Side};
use fedibridge_mastodon::{MastodonClient, Notification};
use fedibridge_xmpp::TransientSession;

#[tokio::main]
async fn main() -> Result<()> {
    let (mut config, messages, _log_guard) = startup()?;
    info!(version = env!("CARGO_PKG_VERSION"), "fediverse listener starting");

    let mastodon = MastodonClient::new(
        &config.ap_instance,
        &config.xmpp_bridge_token,
        &config.user_agent,
    )?;
    apply_instance_settings(&mut config, &mastodon).await;

    let store = BridgeStore::open(&config.database_file).await?;
    let state = StateFiles::new(&config);
    let http = mastodon.http().clone();
    let transient = TransientSession::new(&config.ap_bridge_jid, &config.ap_bridge_pass)
        .map_err(|e| anyhow::anyhow!("bad bridge jid: {e}"))?;

    let ctx = BridgeContext {
        config: &config,
        messages: &messages,
        store: &store,
        state: &state,
        chat: &transient,
        fedi: &mastodon,
        http: &http,
    };
    init::initialize(&ctx, Side::Fedi).await?;

    loop {
        match mastodon.notification_stream().await {
            Ok(mut stream) => loop {
                match stream.next_notification().await {
                    Ok(Some(notification)) => {
                        handle_notification(&ctx, &mastodon, notification).await;
                    }
                    Ok(None) => {
                        warn!("notification stream closed by the server");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "notification stream failed");
                        break;
                    }
                }
            },
            Err(e) => error!(error = %e, "cannot open notification stream"),
        }
        warn!(delay = RECONNECT_DELAY_SECS, "reconnecting notification stream");
        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }
}

async fn handle_notification(
    ctx: &BridgeContext<'_>,
    mastodon: &MastodonClient,
    notification: Notification,
) {
    match notification.kind.as_str() {
        "mention" | "follow" | "follow_request" => {}
        _ => return,
    }
    // A locked bridge account receives both follow_request and (after
    // approval) follow for the same user; only the first one registers.
    if ctx.config.account_locked && notification.kind == "follow" {
        return;
    }

    let mut user_from = notification.account.acct.to_lowercase();
    if !user_from.contains('@') {
        user_from = format!("{}@{}", user_from, ctx.config.ap_instance);
    }
    let lang = language::current_language(ctx.store, ctx.messages, ctx.config, Side::Fedi, &user_from)
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "language lookup failed");
            ctx.config.default_lang.clone()
        });

    if notification.kind == "mention" {
        handle_mention(ctx, mastodon, notification, user_from, lang).await;
    } else {
        handle_follow(ctx, mastodon, &notification.kind, user_from, lang).await;
    }
}

/// Follows register; on a locked account the pending request is authorized
/// or rejected according to the outcome.
async fn handle_follow(
    ctx: &BridgeContext<'_>,
    mastodon: &MastodonClient,
    kind: &str,
    user_from: String,
    lang: String,
) {
    let outcome = match registrar::register(ctx, Side::Fedi, &user_from, true, &lang).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(sender = %user_from, error = %e, "follow dropped on store failure");
            return;
        }
    };
    if kind == "follow_request" {
        let decision = if outcome.success {
            mastodon.follow_request_authorize(&outcome.acc_id).await
        } else {
            mastodon.follow_request_reject(&outcome.acc_id).await
        };
        if let Err(e) = decision {
            warn!(sender = %user_from, error = %e, "cannot settle follow request");
        }
    }
    if !outcome.reply.is_empty() {
        let body = format!("@{} \n{}", user_from, outcome.reply);
        if let Err(e) = mastodon.status_post_direct(&body, None, &outcome.lang).await {
            warn!(sender = %user_from, error = %e, "cannot deliver registration notice");
        }
    }
}

/// Mentions are relayed; content-warning, media and poll annotations are
/// folded into the body before parsing.
async fn handle_mention(
    ctx: &BridgeContext<'_>,
    mastodon: &MastodonClient,
    notification: Notification,
    user_from: String,
    lang: String,
) {
    let Some(status) = notification.status else {
        return;
    };

    let mut content = status.content.clone();
    if status.sensitive {
        content = format!(
            "<p>{}</p><br /><p>{}</p><br /><br />{}",
            ctx.messages.text("cw", &lang).trim(),
            status.spoiler_text,
            content
        );
    }
    let media_urls: Vec<&str> = status
        .media_attachments
        .iter()
        .filter_map(|m| m.url.as_deref())
        .collect();
    if !media_urls.is_empty() {
        content.push_str(&format!(
            "<br /><br /><p>{}</p><br />",
            ctx.messages.text("media", &lang).trim()
        ));
        for url in media_urls {
            content.push_str(&format!("<p>{url}</p><br />"));
        }
    }
    if status.poll.is_some() {
        content.push_str(&format!(
            "<br /><br /><p>{}</p><br /><p>{}</p>",
            ctx.messages.text("poll", &lang).trim(),
            status.url.as_deref().unwrap_or_default()
        ));
    }

    let dispatch = Dispatch {
        side: Side::Fedi,
        sender: user_from.clone(),
        body: content,
        from_id: status.id.clone(),
        reply_id: status.in_reply_to_id.clone(),
    };
    match handle_dispatch(ctx, &dispatch).await {
        Ok(Some(response)) => {
            let body = format!("@{} \n{}", user_from, response);
            if let Err(e) = mastodon
                .status_post_direct(&body, Some(&status.id), &lang)
                .await
            {
                warn!(sender = %user_from, error = %e, "cannot deliver reply");
            }
        }
        Ok(None) => {}
        Err(e) => error!(sender = %user_from, error = %e, "dispatch dropped on store failure"),
    }
}
