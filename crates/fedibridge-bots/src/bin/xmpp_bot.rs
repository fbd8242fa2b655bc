//! XMPP listener.
//!
//! Holds a persistent session for the bridge JID, reacts to chat messages
//! and presence subscription changes, and loops forever: a dropped stream
//! is recreated after a short delay.

use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use fedibridge_bots::{apply_instance_settings, startup, RECONNECT_DELAY_SECS};
use fedibridge_core::pipeline::{handle_dispatch, BridgeContext, Dispatch};
use fedibridge_core::port::{ChatPort, PresenceKind};
use fedibridge_core::state::StateFiles;
use fedibridge_core::store::BridgeStore;
use fedibridge_core::{init, language, manager, registrar, Side};
use fedibridge_mastodon::MastodonClient;
use fedibridge_xmpp::{BridgeSession, SessionEvent, TransientSession};

#[tokio::main]
async fn main() -> Result<()> {
    let (mut config, messages, _log_guard) = startup()?;
    info!(version = env!("CARGO_PKG_VERSION"), "xmpp listener starting");

    let mastodon = MastodonClient::new(
        &config.ap_instance,
        &config.xmpp_bridge_token,
        &config.user_agent,
    )?;
    apply_instance_settings(&mut config, &mastodon).await;

    let store = BridgeStore::open(&config.database_file).await?;
    let state = StateFiles::new(&config);
    let http = mastodon.http().clone();

    // Startup cleanup runs before the stream exists, so roster operations
    // go through one-shot sessions.
    {
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
        init::initialize(&ctx, Side::Xmpp).await?;
    }

    loop {
        match BridgeSession::connect(&config.ap_bridge_jid, &config.ap_bridge_pass) {
            Ok(session) => {
                let ctx = BridgeContext {
                    config: &config,
                    messages: &messages,
                    store: &store,
                    state: &state,
                    chat: &session,
                    fedi: &mastodon,
                    http: &http,
                };
                run_session(&ctx, &session).await;
            }
            Err(e) => error!(error = %e, "cannot create session"),
        }
        warn!(
            delay = RECONNECT_DELAY_SECS,
            "disconnected from the XMPP server, reconnecting"
        );
        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }
}

/// Drive one session until the stream dies.
async fn run_session(ctx: &BridgeContext<'_>, session: &BridgeSession) {
    loop {
        match session.next_event().await {
            SessionEvent::Closed => return,
            SessionEvent::Ready => info!("session ready"),
            SessionEvent::Chat { from, id, body } => {
                handle_chat(ctx, session, from, id, body).await;
            }
            SessionEvent::Subscribe { from } => handle_subscribe(ctx, session, from).await,
            SessionEvent::Unsubscribe { from } => handle_unsubscribe(ctx, from).await,
        }
    }
}

async fn sender_language(ctx: &BridgeContext<'_>, sender: &str) -> String {
    language::current_language(ctx.store, ctx.messages, ctx.config, Side::Xmpp, sender)
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "language lookup failed");
            ctx.config.default_lang.clone()
        })
}

async fn handle_chat(
    ctx: &BridgeContext<'_>,
    session: &BridgeSession,
    from: String,
    id: String,
    body: String,
) {
    let lang = sender_language(ctx, &from).await;
    let dispatch = Dispatch {
        side: Side::Xmpp,
        sender: from.clone(),
        body,
        from_id: id,
        reply_id: None,
    };
    match handle_dispatch(ctx, &dispatch).await {
        Ok(Some(response)) => {
            if let Err(e) = session.send_chat(&from, &response, &lang).await {
                warn!(to = %from, error = %e, "cannot deliver reply");
            }
        }
        Ok(None) => {}
        Err(e) => error!(sender = %from, error = %e, "dispatch dropped on store failure"),
    }
}

/// A presence `subscribe` doubles as a registration request.
async fn handle_subscribe(ctx: &BridgeContext<'_>, session: &BridgeSession, from: String) {
    let lang = sender_language(ctx, &from).await;
    match registrar::register(ctx, Side::Xmpp, &from, true, &lang).await {
        Ok(outcome) => {
            let kind = if outcome.success {
                PresenceKind::Subscribed
            } else {
                PresenceKind::Unsubscribed
            };
            if let Err(e) = session.presence(&from, kind).await {
                warn!(to = %from, error = %e, "cannot answer subscription");
            }
            if !outcome.reply.is_empty() {
                if let Err(e) = session.send_chat(&from, &outcome.reply, &outcome.lang).await {
                    warn!(to = %from, error = %e, "cannot deliver registration notice");
                }
            }
        }
        Err(e) => error!(sender = %from, error = %e, "subscribe dropped on store failure"),
    }
}

/// A presence `unsubscribe` revokes the registration; the severing presence
/// answers go out as part of the roster cleanup.
async fn handle_unsubscribe(ctx: &BridgeContext<'_>, from: String) {
    let lang = sender_language(ctx, &from).await;
    match manager::unregister(ctx, Side::Xmpp, &from, true, &lang).await {
        Ok(reply) => {
            if !reply.is_empty() {
                if let Err(e) = ctx.chat.send_chat(&from, &reply, &lang).await {
                    warn!(to = %from, error = %e, "cannot deliver unregistration notice");
                }
            }
        }
        Err(e) => error!(sender = %from, error = %e, "unsubscribe dropped on store failure"),
    }
}
