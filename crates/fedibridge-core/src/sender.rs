//! Cross-universe message routing.
//!
//! Runs when a message carried no command: preflight gates (relay stopped,
//! sender rate, short-mention form), recipient resolution through the
//! correspondence log when no address was given, auto-registration of the
//! sender, then the fan-out: one XMPP message per recipient going
//! FEDI→XMPP, one combined direct status going XMPP→FEDI.

use chrono::{Duration, Utc};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::config::cmd;
use crate::error::StoreError;
use crate::parser::ParsedContent;
use crate::pipeline::BridgeContext;
use crate::registrar;
use crate::store::CommRow;
use crate::Side;

/// Route one address-carrying (or reply/resend) message. Returns the
/// localized reply for the sender.
#[instrument(skip_all, fields(%side, sender))]
pub async fn send_message(
    ctx: &BridgeContext<'_>,
    side: Side,
    sender: &str,
    content: &ParsedContent,
    from_id: &str,
    reply_id: Option<&str>,
    lang: &str,
) -> Result<String, StoreError> {
    let messages = ctx.messages;
    let mut lang = lang.to_string();
    let opposite = side.opposite();
    let opposite_prefix = ctx.config.prefix_for(opposite).to_string();

    if !ctx.state.relay_enabled()? {
        return Ok(messages.text("stopped", &lang));
    }
    if ctx.config.max_rate > 0 {
        let window = Utc::now() - Duration::minutes(5);
        let recent = ctx
            .store
            .count_comm_from_since(opposite, sender, window)
            .await?;
        if recent >= ctx.config.max_rate as i64 {
            return Ok(messages.text("maxrate", &lang));
        }
    }
    // Short @name mentions are ambiguous across universes.
    if content.short_ap {
        return Ok(messages.fill("apshort", &lang, &[opposite_prefix.as_str()]));
    }

    let mut is_reply = reply_id.is_some();
    let mut reply_id = reply_id.map(str::to_string);
    let mut recipients: Vec<String> = content.recipients(side).to_vec();
    let mut body = content.body.clone();

    if recipients.is_empty() {
        match side {
            Side::Fedi => {
                if is_reply {
                    let id = reply_id.as_deref().unwrap_or_default();
                    if let Some(row) = ctx.store.comm_by_id_to(Side::Fedi, id).await? {
                        // Replying to a bridged message: answer its sender.
                        recipients = vec![row.from_u];
                    } else {
                        // Replying to one's own earlier fan-out: resend to
                        // the same recipients.
                        let rows = ctx.store.comm_by_id_from(Side::Xmpp, id).await?;
                        recipients = rows.into_iter().map(|r| r.user).collect();
                    }
                    if recipients.is_empty() {
                        return Ok(messages.fill("noreply", &lang, &[opposite_prefix.as_str()]));
                    }
                } else {
                    return Ok(messages.fill(
                        "noaddr0",
                        &lang,
                        &[
                            opposite_prefix.as_str(),
                            ctx.config.pfix[2].as_str(),
                            ctx.config.command(cmd::HELP),
                        ],
                    ));
                }
            }
            Side::Xmpp => {
                // No explicit reply ids exist on XMPP: decide between
                // "reply to the last message I received" and "resend to my
                // last fan-out" by recency, within the reply window.
                let last_in = ctx.store.last_comm_to(Side::Xmpp, sender).await?;
                let last_out = ctx
                    .store
                    .recent_comm_from(Side::Fedi, sender, ctx.config.max_dest)
                    .await?;
                let now = Utc::now();
                let within =
                    |row: &CommRow| within_check(ctx.config.max_reply, now, row.from_date);
                if let Some(e1) = last_in.filter(|e1| {
                    last_out.first().map_or(true, |e2| e1.from_date > e2.from_date) && within(e1)
                }) {
                    recipients = vec![e1.from_u.clone()];
                    reply_id = Some(e1.id_from.clone());
                    is_reply = true;
                } else if last_out.first().is_some_and(within) {
                    let ident = last_out[0].id_from.clone();
                    recipients = last_out
                        .into_iter()
                        .filter(|r| r.id_from == ident)
                        .map(|r| r.user)
                        .collect();
                } else {
                    let minutes = ctx.config.max_reply.to_string();
                    return Ok(messages.fill(
                        "noaddr1",
                        &lang,
                        &[
                            opposite_prefix.as_str(),
                            minutes.as_str(),
                            ctx.config.pfix[2].as_str(),
                            ctx.config.command(cmd::HELP),
                        ],
                    ));
                }
                // The outbound status must mention its recipients.
                for rcpt in &recipients {
                    body.push_str(&format!("\n{}{}", ctx.config.pfix[0], rcpt));
                }
            }
        }
        debug!(resolved = recipients.len(), is_reply, "recipients from correspondence log");
    }

    if recipients.len() > ctx.config.max_dest {
        let cap = ctx.config.max_dest.to_string();
        return Ok(messages.fill("toomany", &lang, &[cap.as_str()]));
    }

    // Sending a message is an implicit opt-in.
    let mut reply = String::new();
    if !ctx.store.is_active(side, sender).await? {
        let out = registrar::register(ctx, side, sender, false, &lang).await?;
        reply = out.reply;
        lang = out.lang;
        if !out.success {
            return Ok(reply);
        }
    }

    let app = ctx
        .store
        .user(side, sender)
        .await?
        .map(|row| row.app)
        .unwrap_or_else(|| "Unknown".to_string());

    match side {
        Side::Fedi => {
            deliver_to_xmpp(
                ctx, sender, &recipients, body, &app, is_reply, from_id, &mut reply, &lang,
            )
            .await?;
        }
        Side::Xmpp => {
            deliver_to_fedi(
                ctx,
                sender,
                &recipients,
                body,
                &app,
                is_reply,
                from_id,
                reply_id.as_deref(),
                &mut reply,
                &lang,
            )
            .await?;
        }
    }
    Ok(reply)
}

fn within_check(max_reply: i64, now: chrono::DateTime<Utc>, at: chrono::DateTime<Utc>) -> bool {
    max_reply == 0 || now - at < Duration::minutes(max_reply)
}

/// Block state between sender and one recipient, with the warning fragments
/// the sender should see. `silent_block` hides the "you are blocked"
/// direction only.
async fn blocked_state(
    ctx: &BridgeContext<'_>,
    side: Side,
    sender: &str,
    user_to: &str,
    lang: &str,
) -> Result<(String, bool), StoreError> {
    let messages = ctx.messages;
    let opposite_prefix = ctx.config.prefix_for(side.opposite());
    let mut warning = String::new();
    let mut blocked = false;
    if ctx.store.has_block(side, sender, user_to).await? {
        warning.push_str(&messages.fill("blocking", lang, &[opposite_prefix, user_to]));
        blocked = true;
    }
    if ctx
        .store
        .has_block(side.opposite(), user_to, sender)
        .await?
    {
        if !ctx.config.silent_block {
            warning.push_str(&messages.fill("blocked", lang, &[opposite_prefix, user_to]));
        }
        blocked = true;
    }
    Ok((warning, blocked))
}

/// FEDI→XMPP: one chat message per recipient, each recorded separately.
#[allow(clippy::too_many_arguments)]
async fn deliver_to_xmpp(
    ctx: &BridgeContext<'_>,
    sender: &str,
    recipients: &[String],
    mut body: String,
    app: &str,
    is_reply: bool,
    from_id: &str,
    reply: &mut String,
    lang: &str,
) -> Result<(), StoreError> {
    let messages = ctx.messages;
    let mut first = true;
    for user_to in recipients {
        let (warning, blocked) = blocked_state(ctx, Side::Fedi, sender, user_to, lang).await?;
        if blocked {
            reply.push_str(&warning);
            continue;
        }
        if first {
            let header_key = if is_reply { "answer" } else { "newmsg" };
            body = format!("> {}{}", messages.fill(header_key, lang, &[app, sender]), body);
            first = false;
        }
        match ctx.chat.send_chat(user_to, &body, lang).await {
            Ok(id_to) => {
                if !ctx.config.silent_send {
                    reply.push_str(&messages.fill(
                        "oksend",
                        lang,
                        &[ctx.config.prefix_for(Side::Xmpp), user_to.as_str()],
                    ));
                }
                ctx.store
                    .add_comm(&CommRow {
                        side: Side::Xmpp,
                        user: user_to.clone(),
                        from_u: sender.to_string(),
                        from_date: Utc::now(),
                        id_from: from_id.to_string(),
                        id_to,
                    })
                    .await?;
            }
            Err(e) => {
                warn!(user_to = %user_to, error = %e, "xmpp delivery failed");
                reply.push_str(&messages.fill(
                    "errsend",
                    lang,
                    &[ctx.config.prefix_for(Side::Xmpp), user_to.as_str()],
                ));
            }
        }
    }
    Ok(())
}

/// XMPP→FEDI: blocked or unregistered recipients are stripped from the
/// mentions, then a single direct-visibility status carries the fan-out;
/// one `comm` row per surviving recipient shares the posted status id.
#[allow(clippy::too_many_arguments)]
async fn deliver_to_fedi(
    ctx: &BridgeContext<'_>,
    sender: &str,
    recipients: &[String],
    mut body: String,
    app: &str,
    is_reply: bool,
    from_id: &str,
    reply_id: Option<&str>,
    reply: &mut String,
    lang: &str,
) -> Result<(), StoreError> {
    let messages = ctx.messages;
    let ap_prefix = ctx.config.pfix[0].as_str();
    let mut delivered: Vec<String> = Vec::new();
    for user_to in recipients {
        if !ctx.store.is_active(Side::Fedi, user_to).await? {
            reply.push_str(&messages.fill("isnotreg", lang, &[ap_prefix, user_to.as_str()]));
            body = strip_mention(&body, ap_prefix, user_to);
            continue;
        }
        let (warning, blocked) = blocked_state(ctx, Side::Xmpp, sender, user_to, lang).await?;
        if blocked {
            reply.push_str(&warning);
            body = strip_mention(&body, ap_prefix, user_to);
            continue;
        }
        delivered.push(user_to.clone());
    }

    if body.chars().count() > ctx.config.char_limit {
        let cap = ctx.config.char_limit.to_string();
        *reply = messages.fill("toolong", lang, &[cap.as_str()]);
        return Ok(());
    }

    let header_key = if is_reply { "answer" } else { "newmsg" };
    body = format!("*** {}{}", messages.fill(header_key, lang, &[app, sender]), body);
    match ctx.fedi.post_direct(&body, reply_id, lang).await {
        Ok(status_id) => {
            if !ctx.config.silent_send {
                reply.push_str(&messages.text("oksendfedi", lang));
            }
            for user_to in delivered {
                ctx.store
                    .add_comm(&CommRow {
                        side: Side::Fedi,
                        user: user_to,
                        from_u: sender.to_string(),
                        from_date: Utc::now(),
                        id_from: from_id.to_string(),
                        id_to: status_id.clone(),
                    })
                    .await?;
            }
        }
        Err(e) => {
            warn!(error = %e, "fediverse post failed");
            reply.push_str(&messages.text("errsendfedi", lang));
        }
    }
    Ok(())
}

/// Demote a mention to plain text so the posted status does not notify a
/// recipient the message will not reach.
fn strip_mention(body: &str, prefix: &str, user: &str) -> String {
    let pattern = format!("(?i){}{}", regex::escape(prefix), regex::escape(user));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(body, user).into_owned(),
        Err(_) => body.to_string(),
    }
}
