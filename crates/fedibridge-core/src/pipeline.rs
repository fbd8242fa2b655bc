//! Shared dispatch pipeline.
//!
//! Both listeners normalize their native events into a [`Dispatch`] and call
//! [`handle_dispatch`]: parse the body, apply language directives, run the
//! command interpreter, and, when the message carried no command, route it
//! to the other universe. The returned string (possibly empty) is the reply
//! to send back to the originating user, already localized.

use tracing::{debug, instrument};

use crate::commands;
use crate::config::BridgeConfig;
use crate::error::StoreError;
use crate::i18n::Messages;
use crate::language;
use crate::parser;
use crate::port::{ChatPort, FediPort};
use crate::sender;
use crate::state::StateFiles;
use crate::store::BridgeStore;
use crate::Side;

/// Everything a pipeline invocation needs, borrowed from the listener.
pub struct BridgeContext<'a> {
    pub config: &'a BridgeConfig,
    pub messages: &'a Messages,
    pub store: &'a BridgeStore,
    pub state: &'a StateFiles,
    pub chat: &'a dyn ChatPort,
    pub fedi: &'a dyn FediPort,
    pub http: &'a reqwest::Client,
}

/// One normalized inbound event.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// Universe the sender lives in.
    pub side: Side,
    /// Sender address, lowercased by the listener.
    pub sender: String,
    /// Raw body (HTML when `side` is Fedi).
    pub body: String,
    /// Sender-side message id.
    pub from_id: String,
    /// Sender-side id of the message this one replies to, when the
    /// transport knows it (Fediverse only).
    pub reply_id: Option<String>,
}

/// Run one inbound message through the core pipeline.
///
/// Returns the localized reply for the sender; `None` means there is
/// nothing to answer.
#[instrument(skip_all, fields(side = %dispatch.side, sender = %dispatch.sender))]
pub async fn handle_dispatch(
    ctx: &BridgeContext<'_>,
    dispatch: &Dispatch,
) -> Result<Option<String>, StoreError> {
    let content = parser::parse_content(ctx.config, dispatch.side, &dispatch.body);
    debug!(
        commands = ?content.commands,
        recipients = content.recipients(dispatch.side).len(),
        langs = ?content.lang_codes,
        "parsed"
    );

    let current = language::current_language(
        ctx.store,
        ctx.messages,
        ctx.config,
        dispatch.side,
        &dispatch.sender,
    )
    .await?;
    let lang_out = language::process_language(
        ctx.store,
        ctx.messages,
        ctx.config,
        dispatch.side,
        &dispatch.sender,
        &content.lang_codes,
        &current,
    )
    .await?;

    let cmd_out = commands::process_instruction(
        ctx,
        dispatch.side,
        &dispatch.sender,
        &content,
        &lang_out.lang,
    )
    .await?;
    let mut response = format!("{}{}", lang_out.reply, cmd_out.reply);

    // Route as a relayed message only when no command was given and the
    // message was more than a bare language directive.
    let only_lang_directive =
        !content.lang_codes.is_empty() && content.recipients(dispatch.side).is_empty();
    if content.commands.is_empty() && !only_lang_directive {
        let send_reply = sender::send_message(
            ctx,
            dispatch.side,
            &dispatch.sender,
            &content,
            &dispatch.from_id,
            dispatch.reply_id.as_deref(),
            &cmd_out.lang,
        )
        .await?;
        response.push_str(&send_reply);
    }

    Ok(if response.is_empty() {
        None
    } else {
        Some(response)
    })
}
