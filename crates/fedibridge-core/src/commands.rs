//! Command interpreter.
//!
//! The vocabulary is positional: the operator configures 23 command words
//! (so they can be localized) and each slot has a fixed meaning, see
//! [`crate::config::cmd`]. Slots 0–6 are user commands, the rest are
//! admin-only. Exactly one command per message is executed.

use tracing::{instrument, warn};

use crate::config::cmd;
use crate::error::StoreError;
use crate::manager;
use crate::parser::ParsedContent;
use crate::pipeline::BridgeContext;
use crate::registrar;
use crate::state::DomainList;
use crate::Side;

/// Result of the command phase.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Localized reply (empty when no command was present).
    pub reply: String,
    /// Language for the rest of the pipeline (a register command may have
    /// adopted the account's posting language).
    pub lang: String,
}

fn rg_index(list: DomainList) -> usize {
    match list {
        DomainList::Red => 0,
        DomainList::Green => 1,
    }
}

fn rg_key(base: &str, list: DomainList) -> String {
    format!("{}{}", base, rg_index(list))
}

/// Execute the command carried by `content`, if any.
#[instrument(skip_all, fields(%side, sender))]
pub async fn process_instruction(
    ctx: &BridgeContext<'_>,
    side: Side,
    sender: &str,
    content: &ParsedContent,
    lang: &str,
) -> Result<CommandOutcome, StoreError> {
    let messages = ctx.messages;
    let mut lang = lang.to_string();
    let mut reply = String::new();

    if content.commands.len() > 1 {
        reply = messages.fill("onecom", &lang, &[ctx.config.pfix[2].as_str()]);
    } else if let Some(word) = content.commands.first() {
        let recipients = content.recipients(side);
        let idx = ctx.config.command_list.iter().position(|c| c == word);
        match idx {
            Some(cmd::REGISTER) => {
                let out = registrar::register(ctx, side, sender, false, &lang).await?;
                reply = out.reply;
                lang = out.lang;
            }
            Some(cmd::UNREGISTER) => {
                reply = manager::unregister(ctx, side, sender, false, &lang).await?;
            }
            Some(cmd::REPORT) => {
                reply = report(ctx, side, sender, &content.body, &lang).await;
            }
            Some(cmd::HELP) => {
                let opposite_label = side.opposite().to_string();
                let url = ctx
                    .config
                    .help_url
                    .get(&lang)
                    .cloned()
                    .unwrap_or_default();
                reply = messages.fill(
                    "help",
                    &lang,
                    &[
                        ctx.config.prefix_for(side),
                        ctx.config.bridge_address(side),
                        opposite_label.as_str(),
                        ctx.config.prefix_for(side.opposite()),
                        ctx.config.pfix[2].as_str(),
                        ctx.config.command(cmd::BLOCK),
                        ctx.config.command(cmd::UNBLOCK),
                        ctx.config.command(cmd::LIST_BLOCKS),
                        ctx.config.command(cmd::REGISTER),
                        ctx.config.command(cmd::UNREGISTER),
                        ctx.config.command(cmd::REPORT),
                        ctx.config.command(cmd::HELP),
                        ctx.config.pfix[3].as_str(),
                        url.as_str(),
                    ],
                );
            }
            Some(user_cmd @ (cmd::BLOCK | cmd::UNBLOCK | cmd::LIST_BLOCKS)) => {
                if !ctx.store.is_active(side, sender).await? {
                    reply = messages.text("needtoreg", &lang);
                } else {
                    reply = match user_cmd {
                        cmd::BLOCK => add_blocks(ctx, side, sender, recipients, &lang).await?,
                        cmd::UNBLOCK => del_blocks(ctx, side, sender, recipients, &lang).await?,
                        _ => list_blocks(ctx, side, sender, &lang).await?,
                    };
                }
            }
            Some(admin_cmd) => {
                if !ctx.config.admins(side).iter().any(|a| a == sender) {
                    reply = messages.text("notadmin", &lang);
                } else {
                    reply = match admin_cmd {
                        cmd::START | cmd::STOP => {
                            ctx.state.write_run_token(word)?;
                            messages.text(word, &lang)
                        }
                        cmd::OPEN | cmd::CLOSE => {
                            ctx.state.write_reg_token(word)?;
                            messages.text(word, &lang)
                        }
                        cmd::LIST_USERS => list_users(ctx, &lang).await?,
                        cmd::LIST_INST_BLOCKS => list_inst_blocks(ctx, &lang).await?,
                        cmd::ADMIN_BLOCK => {
                            admin_block(ctx, side, recipients, &lang).await?
                        }
                        cmd::ADMIN_UNBLOCK => {
                            admin_unblock(ctx, side, recipients, &lang).await?
                        }
                        cmd::ADMIN_HELP => {
                            let url = ctx
                                .config
                                .ahelp_url
                                .get(&lang)
                                .cloned()
                                .unwrap_or_default();
                            messages.fill(
                                "ahelp",
                                &lang,
                                &[
                                    ctx.config.pfix[2].as_str(),
                                    ctx.config.command(cmd::START),
                                    ctx.config.command(cmd::STOP),
                                    ctx.config.command(cmd::LIST_USERS),
                                    ctx.config.command(cmd::ADMIN_BLOCK),
                                    ctx.config.command(cmd::ADMIN_UNBLOCK),
                                    ctx.config.command(cmd::LIST_INST_BLOCKS),
                                    ctx.config.command(cmd::ADD_GREEN),
                                    ctx.config.command(cmd::DEL_GREEN),
                                    ctx.config.command(cmd::LIST_GREEN),
                                    ctx.config.command(cmd::ADD_RED),
                                    ctx.config.command(cmd::DEL_RED),
                                    ctx.config.command(cmd::LIST_RED),
                                    ctx.config.command(cmd::ADMIN_HELP),
                                    url.as_str(),
                                    ctx.config.command(cmd::OPEN),
                                    ctx.config.command(cmd::CLOSE),
                                    ctx.config.command(cmd::STATUS),
                                ],
                            )
                        }
                        cmd::ADD_RED => {
                            add_domains(ctx, content, DomainList::Red, &lang).await?
                        }
                        cmd::ADD_GREEN => {
                            add_domains(ctx, content, DomainList::Green, &lang).await?
                        }
                        cmd::DEL_RED => {
                            del_domains(ctx, content, DomainList::Red, &lang).await?
                        }
                        cmd::DEL_GREEN => {
                            del_domains(ctx, content, DomainList::Green, &lang).await?
                        }
                        cmd::LIST_RED => list_domains(ctx, DomainList::Red, &lang)?,
                        cmd::LIST_GREEN => list_domains(ctx, DomainList::Green, &lang)?,
                        cmd::STATUS => status(ctx, &lang)?,
                        _ => unreachable!("command index out of table"),
                    };
                }
            }
            None => {
                reply = messages.fill("notacom", &lang, &[ctx.config.pfix[2].as_str()]);
            }
        }

        // Commands that do not consume the address list tell the sender
        // explicitly that nothing was relayed.
        let coexists = matches!(
            idx,
            Some(cmd::REPORT)
                | Some(cmd::BLOCK)
                | Some(cmd::UNBLOCK)
                | Some(cmd::ADMIN_BLOCK)
                | Some(cmd::ADMIN_UNBLOCK)
        );
        if !recipients.is_empty() && !coexists {
            reply.push_str(&messages.fill("nomsg", &lang, &[ctx.config.pfix[2].as_str()]));
        }
    }

    // Fediverse replies are posts and must fit the instance limit.
    if side == Side::Fedi {
        reply = truncate_reply(ctx, &lang, reply);
    }

    Ok(CommandOutcome { reply, lang })
}

/// Cut an over-long Fediverse reply and append the truncation marker.
pub fn truncate_reply(ctx: &BridgeContext<'_>, lang: &str, reply: String) -> String {
    let marker = ctx.messages.text("truncated", lang);
    let chars: Vec<char> = reply.chars().collect();
    if chars.len() < ctx.config.char_limit {
        return reply;
    }
    let keep = chars.len().saturating_sub(marker.chars().count() + 1);
    let mut out: String = chars[..keep].iter().collect();
    out.push('\n');
    out.push_str(&marker);
    out
}

/// Forward the message body to the first XMPP admin.
async fn report(
    ctx: &BridgeContext<'_>,
    side: Side,
    sender: &str,
    body: &str,
    lang: &str,
) -> String {
    let messages = ctx.messages;
    let Some(admin) = ctx.config.xmpp_admin.first() else {
        return messages.text("xmppadminempty", lang);
    };
    let header = messages.fill("report", lang, &[ctx.config.prefix_for(side), sender]);
    let forwarded = format!("> {header}{body}");
    match ctx.chat.send_chat(admin, &forwarded, lang).await {
        Ok(_) => messages.text("reportok", lang),
        Err(e) => {
            warn!(admin = %admin, error = %e, "report delivery failed");
            messages.fill("errsend", lang, &[ctx.config.pfix[1].as_str(), admin.as_str()])
        }
    }
}

async fn add_blocks(
    ctx: &BridgeContext<'_>,
    side: Side,
    sender: &str,
    recipients: &[String],
    lang: &str,
) -> Result<String, StoreError> {
    let messages = ctx.messages;
    let opposite_prefix = ctx.config.prefix_for(side.opposite());
    if recipients.is_empty() {
        return Ok(messages.fill("noblocks", lang, &[opposite_prefix]));
    }
    let mut reply = String::new();
    for blocked in recipients {
        let key = if ctx
            .store
            .add_block(side, sender, blocked, chrono::Utc::now())
            .await?
        {
            "addblocks"
        } else {
            "blockexists"
        };
        reply.push_str(&messages.fill(key, lang, &[opposite_prefix, blocked.as_str()]));
    }
    Ok(reply)
}

async fn del_blocks(
    ctx: &BridgeContext<'_>,
    side: Side,
    sender: &str,
    recipients: &[String],
    lang: &str,
) -> Result<String, StoreError> {
    let messages = ctx.messages;
    let opposite_prefix = ctx.config.prefix_for(side.opposite());
    if recipients.is_empty() {
        return Ok(messages.fill("nounblocks", lang, &[opposite_prefix]));
    }
    let mut reply = String::new();
    for blocked in recipients {
        let key = if ctx.store.del_block(side, sender, blocked).await? {
            "delblocks"
        } else {
            "blocknotexists"
        };
        reply.push_str(&messages.fill(key, lang, &[opposite_prefix, blocked.as_str()]));
    }
    Ok(reply)
}

async fn list_blocks(
    ctx: &BridgeContext<'_>,
    side: Side,
    sender: &str,
    lang: &str,
) -> Result<String, StoreError> {
    let messages = ctx.messages;
    let blocks = ctx.store.blocks_of(side, sender).await?;
    if blocks.is_empty() {
        return Ok(messages.text("emptyblocks", lang));
    }
    let count = blocks.len().to_string();
    let mut reply = messages.fill("listblocks", lang, &[count.as_str()]);
    let opposite_prefix = ctx.config.prefix_for(side.opposite());
    for block in blocks {
        reply.push_str(&format!("- {}{}\n", opposite_prefix, block.blocked));
    }
    reply.push('\n');
    Ok(reply)
}

async fn list_users(ctx: &BridgeContext<'_>, lang: &str) -> Result<String, StoreError> {
    let messages = ctx.messages;
    let users = ctx.store.active_users().await?;
    if users.is_empty() {
        return Ok(messages.text("emptyusers", lang));
    }
    let count = users.len().to_string();
    let mut reply = messages.fill("listusers", lang, &[count.as_str()]);
    for user in users {
        reply.push_str(&format!("- {} ({})\n", user.user, user.app));
    }
    reply.push('\n');
    Ok(reply)
}

async fn list_inst_blocks(ctx: &BridgeContext<'_>, lang: &str) -> Result<String, StoreError> {
    let messages = ctx.messages;
    let blocks = ctx.store.inst_blocks().await?;
    if blocks.is_empty() {
        return Ok(messages.text("emptyinstblocks", lang));
    }
    let count = blocks.len().to_string();
    let mut reply = messages.fill("listinstblocks", lang, &[count.as_str()]);
    for block in blocks {
        reply.push_str(&format!(
            "- {}{}\n",
            ctx.config.prefix_for(block.side),
            block.blocked
        ));
    }
    reply.push('\n');
    Ok(reply)
}

/// Block users bridge-wide and revoke their registrations. Admins and the
/// bridge's own accounts cannot be targeted.
async fn admin_block(
    ctx: &BridgeContext<'_>,
    side: Side,
    recipients: &[String],
    lang: &str,
) -> Result<String, StoreError> {
    let messages = ctx.messages;
    let opposite = side.opposite();
    let opposite_prefix = ctx.config.prefix_for(opposite);
    if recipients.is_empty() {
        return Ok(messages.fill("noablocks", lang, &[opposite_prefix]));
    }
    let protected = |target: &String| {
        ctx.config.ap_admin.contains(target)
            || ctx.config.xmpp_admin.contains(target)
            || *target == ctx.config.ap_bridge_jid
            || *target == ctx.config.xmpp_bridge_name
    };
    if recipients.iter().any(protected) {
        return Ok(messages.text("adminnoblk", lang));
    }
    let mut reply = String::new();
    for blocked in recipients {
        if ctx
            .store
            .add_inst_block(opposite, blocked, chrono::Utc::now())
            .await?
        {
            reply.push_str(&messages.fill("addablocks", lang, &[opposite_prefix, blocked.as_str()]));
            manager::unregister(ctx, opposite, blocked, false, lang).await?;
        } else {
            reply.push_str(&messages.fill("ablockexists", lang, &[opposite_prefix, blocked.as_str()]));
        }
    }
    Ok(reply)
}

async fn admin_unblock(
    ctx: &BridgeContext<'_>,
    side: Side,
    recipients: &[String],
    lang: &str,
) -> Result<String, StoreError> {
    let messages = ctx.messages;
    let opposite = side.opposite();
    let opposite_prefix = ctx.config.prefix_for(opposite);
    if recipients.is_empty() {
        return Ok(messages.fill("noaunblocks", lang, &[opposite_prefix]));
    }
    let mut reply = String::new();
    for blocked in recipients {
        let key = if ctx.store.del_inst_block(opposite, blocked).await? {
            "delablocks"
        } else {
            "ablocknotexists"
        };
        reply.push_str(&messages.fill(key, lang, &[opposite_prefix, blocked.as_str()]));
    }
    Ok(reply)
}

/// Add domains to a list; red additions sweep the affected registrations.
async fn add_domains(
    ctx: &BridgeContext<'_>,
    content: &ParsedContent,
    list: DomainList,
    lang: &str,
) -> Result<String, StoreError> {
    let messages = ctx.messages;
    if content.domains.is_empty() {
        return Ok(messages.text(&rg_key("nodomblocks", list), lang));
    }
    if list == DomainList::Red
        && content
            .domains
            .iter()
            .any(|d| ctx.config.is_local_domain(d))
    {
        return Ok(messages.text("selfdomnoblk", lang));
    }
    let mut reply = String::new();
    for domain in &content.domains {
        if !ctx.state.add_domain(list, domain)? {
            reply.push_str(&messages.fill(&rg_key("adddomexists", list), lang, &[domain.as_str()]));
            continue;
        }
        reply.push_str(&messages.fill(&rg_key("adddom", list), lang, &[domain.as_str()]));
        if list == DomainList::Red {
            for user in ctx.store.active_users().await? {
                if user.domain() == domain {
                    manager::unregister(ctx, user.side, &user.user, false, lang).await?;
                }
            }
        }
    }
    Ok(reply)
}

/// Remove domains from a list; in greenlist mode a green removal sweeps the
/// registrations it orphans.
async fn del_domains(
    ctx: &BridgeContext<'_>,
    content: &ParsedContent,
    list: DomainList,
    lang: &str,
) -> Result<String, StoreError> {
    let messages = ctx.messages;
    if content.domains.is_empty() {
        return Ok(messages.text(&rg_key("nodomunblocks", list), lang));
    }
    let removed = ctx.state.remove_domains(list, &content.domains)?;
    let mut reply = String::new();
    for domain in &content.domains {
        if !removed.contains(domain) {
            reply.push_str(&messages.fill(&rg_key("domblocknotexists", list), lang, &[domain.as_str()]));
            continue;
        }
        if list == DomainList::Green
            && ctx.config.green_mode
            && !ctx.config.is_local_domain(domain)
        {
            reply.push_str(&messages.fill("del2domblocks", lang, &[domain.as_str()]));
            for user in ctx.store.active_users().await? {
                if user.domain() == domain {
                    manager::unregister(ctx, user.side, &user.user, false, lang).await?;
                }
            }
        } else {
            reply.push_str(&messages.fill(&rg_key("deldomblocks", list), lang, &[domain.as_str()]));
        }
    }
    Ok(reply)
}

fn list_domains(
    ctx: &BridgeContext<'_>,
    list: DomainList,
    lang: &str,
) -> Result<String, StoreError> {
    let messages = ctx.messages;
    let domains = ctx.state.domains(list)?;
    if domains.is_empty() {
        return Ok(messages.text(&rg_key("emptydomblocks", list), lang));
    }
    let count = domains.len().to_string();
    let mut reply = messages.fill(&rg_key("listdomblocks", list), lang, &[count.as_str()]);
    for domain in domains {
        reply.push_str(&format!("- {}\n", domain));
    }
    reply.push('\n');
    Ok(reply)
}

/// Compose the bridge status: relay state, registration state, user cap,
/// greenlist mode.
fn status(ctx: &BridgeContext<'_>, lang: &str) -> Result<String, StoreError> {
    let messages = ctx.messages;
    let mut reply = messages.text("status", lang);
    let run_token = ctx.state.run_token()?;
    reply.push_str(&format!("- {}", messages.text(&run_token, lang)));
    let reg_token = ctx.state.reg_token()?;
    reply.push_str(&format!("- {}", messages.text(&reg_token, lang)));
    if reg_token == ctx.config.command(cmd::OPEN) && ctx.config.max_reg_users > 0 {
        let cap = ctx.config.max_reg_users.to_string();
        reply.push_str(&format!("- {}", messages.fill("nbregusers", lang, &[cap.as_str()])));
    }
    let mode_key = if ctx.config.green_mode {
        "greenlist"
    } else {
        "notgreenlist"
    };
    reply.push_str(&format!("- {}", messages.text(mode_key, lang)));
    Ok(reply)
}
