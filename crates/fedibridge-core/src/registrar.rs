//! User registration.
//!
//! Registration is an admission pipeline: bridge open? user capacity left?
//! not blocked, domain allowed? and, for Fediverse accounts, the bot/group/
//! `#nobot` and minimum-activity heuristics. Only then is the row inserted
//! or re-activated, followed by roster synchronization (follow on the
//! Fediverse, presence subscription on XMPP).

use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::StoreError;
use crate::pipeline::BridgeContext;
use crate::port::SubState;
use crate::state::DomainList;
use crate::store::UserRow;
use crate::Side;

/// Result of one registration attempt.
#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    /// Whether the user ends up actively registered.
    pub success: bool,
    /// Localized reply fragments accumulated along the way.
    pub reply: String,
    /// Possibly updated language (the activity heuristic may adopt the
    /// account's posting language on first registration).
    pub lang: String,
    /// Fediverse account id (`"0"` when unknown or XMPP).
    pub acc_id: String,
}

impl RegistrationOutcome {
    fn rejected(reply: String, lang: &str) -> RegistrationOutcome {
        RegistrationOutcome {
            success: false,
            reply,
            lang: lang.to_string(),
            acc_id: "0".to_string(),
        }
    }
}

/// Register `user` on `side`.
///
/// `from_follow` marks event-driven invocations (a follow on the Fediverse,
/// a presence `subscribe` on XMPP): those stay silent about an already
/// active registration instead of repeating the confirmation.
#[instrument(skip(ctx, lang), fields(%side, user))]
pub async fn register(
    ctx: &BridgeContext<'_>,
    side: Side,
    user: &str,
    from_follow: bool,
    lang: &str,
) -> Result<RegistrationOutcome, StoreError> {
    let messages = ctx.messages;

    if !ctx.state.registration_open()? {
        return Ok(RegistrationOutcome::rejected(
            messages.text("closedreg", lang),
            lang,
        ));
    }
    if ctx.config.max_reg_users > 0 && ctx.store.active_count().await? >= ctx.config.max_reg_users
    {
        return Ok(RegistrationOutcome::rejected(
            messages.text("maxusers", lang),
            lang,
        ));
    }

    let admission = admit(ctx, side, user, lang).await?;
    if !admission.reply.is_empty() {
        return Ok(RegistrationOutcome {
            success: false,
            ..admission
        });
    }
    let mut lang = admission.lang;
    let acc_id = admission.acc_id;

    let mut reply = String::new();
    let mut success = false;
    let row = match ctx.store.user(side, user).await? {
        Some(row) => row,
        None => {
            let app = detect_app(ctx, side, user).await;
            let row = UserRow {
                side,
                user: user.to_string(),
                req_date: None,
                nb_reg: 0,
                lang: lang.clone(),
                revoke_date: None,
                app,
                acc_id: acc_id.clone(),
            };
            ctx.store.insert_user(&row).await?;
            row
        }
    };

    if row.is_active() && row.nb_reg > 0 {
        if !from_follow {
            let since = row
                .req_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            reply = messages.fill("dbexists", &lang, &[since.as_str()]);
        }
        success = true;
    } else if ctx.config.max_reg > 0 && row.nb_reg >= ctx.config.max_reg {
        let cap = ctx.config.max_reg.to_string();
        reply = messages.fill("regmax", &lang, &[cap.as_str()]);
    } else {
        ctx.store
            .activate_user(side, user, row.nb_reg + 1, &lang, Utc::now())
            .await?;
        reply = messages.text("regok", &lang);
        success = true;
        debug!(nb_reg = row.nb_reg + 1, "registration activated");
    }

    if success {
        let contact = sync_roster(ctx, side, user, &acc_id, from_follow, &lang).await;
        if contact.is_empty() {
            reply.push_str(&messages.text("errcontact", &lang));
        } else {
            reply.push_str(&contact);
        }
    }

    Ok(RegistrationOutcome {
        success,
        reply,
        lang,
        acc_id,
    })
}

/// Blocklist, domain-policy and Fediverse-heuristic admission. An empty
/// `reply` means admitted; `lang` may have been refined, `acc_id` resolved.
async fn admit(
    ctx: &BridgeContext<'_>,
    side: Side,
    user: &str,
    lang: &str,
) -> Result<RegistrationOutcome, StoreError> {
    let messages = ctx.messages;
    if ctx.store.has_inst_block(side, user).await? {
        return Ok(RegistrationOutcome::rejected(
            messages.text("ublock", lang),
            lang,
        ));
    }

    let domain = user.rsplit_once('@').map(|(_, d)| d).unwrap_or_default();
    let local = ctx.config.is_local_domain(domain);
    if !local && ctx.state.contains(DomainList::Red, domain)? {
        return Ok(RegistrationOutcome::rejected(
            messages.text("dred", lang),
            lang,
        ));
    }
    let greenlisted = ctx.state.contains(DomainList::Green, domain)?;
    if ctx.config.green_mode && !local && !greenlisted {
        return Ok(RegistrationOutcome::rejected(
            messages.text("dgreen", lang),
            lang,
        ));
    }

    if side == Side::Xmpp {
        return Ok(RegistrationOutcome {
            success: true,
            reply: String::new(),
            lang: lang.to_string(),
            acc_id: "0".to_string(),
        });
    }

    // Fediverse-only heuristics on the looked-up account.
    let account = match ctx.fedi.lookup_account(user).await {
        Ok(account) => account,
        Err(e) => {
            warn!(user, error = %e, "account lookup failed");
            return Ok(RegistrationOutcome::rejected(
                messages.fill("lookuperror", lang, &[ctx.config.ap_instance.as_str()]),
                lang,
            ));
        }
    };
    let bio = account.note.to_lowercase();
    if bio.contains("#<span>nobot</span>") || bio.contains("#<span>nobridge</span>") {
        return Ok(RegistrationOutcome {
            success: false,
            reply: messages.text("hashnobot", lang),
            lang: lang.to_string(),
            acc_id: account.id,
        });
    }
    if account.bot {
        return Ok(RegistrationOutcome {
            success: false,
            reply: messages.text("nobot", lang),
            lang: lang.to_string(),
            acc_id: account.id,
        });
    }
    if account.group {
        return Ok(RegistrationOutcome {
            success: false,
            reply: messages.text("nogroup", lang),
            lang: lang.to_string(),
            acc_id: account.id,
        });
    }

    let mut lang = lang.to_string();
    let mut reply = String::new();
    if ctx.config.min_active > 0 {
        match ctx.fedi.recent_statuses(&account.id, ctx.config.min_active).await {
            Ok(statuses) => {
                let horizon = Utc::now() - Duration::days(30);
                let mut active = 0usize;
                let mut first_lang: Option<Option<String>> = None;
                for status in &statuses {
                    if status.created_at > horizon {
                        active += 1;
                        if first_lang.is_none() {
                            first_lang = Some(status.language.clone());
                        }
                    }
                }
                let domain_ok = domain == ctx.config.ap_instance || greenlisted;
                if active >= ctx.config.min_active as usize || domain_ok {
                    if let Some(Some(code)) = first_lang {
                        if ctx.messages.has_language(&code) {
                            lang = code;
                        }
                    }
                } else {
                    reply = messages.text("inactive", &lang);
                }
            }
            Err(e) => {
                warn!(user, error = %e, "status fetch failed");
                if domain != ctx.config.ap_instance && !greenlisted {
                    reply = messages.text("lustaterr", &lang);
                }
            }
        }
    }

    Ok(RegistrationOutcome {
        success: reply.is_empty(),
        reply,
        lang,
        acc_id: account.id,
    })
}

/// Add the new user as a contact of the bridge and report the mutual state.
/// Transport failures degrade to an empty string (the caller substitutes a
/// generic notice); the stored language may not change here.
async fn sync_roster(
    ctx: &BridgeContext<'_>,
    side: Side,
    user: &str,
    acc_id: &str,
    from_follow: bool,
    lang: &str,
) -> String {
    let messages = ctx.messages;
    match side {
        Side::Fedi => {
            let attempt = async {
                ctx.fedi.follow(acc_id).await?;
                ctx.fedi.relationship(acc_id).await
            };
            match attempt.await {
                Ok(rel) => {
                    let mut response = String::new();
                    if rel.requested {
                        response = messages.text("requested", lang);
                    } else if rel.following {
                        response = messages.text("addcontact", lang);
                    }
                    if !(rel.followed_by || rel.requested_by) {
                        response.push_str(&messages.text("followme", lang));
                    }
                    response
                }
                Err(e) => {
                    warn!(user, error = %e, "follow or relationship fetch failed");
                    String::new()
                }
            }
        }
        Side::Xmpp => {
            let state = match ctx.chat.subscription_state(user).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(user, error = %e, "subscription state unavailable");
                    return String::new();
                }
            };
            let mut response = String::new();
            if matches!(state, SubState::None | SubState::To) {
                if let Err(e) = ctx
                    .chat
                    .presence(user, crate::port::PresenceKind::Subscribe)
                    .await
                {
                    warn!(user, error = %e, "subscribe presence failed");
                    return String::new();
                }
            }
            if state == SubState::Both || (state == SubState::From && from_follow) {
                response = messages.text("addcontact", lang);
            }
            if matches!(state, SubState::None | SubState::From) && !from_follow {
                response.push_str(&messages.text("followme", lang));
            }
            if state != SubState::Both {
                response.push_str(&messages.text("requested", lang));
            }
            response
        }
    }
}

#[derive(Deserialize)]
struct NodeInfoIndex {
    links: Vec<NodeInfoLink>,
}

#[derive(Deserialize)]
struct NodeInfoLink {
    href: String,
}

#[derive(Deserialize)]
struct NodeInfo {
    software: NodeInfoSoftware,
}

#[derive(Deserialize)]
struct NodeInfoSoftware {
    name: String,
}

/// Source-application label for a new user: the constant `"XMPP"`, or the
/// nodeinfo software name of the account's instance, falling back to
/// `"Fediverse"` whenever the probe fails in any way.
async fn detect_app(ctx: &BridgeContext<'_>, side: Side, user: &str) -> String {
    if side == Side::Xmpp {
        return "XMPP".to_string();
    }
    let domain = user.rsplit_once('@').map(|(_, d)| d).unwrap_or_default();
    match nodeinfo_app(ctx.http, &format!("https://{domain}")).await {
        Some(name) => name,
        None => "Fediverse".to_string(),
    }
}

/// Resolve `<base>/.well-known/nodeinfo`, follow the first link and read
/// `software.name`, capitalized.
pub async fn nodeinfo_app(http: &reqwest::Client, base: &str) -> Option<String> {
    let index: NodeInfoIndex = http
        .get(format!("{base}/.well-known/nodeinfo"))
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?
        .json()
        .await
        .ok()?;
    let href = &index.links.first()?.href;
    let info: NodeInfo = http
        .get(href)
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?
        .json()
        .await
        .ok()?;
    let name = info.software.name;
    let mut chars = name.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase())
}
