//! User unregistration.
//!
//! Revokes the registration (keeping the row for the retention policy and
//! the re-registration counter), drops the user's dependent block and
//! correspondence rows, then undoes the roster relation: unfollow on the
//! Fediverse, `unsubscribe`/`unsubscribed` plus roster removal on XMPP.

use chrono::Utc;
use tracing::{instrument, warn};

use crate::error::StoreError;
use crate::pipeline::BridgeContext;
use crate::Side;

/// Unregister `user` on `side`; returns the localized reply.
///
/// `from_unfollow` marks event-driven invocations (a Fediverse unfollow
/// can't be observed, but an XMPP presence `unsubscribe` can): those stay
/// silent when there is nothing to revoke.
#[instrument(skip(ctx, lang), fields(%side, user))]
pub async fn unregister(
    ctx: &BridgeContext<'_>,
    side: Side,
    user: &str,
    from_unfollow: bool,
    lang: &str,
) -> Result<String, StoreError> {
    let messages = ctx.messages;
    let Some(row) = ctx.store.user(side, user).await? else {
        return Ok(if from_unfollow {
            String::new()
        } else {
            messages.text("dbnotexists", lang)
        });
    };

    let mut reply = String::new();
    match row.revoke_date {
        Some(revoked) => {
            if !from_unfollow {
                let since = revoked.format("%Y-%m-%d").to_string();
                reply = messages.fill("revoked", lang, &[since.as_str()]);
            }
        }
        None => {
            ctx.store.revoke_user(side, user, Utc::now()).await?;
            reply = messages.text("unregok", lang);
        }
    }

    if drop_contact(ctx, side, user, &row.acc_id).await {
        reply.push_str(&messages.text("delcontact", lang));
    }
    Ok(reply)
}

/// Undo the roster relation; true on success. Failures are logged, not
/// propagated.
async fn drop_contact(ctx: &BridgeContext<'_>, side: Side, user: &str, acc_id: &str) -> bool {
    match side {
        Side::Fedi => match ctx.fedi.unfollow(acc_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(user, error = %e, "unfollow failed");
                false
            }
        },
        Side::Xmpp => match ctx.chat.remove_contact(user).await {
            Ok(()) => true,
            Err(e) => {
                warn!(user, error = %e, "roster removal failed");
                false
            }
        },
    }
}
