//! Startup initialization and cleanup.
//!
//! Each listener runs this once for its own side: make sure the state files
//! exist, sweep expired revoked users and old correspondence rows, then
//! reconcile the registrations against the current domain policy (redlist,
//! greenlist mode, bridge-wide blocks, and, on the Fediverse side, the
//! instance's own domain blocks).

use chrono::{Duration, Utc};
use tracing::{debug, info, instrument, warn};

use crate::error::StoreError;
use crate::manager;
use crate::pipeline::BridgeContext;
use crate::state::DomainList;
use crate::Side;

/// Run the startup sweep for `side`.
#[instrument(skip(ctx), fields(%side))]
pub async fn initialize(ctx: &BridgeContext<'_>, side: Side) -> Result<(), StoreError> {
    ctx.state.ensure_defaults()?;

    // Revoked users past the retention window lose their row entirely.
    if ctx.config.retention > 0 {
        let cutoff = Utc::now() - Duration::days(ctx.config.retention);
        for user in ctx.store.revoked_users(side).await? {
            if user.revoke_date.is_some_and(|d| d < cutoff) {
                debug!(user = %user.user, "retention expired, deleting row");
                ctx.store.delete_user(side, &user.user).await?;
            }
        }
    }

    // Correspondence rows age out regardless of their users.
    if ctx.config.comm_limit > 0 {
        let cutoff = Utc::now() - Duration::days(ctx.config.comm_limit);
        let purged = ctx.store.purge_comm_before(side, cutoff).await?;
        if purged > 0 {
            info!(purged, "expired correspondence rows dropped");
        }
    }

    let lang = &ctx.config.default_lang;

    // The instance's own domain blocks override registrations.
    if side == Side::Fedi {
        match ctx.fedi.domain_blocks().await {
            Ok(blocked_domains) => {
                for user in ctx.store.active_users().await? {
                    if user.side == Side::Fedi
                        && blocked_domains.iter().any(|d| d == user.domain())
                    {
                        info!(user = %user.user, "on an instance-blocked domain, unregistering");
                        manager::unregister(ctx, user.side, &user.user, false, lang).await?;
                    }
                }
            }
            Err(e) => warn!(error = %e, "cannot fetch instance domain blocks"),
        }
    }

    // Reconcile live registrations with the current policy.
    let red = ctx.state.domains(DomainList::Red)?;
    let green = ctx.state.domains(DomainList::Green)?;
    for user in ctx.store.active_users().await? {
        let domain = user.domain();
        let local = ctx.config.is_local_domain(domain);
        if !local && red.iter().any(|d| d == domain) {
            info!(user = %user.user, domain, "red-listed domain, unregistering");
            manager::unregister(ctx, user.side, &user.user, false, lang).await?;
            continue;
        }
        if ctx.config.green_mode && !local && !green.iter().any(|d| d == domain) {
            info!(user = %user.user, domain, "not green-listed, unregistering");
            manager::unregister(ctx, user.side, &user.user, false, lang).await?;
            continue;
        }
        if user.side == side && ctx.store.has_inst_block(side, &user.user).await? {
            info!(user = %user.user, "bridge-blocked, unregistering");
            manager::unregister(ctx, user.side, &user.user, false, lang).await?;
        }
    }

    info!("bridge initialized");
    Ok(())
}
