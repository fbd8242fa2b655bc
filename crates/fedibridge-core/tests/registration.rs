//! Registration and unregistration flows against the admission pipeline.

mod common;

use chrono::{Duration, Utc};
use common::Fixture;
use fedibridge_core::port::{PresenceKind, Relationship, SubState};
use fedibridge_core::state::DomainList;
use fedibridge_core::store::UserRow;
use fedibridge_core::{manager, registrar, Side};

#[tokio::test]
async fn register_via_follow_admits_active_account_and_adopts_language() {
    let mut fx = Fixture::new().await;
    fx.config.min_active = 30;
    *fx.fedi.relationship.lock().unwrap() = Relationship {
        requested: true,
        followed_by: true,
        ..Default::default()
    };
    fx.fedi.add_account("user@niche.example", "acc-1");
    fx.fedi.seed_recent_statuses(35, Some("fr"));

    let out = registrar::register(&fx.ctx(), Side::Fedi, "user@niche.example", true, "en")
        .await
        .unwrap();

    assert!(out.success);
    assert_eq!(out.acc_id, "acc-1");
    // language adopted from the first qualifying status
    assert_eq!(out.lang, "fr");
    assert!(out.reply.contains(fx.messages.text("regok", "fr").trim_end()));
    assert!(out.reply.contains(fx.messages.text("requested", "fr").trim_end()));

    let row = fx
        .store
        .user(Side::Fedi, "user@niche.example")
        .await
        .unwrap()
        .unwrap();
    assert!(row.is_active());
    assert_eq!(row.nb_reg, 1);
    assert_eq!(row.lang, "fr");
    assert_eq!(fx.fedi.follows.lock().unwrap().as_slice(), ["acc-1"]);
}

#[tokio::test]
async fn closed_registrations_reject_without_state_change() {
    let fx = Fixture::new().await;
    fx.state.write_reg_token("close").unwrap();
    fx.fedi.add_account("user@fedi.example", "acc-2");

    let out = registrar::register(&fx.ctx(), Side::Fedi, "user@fedi.example", false, "en")
        .await
        .unwrap();
    assert!(!out.success);
    assert_eq!(out.reply, fx.msg("closedreg"));
    assert!(fx.store.user(Side::Fedi, "user@fedi.example").await.unwrap().is_none());
}

#[tokio::test]
async fn user_capacity_is_enforced() {
    let mut fx = Fixture::new().await;
    fx.config.max_reg_users = 1;
    fx.seed_user(Side::Xmpp, "first@xmpp.example", "XMPP").await;

    let out = registrar::register(&fx.ctx(), Side::Xmpp, "second@xmpp.example", false, "en")
        .await
        .unwrap();
    assert!(!out.success);
    assert_eq!(out.reply, fx.msg("maxusers"));
}

#[tokio::test]
async fn bridge_blocked_and_red_domains_are_rejected() {
    let fx = Fixture::new().await;
    fx.store
        .add_inst_block(Side::Xmpp, "banned@xmpp.example", Utc::now())
        .await
        .unwrap();
    let out = registrar::register(&fx.ctx(), Side::Xmpp, "banned@xmpp.example", false, "en")
        .await
        .unwrap();
    assert_eq!(out.reply, fx.msg("ublock"));

    fx.state.add_domain(DomainList::Red, "evil.example").unwrap();
    let out = registrar::register(&fx.ctx(), Side::Xmpp, "user@evil.example", false, "en")
        .await
        .unwrap();
    assert_eq!(out.reply, fx.msg("dred"));
}

#[tokio::test]
async fn greenlist_mode_only_admits_listed_domains() {
    let mut fx = Fixture::new().await;
    fx.config.green_mode = true;
    *fx.chat.sub_state.lock().unwrap() = Some(SubState::Both);

    let out = registrar::register(&fx.ctx(), Side::Xmpp, "user@elsewhere.example", false, "en")
        .await
        .unwrap();
    assert_eq!(out.reply, fx.msg("dgreen"));

    fx.state.add_domain(DomainList::Green, "elsewhere.example").unwrap();
    let out = registrar::register(&fx.ctx(), Side::Xmpp, "user@elsewhere.example", false, "en")
        .await
        .unwrap();
    assert!(out.success);

    // local domains never need the green list
    let out = registrar::register(&fx.ctx(), Side::Xmpp, "local@xmpp.example", false, "en")
        .await
        .unwrap();
    assert!(out.success);
}

#[tokio::test]
async fn fediverse_heuristics_reject_bots_groups_and_nobot_bios() {
    let fx = Fixture::new().await;

    fx.fedi.accounts.lock().unwrap().insert(
        "shy@fedi.example".into(),
        fedibridge_core::port::Account {
            id: "a1".into(),
            note: "<p>#<span>nobot</span></p>".into(),
            bot: false,
            group: false,
        },
    );
    let out = registrar::register(&fx.ctx(), Side::Fedi, "shy@fedi.example", false, "en")
        .await
        .unwrap();
    assert_eq!(out.reply, fx.msg("hashnobot"));

    fx.fedi.accounts.lock().unwrap().insert(
        "robot@fedi.example".into(),
        fedibridge_core::port::Account {
            id: "a2".into(),
            bot: true,
            ..Default::default()
        },
    );
    let out = registrar::register(&fx.ctx(), Side::Fedi, "robot@fedi.example", false, "en")
        .await
        .unwrap();
    assert_eq!(out.reply, fx.msg("nobot"));

    fx.fedi.accounts.lock().unwrap().insert(
        "crowd@fedi.example".into(),
        fedibridge_core::port::Account {
            id: "a3".into(),
            group: true,
            ..Default::default()
        },
    );
    let out = registrar::register(&fx.ctx(), Side::Fedi, "crowd@fedi.example", false, "en")
        .await
        .unwrap();
    assert_eq!(out.reply, fx.msg("nogroup"));
}

#[tokio::test]
async fn inactive_remote_accounts_are_rejected_before_any_insert() {
    let mut fx = Fixture::new().await;
    fx.config.min_active = 30;
    fx.fedi.add_account("quiet@niche.example", "a4");
    fx.fedi.seed_recent_statuses(5, None);

    let out = registrar::register(&fx.ctx(), Side::Fedi, "quiet@niche.example", false, "en")
        .await
        .unwrap();
    assert!(!out.success);
    assert_eq!(out.reply, fx.msg("inactive"));
    assert!(fx.store.user(Side::Fedi, "quiet@niche.example").await.unwrap().is_none());
}

#[tokio::test]
async fn lookup_failure_rejects_with_instance_name() {
    let fx = Fixture::new().await;
    let out = registrar::register(&fx.ctx(), Side::Fedi, "ghost@nowhere.example", false, "en")
        .await
        .unwrap();
    assert!(!out.success);
    assert!(out.reply.contains("fedi.example"));
}

#[tokio::test]
async fn repeat_registration_reports_existing_date() {
    let fx = Fixture::new().await;
    *fx.chat.sub_state.lock().unwrap() = Some(SubState::Both);
    fx.seed_user(Side::Xmpp, "old@xmpp.example", "XMPP").await;

    let out = registrar::register(&fx.ctx(), Side::Xmpp, "old@xmpp.example", false, "en")
        .await
        .unwrap();
    assert!(out.success);
    assert!(out.reply.contains(fx.msg_head("dbexists").as_str()));

    // event-driven repeat stays silent about it
    let out = registrar::register(&fx.ctx(), Side::Xmpp, "old@xmpp.example", true, "en")
        .await
        .unwrap();
    assert!(out.success);
    assert!(!out.reply.contains(fx.msg_head("dbexists").as_str()));
}

#[tokio::test]
async fn re_registration_cap_applies_to_revoked_rows() {
    let mut fx = Fixture::new().await;
    fx.config.max_reg = 3;
    fx.store
        .insert_user(&UserRow {
            side: Side::Xmpp,
            user: "comeback@xmpp.example".into(),
            req_date: Some(Utc::now() - Duration::days(10)),
            nb_reg: 3,
            lang: "en".into(),
            revoke_date: Some(Utc::now() - Duration::days(1)),
            app: "XMPP".into(),
            acc_id: "0".into(),
        })
        .await
        .unwrap();

    let out = registrar::register(&fx.ctx(), Side::Xmpp, "comeback@xmpp.example", false, "en")
        .await
        .unwrap();
    assert!(!out.success);
    assert!(out.reply.contains(fx.msg_head("regmax").as_str()));
    assert!(out.reply.contains('3'));
}

#[tokio::test]
async fn xmpp_registration_syncs_the_roster() {
    let fx = Fixture::new().await;
    *fx.chat.sub_state.lock().unwrap() = Some(SubState::None);

    let out = registrar::register(&fx.ctx(), Side::Xmpp, "new@xmpp.example", false, "en")
        .await
        .unwrap();
    assert!(out.success);
    let presences = fx.chat.presences.lock().unwrap();
    assert_eq!(
        presences.as_slice(),
        [("new@xmpp.example".to_string(), PresenceKind::Subscribe)]
    );
    // one-way relation asks the user to follow back and reports the pending
    // request
    assert!(out.reply.contains(fx.msg("followme").trim_end()));
    assert!(out.reply.contains(fx.msg("requested").trim_end()));
}

#[tokio::test]
async fn unregister_revokes_and_cleans_roster() {
    let fx = Fixture::new().await;
    fx.seed_user(Side::Xmpp, "leaver@xmpp.example", "XMPP").await;

    let reply = manager::unregister(&fx.ctx(), Side::Xmpp, "leaver@xmpp.example", false, "en")
        .await
        .unwrap();
    assert!(reply.contains(fx.msg("unregok").trim_end()));
    assert!(reply.contains(fx.msg("delcontact").trim_end()));

    let row = fx
        .store
        .user(Side::Xmpp, "leaver@xmpp.example")
        .await
        .unwrap()
        .unwrap();
    assert!(!row.is_active());

    // the full severing sequence runs through the contact-removal op
    assert_eq!(
        fx.chat.removed.lock().unwrap().as_slice(),
        ["leaver@xmpp.example"]
    );
}

#[tokio::test]
async fn unregister_fediverse_user_unfollows_by_stored_id() {
    let fx = Fixture::new().await;
    fx.seed_user(Side::Fedi, "fan@fedi.example", "Mastodon").await;

    let reply = manager::unregister(&fx.ctx(), Side::Fedi, "fan@fedi.example", false, "en")
        .await
        .unwrap();
    assert!(reply.contains(fx.msg("unregok").trim_end()));
    assert_eq!(
        fx.fedi.unfollows.lock().unwrap().as_slice(),
        ["id-fan@fedi.example"]
    );
}

#[tokio::test]
async fn unregister_unknown_user_is_polite_and_events_stay_silent() {
    let fx = Fixture::new().await;
    let reply = manager::unregister(&fx.ctx(), Side::Xmpp, "nobody@xmpp.example", false, "en")
        .await
        .unwrap();
    assert_eq!(reply, fx.msg("dbnotexists"));

    let reply = manager::unregister(&fx.ctx(), Side::Xmpp, "nobody@xmpp.example", true, "en")
        .await
        .unwrap();
    assert!(reply.is_empty());
}
