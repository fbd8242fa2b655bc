//! Stanza construction shared by both session kinds.

use jid::Jid;
use uuid::Uuid;
use xmpp_parsers::iq::Iq;
use xmpp_parsers::message::{Message, MessageType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};
use xmpp_parsers::roster::{Ask, Item, Roster, Subscription};

use fedibridge_core::port::PresenceKind;

/// A chat message carrying one body in `lang`, with a bridge-minted id
/// (the id is recorded in the correspondence log, so it cannot be left for
/// the stream layer to invent).
pub fn chat_message(to: Jid, body: &str, lang: &str) -> (Message, String) {
    let id = Uuid::new_v4().to_string();
    let mut message = Message::chat(to).with_body(lang.to_string(), body.to_string());
    message.id = Some(id.clone());
    (message, id)
}

pub fn presence_to(to: Jid, kind: PresenceKind) -> Presence {
    let type_ = match kind {
        PresenceKind::Subscribe => PresenceType::Subscribe,
        PresenceKind::Subscribed => PresenceType::Subscribed,
        PresenceKind::Unsubscribe => PresenceType::Unsubscribe,
        PresenceKind::Unsubscribed => PresenceType::Unsubscribed,
    };
    let mut presence = Presence::new(type_);
    presence.to = Some(to);
    presence
}

/// Initial available presence sent right after binding.
pub fn available() -> Presence {
    Presence::new(PresenceType::None)
}

/// Roster fetch request.
pub fn roster_get() -> Iq {
    Iq::from_get(
        "roster",
        Roster {
            ver: None,
            items: vec![],
        },
    )
}

/// Roster set removing one contact.
pub fn roster_remove(contact: jid::BareJid) -> Iq {
    Iq::from_set(
        Uuid::new_v4().to_string(),
        Roster {
            ver: None,
            items: vec![Item {
                jid: contact,
                name: None,
                subscription: Subscription::Remove,
                ask: Ask::None,
                groups: vec![],
            }],
        },
    )
}

/// True for the message types the bridge relays.
pub fn is_chat_like(type_: &MessageType) -> bool {
    matches!(type_, MessageType::Chat | MessageType::Normal)
}
