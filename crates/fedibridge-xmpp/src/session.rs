//! Persistent bridge session.
//!
//! Owns the long-lived client of the XMPP listener: pumps stanzas into
//! normalized [`SessionEvent`]s, keeps a roster cache fed by the initial
//! roster fetch and subsequent pushes, and implements
//! [`ChatPort`] directly on the live stream.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use futures::StreamExt;
use jid::{BareJid, Jid};
use tokio::sync::Mutex;
use tokio_xmpp::{Client, Event, Stanza};
use tracing::{debug, info, warn};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::ns;
use xmpp_parsers::presence::Type as PresenceType;
use xmpp_parsers::roster::{Roster, Subscription};
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use fedibridge_core::error::TransportError;
use fedibridge_core::port::{ChatPort, PresenceKind, SubState};

use crate::stanza;

/// Normalized events of the persistent session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Stream bound; presence announced and roster requested.
    Ready,
    /// Inbound chat or normal message with a body.
    Chat {
        from: String,
        id: String,
        body: String,
    },
    /// The sender asks to subscribe to the bridge's presence.
    Subscribe { from: String },
    /// The sender withdraws their subscription.
    Unsubscribe { from: String },
    /// Stream is gone and will not come back; recreate the session.
    Closed,
}

/// The XMPP listener's long-lived session.
pub struct BridgeSession {
    client: Mutex<Client>,
    roster: StdMutex<HashMap<BareJid, Subscription>>,
}

fn xmpp_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Xmpp(e.to_string())
}

impl BridgeSession {
    /// Create the session. The connection is established lazily, on the
    /// first [`BridgeSession::next_event`] poll.
    pub fn connect(jid: &str, password: &str) -> Result<BridgeSession, TransportError> {
        let jid = Jid::from_str(jid).map_err(xmpp_err)?;
        Ok(BridgeSession {
            client: Mutex::new(Client::new(jid, password.to_string())),
            roster: StdMutex::new(HashMap::new()),
        })
    }

    /// Pump the stream until something the listener cares about happens.
    pub async fn next_event(&self) -> SessionEvent {
        loop {
            let event = { self.client.lock().await.next().await };
            match event {
                None => return SessionEvent::Closed,
                Some(Event::Online { bound_jid, resumed }) => {
                    info!(%bound_jid, resumed, "xmpp stream online");
                    if resumed {
                        continue;
                    }
                    let mut client = self.client.lock().await;
                    if let Err(e) = client.send_stanza(stanza::available().into()).await {
                        warn!(error = %e, "cannot announce presence");
                    }
                    if let Err(e) = client.send_stanza(stanza::roster_get().into()).await {
                        warn!(error = %e, "cannot request roster");
                    }
                    return SessionEvent::Ready;
                }
                Some(Event::Disconnected(e)) => {
                    warn!(error = %e, "xmpp stream disconnected");
                    return SessionEvent::Closed;
                }
                Some(Event::Stanza(Stanza::Message(message))) => {
                    if !stanza::is_chat_like(&message.type_) {
                        continue;
                    }
                    let Some(from) = message.from.clone() else {
                        continue;
                    };
                    let Some(body) = message
                        .bodies
                        .get("")
                        .or_else(|| message.bodies.values().next())
                    else {
                        continue;
                    };
                    return SessionEvent::Chat {
                        from: from.to_bare().to_string().to_lowercase(),
                        id: message.id.clone().unwrap_or_default(),
                        body: body.0.clone(),
                    };
                }
                Some(Event::Stanza(Stanza::Presence(presence))) => {
                    let Some(from) = presence.from.clone() else {
                        continue;
                    };
                    let from = from.to_bare().to_string().to_lowercase();
                    match presence.type_ {
                        PresenceType::Subscribe => return SessionEvent::Subscribe { from },
                        PresenceType::Unsubscribe => return SessionEvent::Unsubscribe { from },
                        _ => continue,
                    }
                }
                Some(Event::Stanza(Stanza::Iq(iq))) => {
                    self.handle_iq(iq).await;
                }
            }
        }
    }

    async fn handle_iq(&self, iq: Iq) {
        match iq.payload {
            IqType::Result(Some(payload)) if payload.is("query", ns::ROSTER) => {
                match Roster::try_from(payload) {
                    Ok(roster) => {
                        let mut cache = self.roster.lock().unwrap();
                        for item in roster.items {
                            cache.insert(item.jid.clone(), item.subscription);
                        }
                        debug!(contacts = cache.len(), "roster cache loaded");
                    }
                    Err(e) => warn!(error = %e, "undecodable roster result"),
                }
            }
            IqType::Set(payload) if payload.is("query", ns::ROSTER) => {
                match Roster::try_from(payload) {
                    Ok(push) => {
                        let mut cache = self.roster.lock().unwrap();
                        for item in push.items {
                            if item.subscription == Subscription::Remove {
                                cache.remove(&item.jid);
                            } else {
                                cache.insert(item.jid.clone(), item.subscription);
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "undecodable roster push"),
                }
                let ack = Iq::from_result(iq.id, None::<Roster>);
                let ack = match iq.from {
                    Some(from) => ack.with_to(from),
                    None => ack,
                };
                let mut client = self.client.lock().await;
                if let Err(e) = client.send_stanza(ack.into()).await {
                    warn!(error = %e, "cannot ack roster push");
                }
            }
            IqType::Get(_) | IqType::Set(_) => {
                // Anything unhandled gets the mandated service-unavailable.
                let error = StanzaError::new(
                    ErrorType::Cancel,
                    DefinedCondition::ServiceUnavailable,
                    "en",
                    "No handler defined for this kind of iq.",
                );
                let reply = Iq::from_error(iq.id, error);
                let reply = match iq.from {
                    Some(from) => reply.with_to(from),
                    None => reply,
                };
                let mut client = self.client.lock().await;
                if let Err(e) = client.send_stanza(reply.into()).await {
                    warn!(error = %e, "cannot answer iq");
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl ChatPort for BridgeSession {
    async fn send_chat(&self, to: &str, body: &str, lang: &str) -> Result<String, TransportError> {
        let to = Jid::from_str(to).map_err(xmpp_err)?;
        let (message, id) = stanza::chat_message(to, body, lang);
        let mut client = self.client.lock().await;
        client.send_stanza(message.into()).await.map_err(xmpp_err)?;
        Ok(id)
    }

    async fn presence(&self, to: &str, kind: PresenceKind) -> Result<(), TransportError> {
        let to = Jid::from_str(to).map_err(xmpp_err)?;
        let mut client = self.client.lock().await;
        client
            .send_stanza(stanza::presence_to(to, kind).into())
            .await
            .map_err(xmpp_err)?;
        Ok(())
    }

    async fn subscription_state(&self, jid: &str) -> Result<SubState, TransportError> {
        let jid = BareJid::from_str(jid).map_err(xmpp_err)?;
        let cache = self.roster.lock().unwrap();
        Ok(match cache.get(&jid) {
            Some(Subscription::Both) => SubState::Both,
            Some(Subscription::From) => SubState::From,
            Some(Subscription::To) => SubState::To,
            _ => SubState::None,
        })
    }

    async fn remove_contact(&self, jid: &str) -> Result<(), TransportError> {
        let bare = BareJid::from_str(jid).map_err(xmpp_err)?;
        let mut client = self.client.lock().await;
        client
            .send_stanza(stanza::presence_to(bare.clone().into(), PresenceKind::Unsubscribe).into())
            .await
            .map_err(xmpp_err)?;
        client
            .send_stanza(
                stanza::presence_to(bare.clone().into(), PresenceKind::Unsubscribed).into(),
            )
            .await
            .map_err(xmpp_err)?;
        client
            .send_stanza(stanza::roster_remove(bare.clone()).into())
            .await
            .map_err(xmpp_err)?;
        self.roster.lock().unwrap().remove(&bare);
        Ok(())
    }
}
