//! One-shot sessions.
//!
//! The Fediverse listener has no standing XMPP connection, so each of its
//! XMPP-side operations logs in, pushes its stanzas and disconnects. The
//! whole exchange is bounded by a timeout so a wedged server cannot stall
//! the notification loop.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use jid::{BareJid, Jid};
use tokio_xmpp::{Client, Event, Stanza};
use tracing::debug;

use fedibridge_core::error::TransportError;
use fedibridge_core::port::{ChatPort, PresenceKind, SubState};

use crate::stanza;

const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

fn xmpp_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Xmpp(e.to_string())
}

/// Dial-per-call [`ChatPort`] for flows without a live session.
#[derive(Clone)]
pub struct TransientSession {
    jid: Jid,
    password: String,
}

impl TransientSession {
    pub fn new(jid: &str, password: &str) -> Result<TransientSession, TransportError> {
        Ok(TransientSession {
            jid: Jid::from_str(jid).map_err(xmpp_err)?,
            password: password.to_string(),
        })
    }

    /// Log in, announce presence, push `stanzas`, disconnect.
    async fn run(&self, stanzas: Vec<Stanza>) -> Result<(), TransportError> {
        let exchange = async {
            let mut client = Client::new(self.jid.clone(), self.password.clone());
            loop {
                match client.next().await {
                    Some(Event::Online { .. }) => break,
                    Some(Event::Disconnected(e)) => return Err(xmpp_err(e)),
                    Some(_) => continue,
                    None => {
                        return Err(TransportError::Xmpp(
                            "stream closed during login".to_string(),
                        ))
                    }
                }
            }
            client
                .send_stanza(stanza::available().into())
                .await
                .map_err(xmpp_err)?;
            let count = stanzas.len();
            for stanza in stanzas {
                client.send_stanza(stanza).await.map_err(xmpp_err)?;
            }
            client.send_end().await.map_err(xmpp_err)?;
            debug!(count, "one-shot session done");
            Ok(())
        };
        tokio::time::timeout(SESSION_TIMEOUT, exchange)
            .await
            .map_err(|_| TransportError::Xmpp("one-shot session timed out".to_string()))?
    }
}

#[async_trait]
impl ChatPort for TransientSession {
    async fn send_chat(&self, to: &str, body: &str, lang: &str) -> Result<String, TransportError> {
        let to = Jid::from_str(to).map_err(xmpp_err)?;
        let (message, id) = stanza::chat_message(to, body, lang);
        self.run(vec![message.into()]).await?;
        Ok(id)
    }

    async fn presence(&self, to: &str, kind: PresenceKind) -> Result<(), TransportError> {
        let to = Jid::from_str(to).map_err(xmpp_err)?;
        self.run(vec![stanza::presence_to(to, kind).into()]).await
    }

    async fn subscription_state(&self, _jid: &str) -> Result<SubState, TransportError> {
        // A throwaway session holds no roster; callers degrade to their
        // generic contact wording.
        Err(TransportError::Unsupported)
    }

    async fn remove_contact(&self, jid: &str) -> Result<(), TransportError> {
        let bare = BareJid::from_str(jid).map_err(xmpp_err)?;
        self.run(vec![
            stanza::presence_to(bare.clone().into(), PresenceKind::Unsubscribe).into(),
            stanza::presence_to(bare.clone().into(), PresenceKind::Unsubscribed).into(),
            stanza::roster_remove(bare).into(),
        ])
        .await
    }
}
