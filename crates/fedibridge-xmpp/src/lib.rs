//! XMPP session plumbing for the bridge JID.
//!
//! Two session kinds over tokio-xmpp, matching the two execution contexts
//! the core runs in: the XMPP listener drives a persistent
//! [`BridgeSession`], while the Fediverse listener reaches XMPP through a
//! [`TransientSession`] that dials once per operation. Both implement
//! [`fedibridge_core::port::ChatPort`].

pub mod session;
pub mod stanza;
pub mod transient;

pub use session::{BridgeSession, SessionEvent};
pub use transient::TransientSession;
