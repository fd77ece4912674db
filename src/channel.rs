//! Session channels.
//!
//! A [`DuplexSessionChannel`] owns one framed connection after its preamble
//! has been accepted. Sends are serialized by the write-half lock and
//! receives by a [`SynchronizedMessageSource`](crate::session::SynchronizedMessageSource),
//! so the two directions progress independently. Closing the output session
//! writes `End`; closing the channel also drains the input session.

mod client;
mod duplex;
mod state;

use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
pub use client::ClientSessionOptions;
pub(crate) use duplex::ChannelParts;
pub use duplex::{
    ClientDuplexSessionChannel,
    ConnectionReuse,
    DuplexSessionChannel,
    ReceiveOutcome,
    ServerDuplexSessionChannel,
};
pub use state::{CommunicationObject, CommunicationState};

use crate::{config::Timeouts, error::CommunicationError, message::Message, session::SessionInfo};

/// The session-channel surface the dispatcher drives.
///
/// Object safe so handlers can hold any decoder flavour behind one type.
#[async_trait]
pub trait SessionChannel: Send + Sync {
    /// Identity of the session.
    fn session(&self) -> &SessionInfo;

    /// Unique identifier of the session.
    fn session_id(&self) -> &str;

    /// Via the session was opened against.
    fn via(&self) -> &str;

    /// Address of the peer, when known.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Current lifecycle state.
    fn state(&self) -> CommunicationState;

    /// Operation budgets configured for the channel.
    fn timeouts(&self) -> Timeouts;

    /// Send one message.
    async fn send(&self, message: &Message, timeout: Duration) -> Result<(), CommunicationError>;

    /// Receive the next message, or `None` at end of session.
    async fn receive(&self, timeout: Duration) -> Result<Option<Message>, CommunicationError>;

    /// Close gracefully, aborting on failure.
    async fn close(&self, timeout: Duration) -> Result<(), CommunicationError>;

    /// Close without a handshake.
    async fn abort(&self);
}
