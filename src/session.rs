//! Envelope reading for an established session.
//!
//! [`SessionConnectionReader`] turns the framed byte stream after the
//! preamble into a sequence of [`Message`](crate::message::Message)s,
//! ending with `None` when the peer writes the `End` record.
//! [`SynchronizedMessageSource`] serializes callers so envelope boundaries
//! are never read by two receives at once.

mod reader;
mod source;

use std::{net::SocketAddr, sync::Arc};

pub use reader::SessionConnectionReader;
pub use source::SynchronizedMessageSource;
use tokio::sync::Mutex;

use crate::connection::ConnectionWriter;

/// Write half shared between a channel's send path and its reader.
///
/// The mutex doubles as the channel's send lock: whoever holds it writes
/// one complete record. The slot is emptied when the channel aborts or hands
/// the connection back.
pub type SharedWriter = Arc<Mutex<Option<ConnectionWriter>>>;

/// Identity of a session, stamped onto every message it receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session identifier (`urn:uuid:...`).
    pub id: String,
    /// Via the client addressed.
    pub via: String,
    /// Content type negotiated in the preamble.
    pub content_type: String,
    /// Address of the peer, when known.
    pub remote_addr: Option<SocketAddr>,
}

impl SessionInfo {
    /// Describe a new session with a fresh identifier.
    pub fn new(via: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            id: format!("urn:uuid:{}", uuid::Uuid::new_v4()),
            via: via.into(),
            content_type: content_type.into(),
            remote_addr: None,
        }
    }

    /// Record the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_addr = addr;
        self
    }
}
