//! Local, never-serialised message metadata.

use std::{any::Any, collections::HashMap, fmt, net::SocketAddr, sync::Arc};

/// Transport metadata attached to a message by the receiving side.
#[derive(Clone, Default)]
pub struct MessageProperties {
    /// Via of the session the message arrived on.
    pub via: Option<String>,
    /// Content type announced for the session.
    pub content_type: Option<String>,
    /// Identifier of the receiving session.
    pub session_id: Option<String>,
    /// Address of the remote peer.
    pub remote_addr: Option<SocketAddr>,
    extensions: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl MessageProperties {
    /// Store an arbitrary property under `name`.
    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.extensions.insert(name.into(), Arc::new(value));
    }

    /// Fetch a property stored with [`insert`](Self::insert).
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.extensions.get(name)?.downcast_ref()
    }

    /// Remove a stored property.
    pub fn remove(&mut self, name: &str) -> bool { self.extensions.remove(name).is_some() }
}

impl fmt::Debug for MessageProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageProperties")
            .field("via", &self.via)
            .field("content_type", &self.content_type)
            .field("session_id", &self.session_id)
            .field("remote_addr", &self.remote_addr)
            .field("extensions", &self.extensions.keys().collect::<Vec<_>>())
            .finish()
    }
}
