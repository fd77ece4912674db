//! Registry of live session channels.
//!
//! `SessionRegistry` stores non-owning weak references to the channels a
//! host is serving, so the host can close or abort them at shutdown without
//! keeping finished sessions alive. Dead entries are pruned lazily at lookup
//! time or in bulk.
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::channel::SessionChannel;

/// Concurrent registry of session channels keyed by session id.
#[derive(Default)]
pub struct SessionRegistry(DashMap<String, Weak<dyn SessionChannel>>);

impl SessionRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Retrieve the channel for `id` if it is still alive.
    pub fn get(&self, id: &str) -> Option<Arc<dyn SessionChannel>> {
        let guard = self.0.get(id);
        let channel = guard.as_ref().and_then(|weak| weak.upgrade());
        drop(guard);
        if channel.is_none() {
            self.0.remove_if(id, |_, weak| weak.strong_count() == 0);
        }
        channel
    }

    /// Track a newly accepted channel.
    pub fn insert(&self, channel: &Arc<dyn SessionChannel>) {
        self.0
            .insert(channel.session_id().to_owned(), Arc::downgrade(channel));
    }

    /// Forget a channel, typically when its handler finishes.
    pub fn remove(&self, id: &str) { self.0.remove(id); }

    /// Remove all stale weak references.
    pub fn prune(&self) { self.0.retain(|_, weak| weak.strong_count() > 0); }

    /// Prune stale entries, then return the ids of the live sessions.
    #[must_use]
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.0.len());
        self.0.retain(|id, weak| {
            if weak.strong_count() > 0 {
                ids.push(id.clone());
                true
            } else {
                false
            }
        });
        ids
    }

    /// Prune stale entries, then collect the live channels.
    #[must_use]
    pub fn active_channels(&self) -> Vec<Arc<dyn SessionChannel>> {
        let mut channels = Vec::with_capacity(self.0.len());
        self.0.retain(|_, weak| {
            if let Some(channel) = weak.upgrade() {
                channels.push(channel);
                true
            } else {
                false
            }
        });
        channels
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("len", &self.0.len())
            .finish()
    }
}
