//! Instance contexts: where service instances live and for how long.
//!
//! A service picks one [`InstanceContextMode`]. The
//! [`InstanceContextProvider`] applies it when a request arrives: a fresh
//! context per call, one context bound to each session, or one context for
//! the life of the host. Every live context is tracked by the host's
//! [`InstanceContextManager`], which closes or aborts whatever is left at
//! shutdown.

use std::{
    any::Any,
    fmt,
    sync::{Arc, OnceLock},
};

use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::channel::{CommunicationObject, CommunicationState};

/// Lifetime of service instances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InstanceContextMode {
    /// A new instance for every request.
    PerCall,
    /// One instance per session channel.
    #[default]
    PerSession,
    /// One instance shared by every request.
    Single,
}

/// Stable handle of a context in an [`InstanceContextManager`].
///
/// Slots are reused after removal; the generation tells an old handle
/// apart from the context now occupying its slot. A slot whose generation
/// is exhausted is retired rather than reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId {
    slot: usize,
    generation: u32,
}

impl InstanceId {
    /// Slot index in the manager's arena.
    #[must_use]
    pub fn slot(&self) -> usize { self.slot }

    /// Generation of the slot when this context was added.
    #[must_use]
    pub fn generation(&self) -> u32 { self.generation }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

/// A service instance.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// Creates service instances.
pub type InstanceFactory = Arc<dyn Fn() -> ServiceInstance + Send + Sync>;

/// The scope one service instance lives in.
pub struct InstanceContext {
    id: InstanceId,
    singleton: bool,
    object: CommunicationObject,
    instance: ServiceInstance,
    incoming_channels: Mutex<Vec<String>>,
}

impl InstanceContext {
    /// Handle in the owning manager.
    #[must_use]
    pub fn id(&self) -> InstanceId { self.id }

    /// Returns true for the host-lifetime context of a `Single` service.
    #[must_use]
    pub fn is_singleton(&self) -> bool { self.singleton }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> CommunicationState { self.object.state() }

    /// The service instance.
    #[must_use]
    pub fn instance(&self) -> &ServiceInstance { &self.instance }

    /// The service instance as `T`, if it is one.
    #[must_use]
    pub fn instance_as<T: Any + Send + Sync>(&self) -> Option<&T> { self.instance.downcast_ref() }

    /// Bind the session `session_id` to this context.
    pub fn bind_incoming_channel(&self, session_id: &str) {
        let mut channels = self.incoming_channels.lock();
        if !channels.iter().any(|id| id == session_id) {
            channels.push(session_id.to_owned());
        }
    }

    /// Unbind a session; returns true once no session remains bound.
    pub fn unbind_incoming_channel(&self, session_id: &str) -> bool {
        let mut channels = self.incoming_channels.lock();
        channels.retain(|id| id != session_id);
        channels.is_empty()
    }

    /// Sessions currently bound.
    #[must_use]
    pub fn incoming_channels(&self) -> Vec<String> { self.incoming_channels.lock().clone() }

    fn close(&self) {
        if matches!(self.object.begin_close(), Ok(true)) {
            self.object.complete_close();
        }
    }

    fn abort(&self) { self.object.abort(); }
}

impl fmt::Debug for InstanceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceContext")
            .field("id", &self.id)
            .field("singleton", &self.singleton)
            .field("state", &self.object.state())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    context: Option<Arc<InstanceContext>>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    len: usize,
}

impl Arena {
    /// Empty `slot` and make it available again under a new generation.
    fn vacate(&mut self, slot: usize) -> Option<Arc<InstanceContext>> {
        let entry = self.slots.get_mut(slot)?;
        let context = entry.context.take()?;
        match entry.generation.checked_add(1) {
            Some(next) => {
                entry.generation = next;
                self.free.push(slot);
            }
            None => warn!("retiring instance slot with exhausted generations: slot={slot}"),
        }
        self.len -= 1;
        Some(context)
    }
}

/// Tracks every live instance context of a host.
#[derive(Default)]
pub struct InstanceContextManager {
    arena: Mutex<Arena>,
}

impl InstanceContextManager {
    /// An empty manager.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Create and track a context holding `instance`.
    pub fn add(&self, instance: ServiceInstance, singleton: bool) -> Arc<InstanceContext> {
        let mut arena = self.arena.lock();
        let slot = match arena.free.pop() {
            Some(slot) => slot,
            None => {
                arena.slots.push(Slot::default());
                arena.slots.len() - 1
            }
        };
        let entry = &mut arena.slots[slot];
        let context = Arc::new(InstanceContext {
            id: InstanceId {
                slot,
                generation: entry.generation,
            },
            singleton,
            object: CommunicationObject::opened("instance context"),
            instance,
            incoming_channels: Mutex::new(Vec::new()),
        });
        entry.context = Some(Arc::clone(&context));
        arena.len += 1;
        context
    }

    /// Stop tracking the context at `id`. Stale handles return `None`.
    pub fn remove(&self, id: InstanceId) -> Option<Arc<InstanceContext>> {
        let mut arena = self.arena.lock();
        if arena.slots.get(id.slot)?.generation != id.generation {
            return None;
        }
        arena.vacate(id.slot)
    }

    /// The live context at `id`.
    #[must_use]
    pub fn get(&self, id: InstanceId) -> Option<Arc<InstanceContext>> {
        let arena = self.arena.lock();
        let entry = arena.slots.get(id.slot)?;
        (entry.generation == id.generation)
            .then(|| entry.context.clone())
            .flatten()
    }

    /// Number of live contexts.
    #[must_use]
    pub fn len(&self) -> usize { self.arena.lock().len }

    /// Returns true if no context is live.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn drain(&self) -> Vec<Arc<InstanceContext>> {
        let mut arena = self.arena.lock();
        let slots = arena.slots.len();
        (0..slots).filter_map(|slot| arena.vacate(slot)).collect()
    }

    /// Close and forget every live context.
    pub fn close_all(&self) {
        let contexts = self.drain();
        debug!("closing instance contexts: count={}", contexts.len());
        for context in contexts {
            context.close();
        }
    }

    /// Abort and forget every live context.
    pub fn abort_all(&self) {
        for context in self.drain() {
            context.abort();
        }
    }
}

impl fmt::Debug for InstanceContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceContextManager")
            .field("len", &self.len())
            .finish()
    }
}

/// Chooses the instance context for each request according to the
/// service's [`InstanceContextMode`].
pub struct InstanceContextProvider {
    mode: InstanceContextMode,
    factory: InstanceFactory,
    manager: Arc<InstanceContextManager>,
    sessions: DashMap<String, Arc<InstanceContext>>,
    singleton: OnceLock<Arc<InstanceContext>>,
}

impl InstanceContextProvider {
    /// A provider creating instances with `factory` and tracking them in
    /// `manager`.
    #[must_use]
    pub fn new(
        mode: InstanceContextMode,
        factory: InstanceFactory,
        manager: Arc<InstanceContextManager>,
    ) -> Self {
        Self {
            mode,
            factory,
            manager,
            sessions: DashMap::new(),
            singleton: OnceLock::new(),
        }
    }

    /// The configured mode.
    #[must_use]
    pub fn mode(&self) -> InstanceContextMode { self.mode }

    /// The manager contexts are tracked in.
    #[must_use]
    pub fn manager(&self) -> &Arc<InstanceContextManager> { &self.manager }

    /// Context for a request arriving on `session_id`, creating one when
    /// the mode calls for it.
    pub fn acquire(&self, session_id: &str) -> Arc<InstanceContext> {
        match self.mode {
            InstanceContextMode::PerCall => self.manager.add((self.factory)(), false),
            InstanceContextMode::PerSession => {
                let context = self
                    .sessions
                    .entry(session_id.to_owned())
                    .or_insert_with(|| self.manager.add((self.factory)(), false))
                    .clone();
                context.bind_incoming_channel(session_id);
                context
            }
            InstanceContextMode::Single => {
                let context = self
                    .singleton
                    .get_or_init(|| self.manager.add((self.factory)(), true));
                context.bind_incoming_channel(session_id);
                Arc::clone(context)
            }
        }
    }

    /// The request using `context` finished.
    pub fn release_call(&self, context: &Arc<InstanceContext>) {
        if self.mode == InstanceContextMode::PerCall {
            self.retire(context, false);
        }
    }

    /// The session `session_id` ended. `aborted` aborts its per-session
    /// context instead of closing it.
    pub fn release_session(&self, session_id: &str, aborted: bool) {
        match self.mode {
            InstanceContextMode::PerCall => {}
            InstanceContextMode::PerSession => {
                if let Some((_, context)) = self.sessions.remove(session_id)
                    && context.unbind_incoming_channel(session_id)
                {
                    self.retire(&context, aborted);
                }
            }
            InstanceContextMode::Single => {
                if let Some(context) = self.singleton.get() {
                    context.unbind_incoming_channel(session_id);
                }
            }
        }
    }

    /// Abort `context` after a failure it cannot recover from. The
    /// singleton survives.
    pub fn abort(&self, context: &Arc<InstanceContext>, session_id: &str) {
        if context.is_singleton() {
            return;
        }
        self.sessions.remove_if(session_id, |_, bound| Arc::ptr_eq(bound, context));
        self.retire(context, true);
    }

    fn retire(&self, context: &Arc<InstanceContext>, aborted: bool) {
        if aborted {
            context.abort();
        } else {
            context.close();
        }
        self.manager.remove(context.id());
    }
}

impl fmt::Debug for InstanceContextProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceContextProvider")
            .field("mode", &self.mode)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
