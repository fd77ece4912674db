//! Service hosting: endpoints in, listeners and sessions out.

use std::{any::Any, collections::HashMap, sync::Arc, time::Duration};

use log::{info, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use url::Url;

use super::{
    DispatchRuntime,
    EndpointDispatcher,
    EndpointDispatcherTable,
    InstanceContextManager,
    InstanceContextMode,
    InstanceContextProvider,
    InstanceFactory,
    ListenerHandler,
    ServiceDispatcher,
    ServiceInstance,
    SessionRegistry,
};
use crate::{
    channel::{CommunicationObject, CommunicationState},
    config::TransportSettings,
    encoding::MessageEncoder,
    error::CommunicationError,
    timeout::TimeoutHelper,
    transport::{
        ChannelListener,
        DEFAULT_CHANNEL_BACKLOG,
        Registration,
        StreamUpgradeAcceptor,
        TransportManager,
    },
};

/// Errors raised while building, opening, or closing a [`ServiceHost`].
#[derive(Debug, Error)]
pub enum HostError {
    /// Two endpoints share an address and a contract.
    #[error("contract {contract} already has an endpoint at {address}")]
    DuplicateEndpoint {
        /// The shared address.
        address: String,
        /// The shared contract.
        contract: String,
    },
    /// An endpoint's contract has no operations.
    #[error("contract {0} defines no operations")]
    EmptyContract(String),
    /// Endpoints at one address disagree on the message encoding.
    #[error("endpoints at {address} use different content types: {first} and {second}")]
    ContentTypeConflict {
        /// The shared address.
        address: String,
        /// Content type of the first endpoint.
        first: String,
        /// Content type of the conflicting endpoint.
        second: String,
    },
    /// The host was opened or closed out of order.
    #[error("the service host cannot do that in the {0} state")]
    InvalidState(CommunicationState),
    /// The transport refused a listener, or shutdown ran out of time.
    #[error(transparent)]
    Transport(#[from] CommunicationError),
}

/// One endpoint of a service as the host is given it.
pub struct EndpointDescription {
    address: Url,
    contract_name: String,
    encoder: Arc<dyn MessageEncoder>,
    runtime: DispatchRuntime,
    filter_priority: i32,
    prefix: bool,
    upgrade: Option<Arc<dyn StreamUpgradeAcceptor>>,
}

impl EndpointDescription {
    /// An endpoint for `contract_name` at `address`.
    pub fn new(
        address: Url,
        contract_name: impl Into<String>,
        encoder: Arc<dyn MessageEncoder>,
        runtime: DispatchRuntime,
    ) -> Self {
        Self {
            address,
            contract_name: contract_name.into(),
            encoder,
            runtime,
            filter_priority: 0,
            prefix: false,
            upgrade: None,
        }
    }

    /// Prefer this endpoint when several match a message.
    #[must_use]
    pub fn with_filter_priority(mut self, priority: i32) -> Self {
        self.filter_priority = priority;
        self
    }

    /// Also accept messages addressed beneath this address.
    #[must_use]
    pub fn prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    /// Accept stream upgrades with `acceptor`.
    #[must_use]
    pub fn with_upgrade(mut self, acceptor: Arc<dyn StreamUpgradeAcceptor>) -> Self {
        self.upgrade = Some(acceptor);
        self
    }

    /// Endpoint address.
    #[must_use]
    pub fn address(&self) -> &Url { &self.address }

    /// Contract name.
    #[must_use]
    pub fn contract_name(&self) -> &str { &self.contract_name }
}

impl std::fmt::Debug for EndpointDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointDescription")
            .field("address", &self.address.as_str())
            .field("contract_name", &self.contract_name)
            .field("content_type", &self.encoder.content_type())
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ServiceHost`].
pub struct ServiceHostBuilder {
    endpoints: Vec<EndpointDescription>,
    mode: InstanceContextMode,
    factory: InstanceFactory,
    settings: TransportSettings,
    backlog: usize,
}

impl Default for ServiceHostBuilder {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            mode: InstanceContextMode::default(),
            factory: Arc::new(|| Arc::new(()) as ServiceInstance),
            settings: TransportSettings::default(),
            backlog: DEFAULT_CHANNEL_BACKLOG,
        }
    }
}

impl ServiceHostBuilder {
    /// Add an endpoint.
    #[must_use]
    pub fn add_endpoint(mut self, endpoint: EndpointDescription) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Create service instances with `factory`, scoped by `mode`.
    #[must_use]
    pub fn instance_factory<T, F>(mut self, mode: InstanceContextMode, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.mode = mode;
        self.factory = Arc::new(move || Arc::new(factory()) as ServiceInstance);
        self
    }

    /// Serve every request with `instance`.
    #[must_use]
    pub fn singleton<T: Any + Send + Sync>(mut self, instance: T) -> Self {
        let instance: ServiceInstance = Arc::new(instance);
        self.mode = InstanceContextMode::Single;
        self.factory = Arc::new(move || Arc::clone(&instance));
        self
    }

    /// Settings for the host's channel listeners.
    #[must_use]
    pub fn with_settings(mut self, settings: TransportSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Accepted channels each listener may queue.
    #[must_use]
    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }

    /// Validate the endpoints and build the host.
    ///
    /// # Errors
    ///
    /// [`HostError::EmptyContract`], [`HostError::DuplicateEndpoint`], or
    /// [`HostError::ContentTypeConflict`].
    pub fn build(self) -> Result<ServiceHost, HostError> {
        let mut listeners: Vec<ListenerSpec> = Vec::new();
        let mut by_address: HashMap<String, usize> = HashMap::new();
        let mut seen: Vec<(String, String)> = Vec::new();
        let mut dispatchers = Vec::with_capacity(self.endpoints.len());

        for endpoint in self.endpoints {
            if endpoint.runtime.is_empty() {
                return Err(HostError::EmptyContract(endpoint.contract_name));
            }
            let key = listener_key(&endpoint.address);
            if seen
                .iter()
                .any(|(address, contract)| *address == key && *contract == endpoint.contract_name)
            {
                return Err(HostError::DuplicateEndpoint {
                    address: endpoint.address.to_string(),
                    contract: endpoint.contract_name,
                });
            }
            seen.push((key.clone(), endpoint.contract_name.clone()));

            match by_address.get(&key) {
                Some(&index) => {
                    let first = listeners[index].encoder.content_type();
                    let second = endpoint.encoder.content_type();
                    if first != second {
                        return Err(HostError::ContentTypeConflict {
                            address: endpoint.address.to_string(),
                            first: first.to_owned(),
                            second: second.to_owned(),
                        });
                    }
                    if listeners[index].upgrade.is_none() {
                        listeners[index].upgrade.clone_from(&endpoint.upgrade);
                    }
                }
                None => {
                    by_address.insert(key, listeners.len());
                    listeners.push(ListenerSpec {
                        uri: endpoint.address.clone(),
                        encoder: Arc::clone(&endpoint.encoder),
                        upgrade: endpoint.upgrade.clone(),
                    });
                }
            }

            let mut dispatcher =
                EndpointDispatcher::new(endpoint.address, endpoint.contract_name, endpoint.runtime)
                    .with_filter_priority(endpoint.filter_priority);
            if endpoint.prefix {
                dispatcher = dispatcher.prefix();
            }
            dispatchers.push(Arc::new(dispatcher));
        }

        let instance_contexts = Arc::new(InstanceContextManager::new());
        let provider = InstanceContextProvider::new(self.mode, self.factory, Arc::clone(&instance_contexts));
        let dispatcher = ServiceDispatcher::new(
            Arc::new(EndpointDispatcherTable::new(dispatchers)),
            Arc::new(provider),
        );
        Ok(ServiceHost {
            object: CommunicationObject::new("service host"),
            listeners,
            dispatcher: Arc::new(dispatcher),
            instance_contexts,
            sessions: Arc::new(SessionRegistry::new()),
            settings: self.settings,
            backlog: self.backlog,
            registrations: Mutex::new(Vec::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }
}

fn listener_key(address: &Url) -> String {
    let mut key = address.clone();
    key.set_query(None);
    key.set_fragment(None);
    key.as_str().trim_end_matches('/').to_ascii_lowercase()
}

struct ListenerSpec {
    uri: Url,
    encoder: Arc<dyn MessageEncoder>,
    upgrade: Option<Arc<dyn StreamUpgradeAcceptor>>,
}

/// Hosts one service on a [`TransportManager`].
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
///
/// use corewcf::{
///     config::TransportSettings,
///     dispatcher::{
///         DispatchOperation,
///         DispatchRuntime,
///         EndpointDescription,
///         OperationError,
///         ServiceHost,
///         operation_fn,
///     },
///     encoding::TextMessageEncoder,
///     message::Message,
///     transport::TransportManager,
/// };
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = DispatchRuntime::new().with_operation(DispatchOperation::new(
///     "Echo",
///     "urn:echo",
///     operation_fn(|_, mut request: Message| async move {
///         request.read_body::<String>().map_err(OperationError::from)
///     }),
/// ));
/// let host = ServiceHost::builder()
///     .add_endpoint(EndpointDescription::new(
///         "net.tcp://localhost:8808/echo".parse()?,
///         "Echo",
///         Arc::new(TextMessageEncoder::soap12()),
///         runtime,
///     ))
///     .build()?;
/// let transport = TransportManager::new(TransportSettings::default());
/// host.open(&transport).await?;
/// // ...
/// host.close(Duration::from_secs(10)).await?;
/// # Ok(())
/// # }
/// ```
pub struct ServiceHost {
    object: CommunicationObject,
    listeners: Vec<ListenerSpec>,
    dispatcher: Arc<ServiceDispatcher>,
    instance_contexts: Arc<InstanceContextManager>,
    sessions: Arc<SessionRegistry>,
    settings: TransportSettings,
    backlog: usize,
    registrations: Mutex<Vec<Registration>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ServiceHost {
    /// Start describing a host.
    #[must_use]
    pub fn builder() -> ServiceHostBuilder { ServiceHostBuilder::default() }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> CommunicationState { self.object.state() }

    /// Live instance contexts.
    #[must_use]
    pub fn instance_contexts(&self) -> &Arc<InstanceContextManager> { &self.instance_contexts }

    /// Live sessions.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> { &self.sessions }

    /// The dispatcher serving requests.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<ServiceDispatcher> { &self.dispatcher }

    /// Register a listener per address with `transport` and start serving.
    ///
    /// # Errors
    ///
    /// [`HostError::InvalidState`] unless the host is newly built, or the
    /// transport's error if an address cannot be registered. Listeners
    /// registered before the failure are removed again.
    pub async fn open(&self, transport: &TransportManager) -> Result<(), HostError> {
        self.object
            .begin_open()
            .map_err(|_| HostError::InvalidState(self.object.state()))?;

        let mut registrations = self.registrations.lock().await;
        for spec in &self.listeners {
            let mut listener = ChannelListener::with_settings(
                spec.uri.clone(),
                Arc::clone(&spec.encoder),
                self.settings,
                self.backlog,
            );
            if let Some(upgrade) = &spec.upgrade {
                listener = listener.with_upgrade(Arc::clone(upgrade));
            }
            match transport.register(Arc::new(listener)).await {
                Ok(registration) => registrations.push(registration),
                Err(error) => {
                    warn!("service host open failed: error={error}, uri={}", spec.uri);
                    for registration in registrations.drain(..) {
                        registration.unregister().await;
                    }
                    self.object.fault();
                    return Err(error.into());
                }
            }
        }

        for registration in registrations.iter() {
            let handler = ListenerHandler::new(
                Arc::clone(registration.listener()),
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.sessions),
                self.tracker.clone(),
                self.shutdown.child_token(),
            );
            self.tracker.spawn(handler.run());
        }
        self.object.complete_open()?;
        info!(
            "service host opened: endpoints={}, listeners={}",
            self.dispatcher.table().endpoints().len(),
            registrations.len()
        );
        Ok(())
    }

    /// Stop accepting, close every session, then close the instance
    /// contexts. Whatever is still running when `timeout` expires is
    /// aborted.
    ///
    /// # Errors
    ///
    /// [`CommunicationError::Timeout`] naming `"service host close"` when
    /// the sessions did not finish in time; the host is aborted.
    pub async fn close(&self, timeout: Duration) -> Result<(), HostError> {
        let closing = self
            .object
            .begin_close()
            .map_err(|_| HostError::InvalidState(self.object.state()))?;
        if !closing {
            return Ok(());
        }
        let helper = TimeoutHelper::new(timeout);
        self.stop_listening().await;

        self.tracker.close();
        if helper.run("service host close", self.tracker.wait()).await.is_err() {
            warn!(
                "service host close timed out, aborting: sessions={}",
                self.sessions.active_ids().len()
            );
            self.abort().await;
            return Err(helper.elapsed("service host close").into());
        }
        self.instance_contexts.close_all();
        self.object.complete_close();
        info!("service host closed");
        Ok(())
    }

    /// Stop immediately: abort every session and instance context.
    pub async fn abort(&self) {
        self.object.abort();
        self.stop_listening().await;
        for channel in self.sessions.active_channels() {
            channel.abort().await;
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.instance_contexts.abort_all();
    }

    async fn stop_listening(&self) {
        self.shutdown.cancel();
        let registrations: Vec<_> = self.registrations.lock().await.drain(..).collect();
        for registration in registrations {
            registration.unregister().await;
        }
    }
}

impl std::fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHost")
            .field("state", &self.object.state())
            .field("listeners", &self.listeners.len())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
