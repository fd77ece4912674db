//! Shared listening sockets and via demultiplexing.
//!
//! One [`TransportManager`] owns every listening socket of a host. Listeners
//! register by URI; the first registration on a port binds the socket and
//! starts a [`ConnectionAcceptor`] for it, and the last unregistration stops
//! it. Each accepted connection runs the preamble exchange and is handed to
//! the listener whose URI is the longest prefix of the announced via.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use futures::{FutureExt, future::BoxFuture};
use log::{debug, info};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use url::Url;

use super::{ChannelListener, ListenerResolver, ServerPreambleReader};
use crate::{
    channel::CommunicationState,
    config::TransportSettings,
    connection::{
        AcceptListener,
        AcceptorSettings,
        BackoffConfig,
        Connection,
        ConnectionAcceptor,
        ConnectionCallback,
        Dequeued,
        TcpAcceptListener,
    },
    dispatcher::{HostNameComparisonMode, UriPrefixTable, effective_port},
    error::CommunicationError,
};

/// Routes preambles arriving on one port to registered listeners.
struct Demux {
    table: RwLock<UriPrefixTable<Arc<ChannelListener>>>,
    reader: ServerPreambleReader,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ListenerResolver for Demux {
    fn resolve(&self, via: &Url) -> Option<Arc<ChannelListener>> {
        self.table.resolve(via)
    }
}

struct PortEndpoint {
    demux: Arc<Demux>,
    acceptor: ConnectionAcceptor,
    /// Sockets handed in by the caller outlive their registrations.
    adopted: bool,
}

struct Inner {
    settings: TransportSettings,
    backoff: BackoffConfig,
    mode: HostNameComparisonMode,
    ports: Mutex<HashMap<u16, PortEndpoint>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Owns listening sockets and hands negotiated sessions to listeners.
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<Inner>,
}

impl TransportManager {
    /// A manager applying `settings` to every socket it opens.
    #[must_use]
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings: settings.normalized(),
                backoff: BackoffConfig::default(),
                mode: HostNameComparisonMode::default(),
                ports: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Replace the accept back-off.
    ///
    /// Only valid before the manager is shared.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.backoff = backoff.normalized();
        }
        self
    }

    /// Replace how hosts take part in via matching.
    ///
    /// Only valid before the manager is shared.
    #[must_use]
    pub fn with_host_name_comparison(mut self, mode: HostNameComparisonMode) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.mode = mode;
        }
        self
    }

    /// Settings applied to accepted connections.
    #[must_use]
    pub fn settings(&self) -> &TransportSettings { &self.inner.settings }

    /// Serve the port of an already bound socket.
    ///
    /// Registrations for that port use this socket instead of binding a new
    /// one, and it stays open until [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// Fails if the port is already served or the socket cannot be adopted.
    pub async fn bind_existing_listener(
        &self,
        listener: std::net::TcpListener,
    ) -> Result<SocketAddr, CommunicationError> {
        let listener = TcpAcceptListener::from_std(listener)?
            .with_buffer_size(self.inner.settings.connection_buffer_size);
        let addr = listener.local_addr()?;
        self.adopt_listener(addr.port(), Arc::new(listener)).await?;
        Ok(addr)
    }

    /// Serve `port` from any [`AcceptListener`], such as an in-memory one.
    ///
    /// # Errors
    ///
    /// Fails with [`CommunicationError::AddressAlreadyInUse`] if the port is
    /// already served, or with the listener's error if accepting cannot start.
    pub async fn adopt_listener(
        &self,
        port: u16,
        listener: Arc<dyn AcceptListener>,
    ) -> Result<(), CommunicationError> {
        let mut ports = self.inner.ports.lock().await;
        if ports.contains_key(&port) {
            return Err(CommunicationError::AddressAlreadyInUse(format!("port {port}")));
        }
        let endpoint = self.inner.start_endpoint(listener, true).await?;
        ports.insert(port, endpoint);
        Ok(())
    }

    /// Register `listener` at its URI, opening it and binding its port if
    /// nothing serves that port yet.
    ///
    /// # Errors
    ///
    /// - [`CommunicationError::AddressAlreadyInUse`] if another listener is
    ///   registered at the same URI.
    /// - [`CommunicationError::Io`] if the port cannot be bound.
    pub async fn register(
        &self,
        listener: Arc<ChannelListener>,
    ) -> Result<Registration, CommunicationError> {
        let uri = listener.uri().clone();
        let port = effective_port(&uri)
            .ok_or_else(|| CommunicationError::Protocol(format!("{uri} does not name a port")))?;

        let mut ports = self.inner.ports.lock().await;
        if !ports.contains_key(&port) {
            let socket = TcpAcceptListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
                .await?
                .with_buffer_size(self.inner.settings.connection_buffer_size);
            let endpoint = self.inner.start_endpoint(Arc::new(socket), false).await?;
            ports.insert(port, endpoint);
        }
        let Some(endpoint) = ports.get(&port) else {
            return Err(CommunicationError::AddressAlreadyInUse(uri.to_string()));
        };

        if endpoint.demux.table.read().is_registered(&uri) {
            return Err(CommunicationError::AddressAlreadyInUse(uri.to_string()));
        }
        if listener.state() == CommunicationState::Created {
            listener.open()?;
        }
        if endpoint
            .demux
            .table
            .write()
            .insert(&uri, Arc::clone(&listener))
            .is_err()
        {
            return Err(CommunicationError::AddressAlreadyInUse(uri.to_string()));
        }
        info!("listener registered: uri={uri}, port={port}");
        Ok(Registration {
            inner: Arc::clone(&self.inner),
            port,
            listener,
        })
    }

    /// Stop every socket, close every registered listener, and wait for
    /// in-flight preamble exchanges to finish.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let endpoints: Vec<PortEndpoint> = {
            let mut ports = self.inner.ports.lock().await;
            ports.drain().map(|(_, endpoint)| endpoint).collect()
        };
        for endpoint in endpoints {
            endpoint.stop().await;
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("settings", &self.inner.settings)
            .field("mode", &self.inner.mode)
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn start_endpoint(
        &self,
        listener: Arc<dyn AcceptListener>,
        adopted: bool,
    ) -> Result<PortEndpoint, CommunicationError> {
        let demux = Arc::new(Demux {
            table: RwLock::new(UriPrefixTable::new(self.mode)),
            reader: ServerPreambleReader::new(self.settings),
            tracker: self.tracker.clone(),
            shutdown: self.shutdown.clone(),
        });
        let callback: ConnectionCallback = {
            let demux = Arc::clone(&demux);
            Arc::new(move |connection, dequeued| {
                let demux = Arc::clone(&demux);
                let tracker = demux.tracker.clone();
                tracker.spawn(serve_connection(demux, connection, Some(dequeued)));
            })
        };
        let acceptor = ConnectionAcceptor::new(
            listener,
            AcceptorSettings {
                max_accepts: self.settings.max_pending_accepts,
                max_pending_connections: self.settings.max_pending_connections,
                backoff: self.backoff,
            },
            callback,
            None,
        );
        acceptor.start_accepting().await?;
        if let Ok(addr) = acceptor.local_addr() {
            info!("listening: local_addr={addr}");
        }
        Ok(PortEndpoint {
            demux,
            acceptor,
            adopted,
        })
    }
}

impl PortEndpoint {
    async fn stop(self) {
        self.acceptor.dispose().await;
        let listeners: Vec<Arc<ChannelListener>> =
            self.demux.table.read().items().cloned().collect();
        for listener in listeners {
            listener.close().await;
        }
    }
}

/// Run the preamble exchange on `connection` and queue the resulting
/// channel. Connections handed back after a clean session end go around
/// again.
fn serve_connection(
    demux: Arc<Demux>,
    connection: Connection,
    dequeued: Option<Dequeued>,
) -> BoxFuture<'static, ()> {
    async move {
        let remote_addr = connection.remote_addr();
        let negotiated = tokio::select! {
            biased;
            () = demux.shutdown.cancelled() => return,
            negotiated = demux.reader.negotiate(connection, demux.as_ref()) => negotiated,
        };
        if let Some(dequeued) = dequeued {
            dequeued.complete().await;
        }
        match negotiated {
            Ok(accepted) => {
                let reuse = {
                    let demux = Arc::clone(&demux);
                    Box::new(move |connection: Connection| {
                        let tracker = demux.tracker.clone();
                        if !demux.shutdown.is_cancelled() {
                            tracker.spawn(serve_connection(demux, connection, None));
                        }
                    })
                };
                accepted.slot.send(accepted.channel.with_connection_reuse(reuse));
            }
            Err(e) => debug!("no session accepted: error={e}, remote_addr={remote_addr:?}"),
        }
    }
    .boxed()
}

/// A listener's claim on its URI. Dropping it leaves the listener
/// registered; call [`unregister`](Self::unregister).
pub struct Registration {
    inner: Arc<Inner>,
    port: u16,
    listener: Arc<ChannelListener>,
}

impl Registration {
    /// The registered listener.
    #[must_use]
    pub fn listener(&self) -> &Arc<ChannelListener> { &self.listener }

    /// Port the listener is served on.
    #[must_use]
    pub fn port(&self) -> u16 { self.port }

    /// Remove the listener and close it. The port's socket stops once no
    /// listener remains on it, unless the socket was adopted.
    pub async fn unregister(self) {
        let stopped = {
            let mut ports = self.inner.ports.lock().await;
            let remaining = ports.get(&self.port).map(|endpoint| {
                let mut table = endpoint.demux.table.write();
                table.remove(self.listener.uri());
                (table.is_empty(), endpoint.adopted)
            });
            match remaining {
                Some((true, false)) => ports.remove(&self.port),
                _ => None,
            }
        };
        self.listener.close().await;
        if let Some(endpoint) = stopped {
            info!("port released: port={}", self.port);
            endpoint.stop().await;
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("uri", &self.listener.uri().as_str())
            .field("port", &self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests;
