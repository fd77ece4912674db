//! Builder for configuring and connecting a [`ServiceClient`].

use std::{io, sync::Arc, time::Duration};

use log::debug;
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use url::Url;

use super::{ClientMessageInspector, ClientOperation, ImmutableClientRuntime, ServiceClient, SocketOptions};
use crate::{
    channel::{ClientDuplexSessionChannel, ClientSessionOptions},
    config::{Timeouts, TransportSettings},
    connection::Connection,
    dispatcher::effective_port,
    encoding::{MessageEncoder, TextMessageEncoder},
    error::CommunicationError,
    timeout::TimeoutHelper,
    transport::StreamUpgradeInitiator,
};

/// Builder for [`ServiceClient`].
///
/// # Examples
///
/// ```no_run
/// use corewcf::client::{ClientBuilder, ClientOperation};
/// use url::Url;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let endpoint = Url::parse("net.tcp://localhost:8808/calculator")?;
/// let client = ClientBuilder::new()
///     .nodelay(true)
///     .with_operation(ClientOperation::new("Add", "urn:add"))
///     .connect(&endpoint)
///     .await?;
/// let mut reply = client.call("Add", "1 2").await?;
/// let _sum: String = reply.read_body()?;
/// client.close(std::time::Duration::from_secs(5)).await?;
/// # Ok::<_, Box<dyn std::error::Error>>(())
/// # }
/// ```
#[derive(Clone)]
pub struct ClientBuilder {
    socket_options: SocketOptions,
    settings: TransportSettings,
    encoder: Arc<dyn MessageEncoder>,
    upgrade: Option<Arc<dyn StreamUpgradeInitiator>>,
    runtime: ImmutableClientRuntime,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        let encoder: Arc<dyn MessageEncoder> = Arc::new(TextMessageEncoder::soap12());
        Self {
            socket_options: SocketOptions::default(),
            settings: TransportSettings::default(),
            runtime: ImmutableClientRuntime::new(encoder.message_version()),
            encoder,
            upgrade: None,
        }
    }
}

impl ClientBuilder {
    /// A builder using SOAP 1.2 text encoding and default settings.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Replace the socket options applied before connecting.
    #[must_use]
    pub fn socket_options(mut self, socket_options: SocketOptions) -> Self {
        self.socket_options = socket_options;
        self
    }

    /// Configure `TCP_NODELAY`.
    #[must_use]
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.socket_options = self.socket_options.nodelay(enabled);
        self
    }

    /// Configure keepalive probes.
    #[must_use]
    pub fn keepalive(mut self, idle: Option<Duration>) -> Self {
        self.socket_options = self.socket_options.keepalive(idle);
        self
    }

    /// Configure linger on close.
    #[must_use]
    pub fn linger(mut self, duration: Option<Duration>) -> Self {
        self.socket_options = self.socket_options.linger(duration);
        self
    }

    /// Replace the transport settings.
    #[must_use]
    pub fn with_settings(mut self, settings: TransportSettings) -> Self {
        self.settings = settings.normalized();
        self
    }

    /// Replace only the timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.settings.timeouts = timeouts;
        self
    }

    /// Encode messages with `encoder`.
    #[must_use]
    pub fn with_encoder(mut self, encoder: Arc<dyn MessageEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Upgrade the stream with `initiator` while opening the session.
    #[must_use]
    pub fn with_upgrade(mut self, initiator: Arc<dyn StreamUpgradeInitiator>) -> Self {
        self.upgrade = Some(initiator);
        self
    }

    /// Add an operation to the contract.
    #[must_use]
    pub fn with_operation(mut self, operation: ClientOperation) -> Self {
        self.runtime = self.runtime.with_operation(operation);
        self
    }

    /// Add a message inspector.
    #[must_use]
    pub fn with_inspector(mut self, inspector: Arc<dyn ClientMessageInspector>) -> Self {
        self.runtime = self.runtime.with_inspector(inspector);
        self
    }

    /// Replace the whole contract.
    #[must_use]
    pub fn with_runtime(mut self, runtime: ImmutableClientRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    /// Connect over TCP to `endpoint` and open a session with it.
    ///
    /// `net.tcp` addresses without a port use port 808. The connect and the
    /// session handshake each run under the open timeout.
    ///
    /// # Errors
    ///
    /// [`CommunicationError::EndpointNotFound`] if the address has no host
    /// or nothing accepts the connection, [`CommunicationError::Timeout`]
    /// naming `"connect"` or `"open"`, or the handshake failure.
    pub async fn connect(self, endpoint: &Url) -> Result<ServiceClient, CommunicationError> {
        let not_found = || CommunicationError::EndpointNotFound(endpoint.to_string());
        let host = endpoint.host_str().ok_or_else(not_found)?;
        let port = effective_port(endpoint).ok_or_else(not_found)?;
        let helper = TimeoutHelper::new(self.settings.timeouts.open);
        let stream = helper
            .run("connect", self.dial(host, port))
            .await?
            .map_err(|error| {
                debug!("connect failed: error={error}, endpoint={endpoint}");
                not_found()
            })?;
        let remote_addr = stream.peer_addr()?;
        let connection =
            Connection::new(stream, self.settings.connection_buffer_size).with_remote_addr(remote_addr);
        self.connect_over(connection, endpoint).await
    }

    /// Open a session with `endpoint` over an established `connection`.
    ///
    /// # Errors
    ///
    /// As [`ClientDuplexSessionChannel::open`].
    pub async fn connect_over(
        self,
        connection: Connection,
        endpoint: &Url,
    ) -> Result<ServiceClient, CommunicationError> {
        let mut options =
            ClientSessionOptions::new(endpoint.as_str(), Arc::clone(&self.encoder)).with_settings(self.settings);
        if let Some(upgrade) = self.upgrade {
            options = options.with_upgrade(upgrade);
        }
        let channel = ClientDuplexSessionChannel::open(connection, options).await?;
        Ok(ServiceClient::new(channel, self.runtime, endpoint.as_str()))
    }

    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in lookup_host((host, port)).await? {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            self.socket_options.apply(&socket)?;
            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(error) => last_error = Some(error),
            }
        }
        Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved")))
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("socket_options", &self.socket_options)
            .field("settings", &self.settings)
            .field("content_type", &self.encoder.content_type())
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}
