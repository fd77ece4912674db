//! Server side of the preamble exchange.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;
use url::Url;

use super::{ChannelListener, StreamUpgradeAcceptor, listener::ChannelSlot};
use crate::{
    channel::{ChannelParts, ServerDuplexSessionChannel},
    config::TransportSettings,
    connection::Connection,
    dispatcher::UriPrefixTable,
    error::CommunicationError,
    framing::{
        FramingError,
        FramingFault,
        FramingMode,
        ServerSessionDecoder,
        ServerSessionState,
        writer::{self, PREAMBLE_ACK, UPGRADE_RESPONSE},
    },
    metrics,
    session::SessionInfo,
    timeout::TimeoutHelper,
};

/// Finds the listener serving a via.
pub trait ListenerResolver: Send + Sync {
    /// The open listener registered at the longest prefix of `via`.
    fn resolve(&self, via: &Url) -> Option<Arc<ChannelListener>>;
}

impl ListenerResolver for UriPrefixTable<Arc<ChannelListener>> {
    fn resolve(&self, via: &Url) -> Option<Arc<ChannelListener>> { self.lookup(via).cloned() }
}

impl ListenerResolver for RwLock<UriPrefixTable<Arc<ChannelListener>>> {
    fn resolve(&self, via: &Url) -> Option<Arc<ChannelListener>> { self.read().resolve(via) }
}

/// A session whose preamble has been acknowledged.
pub(crate) struct AcceptedSession {
    pub listener: Arc<ChannelListener>,
    pub channel: ServerDuplexSessionChannel,
    pub slot: ChannelSlot,
}

/// Reads client preambles and turns accepted ones into session channels.
#[derive(Clone, Copy, Debug)]
pub struct ServerPreambleReader {
    settings: TransportSettings,
}

impl ServerPreambleReader {
    /// A reader applying `settings`' string quotas and initialization
    /// timeout.
    #[must_use]
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings: settings.normalized(),
        }
    }

    /// Negotiate a session on `connection` and queue its channel on the
    /// listener the via resolves to.
    ///
    /// # Errors
    ///
    /// Every rejection has already written one fault record and shut the
    /// connection down when this returns. A timeout drops the connection.
    pub async fn accept(
        &self,
        connection: Connection,
        resolver: &dyn ListenerResolver,
    ) -> Result<Arc<ChannelListener>, CommunicationError> {
        let accepted = self.negotiate(connection, resolver).await?;
        let listener = accepted.listener;
        accepted.slot.send(accepted.channel);
        Ok(listener)
    }

    pub(crate) async fn negotiate(
        &self,
        connection: Connection,
        resolver: &dyn ListenerResolver,
    ) -> Result<AcceptedSession, CommunicationError> {
        let helper = TimeoutHelper::new(self.settings.channel_initialization_timeout);
        helper
            .run("channel initialization", self.negotiate_inner(connection, resolver))
            .await?
    }

    async fn negotiate_inner(
        &self,
        mut connection: Connection,
        resolver: &dyn ListenerResolver,
    ) -> Result<AcceptedSession, CommunicationError> {
        let mut decoder = ServerSessionDecoder::new(self.settings.decoder_limits());
        if let Err(error) = read_to_stop(&mut connection, &mut decoder).await {
            return Err(reject_error(connection, error).await);
        }

        if let Some(mode) = decoder.mode()
            && mode != FramingMode::Duplex
        {
            let error = CommunicationError::Protocol(format!("framing mode {mode:?} is not supported"));
            return Err(reject(connection, FramingFault::UnsupportedMode, error).await);
        }
        let Some(via) = decoder.via().cloned() else {
            let error = CommunicationError::Protocol("preamble carried no via".to_owned());
            return Err(reject(connection, FramingFault::EndpointNotFound, error).await);
        };
        let Some(listener) = resolver.resolve(&via) else {
            let error = CommunicationError::EndpointNotFound(via.to_string());
            return Err(reject(connection, FramingFault::EndpointNotFound, error).await);
        };
        let content_type = decoder.content_type().unwrap_or_default().to_owned();
        if !listener.encoder().is_content_type_supported(&content_type) {
            let error = CommunicationError::Protocol(format!(
                "content type {content_type} is not supported by the endpoint at {via}"
            ));
            return Err(reject(connection, FramingFault::ContentTypeInvalid, error).await);
        }

        loop {
            if let Err(error) = read_to_stop(&mut connection, &mut decoder).await {
                return Err(reject_error(connection, error).await);
            }
            match decoder.state() {
                ServerSessionState::UpgradeRequest => {
                    let protocol = decoder.upgrade().unwrap_or_default().to_owned();
                    let Some(acceptor) = listener.upgrade().filter(|a| a.supports(&protocol)).cloned()
                    else {
                        let error = CommunicationError::Protocol(format!(
                            "upgrade {protocol} is not supported by the endpoint at {via}"
                        ));
                        return Err(reject(connection, FramingFault::UpgradeInvalid, error).await);
                    };
                    connection.write_all(&UPGRADE_RESPONSE).await?;
                    connection = upgrade(connection, acceptor.as_ref()).await?;
                    decoder.resume_after_upgrade()?;
                }
                ServerSessionState::Start => break,
                other => {
                    return Err(CommunicationError::Protocol(format!(
                        "unexpected {} during the preamble exchange",
                        other.name()
                    )));
                }
            }
        }

        let slot = match listener.reserve() {
            Ok(slot) => slot,
            Err(fault) => {
                let error = CommunicationError::ServerFault(fault.clone());
                return Err(reject(connection, fault, error).await);
            }
        };
        connection.write_all(&PREAMBLE_ACK).await?;
        debug!(
            "session accepted: via={via}, content_type={content_type}, remote_addr={:?}",
            connection.remote_addr()
        );

        let session = SessionInfo::new(via.as_str(), content_type).with_remote_addr(connection.remote_addr());
        let channel = ServerDuplexSessionChannel::from_parts(ChannelParts {
            connection,
            decoder,
            encoder: Arc::clone(listener.encoder()),
            buffers: listener.buffers().clone(),
            session,
            settings: *listener.settings(),
            report_faults: true,
        });
        Ok(AcceptedSession {
            listener,
            channel,
            slot,
        })
    }
}

async fn read_to_stop(
    connection: &mut Connection,
    decoder: &mut ServerSessionDecoder,
) -> Result<(), CommunicationError> {
    loop {
        let consumed = decoder.decode(connection.buffered())?;
        connection.consume(consumed);
        if decoder.state().is_stop() {
            return Ok(());
        }
        if connection.fill().await? == 0 {
            return Err(FramingError::PrematureEof {
                state: decoder.state().name(),
            }
            .into());
        }
    }
}

async fn upgrade(
    connection: Connection,
    acceptor: &dyn StreamUpgradeAcceptor,
) -> Result<Connection, CommunicationError> {
    let remote_addr = connection.remote_addr();
    let buffer_size = connection.buffer_size();
    let upgraded = acceptor
        .accept_upgrade(Box::new(connection.into_stream()))
        .await?;
    let connection = Connection::new(upgraded, buffer_size);
    Ok(match remote_addr {
        Some(addr) => connection.with_remote_addr(addr),
        None => connection,
    })
}

/// Reject after a decoding failure, sending the matching fault if the error
/// has one.
async fn reject_error(connection: Connection, error: CommunicationError) -> CommunicationError {
    match &error {
        CommunicationError::Framing(framing) => match framing.fault() {
            Some(fault) => reject(connection, fault, error).await,
            None => {
                debug!(
                    "preamble failed: error={error}, remote_addr={:?}",
                    connection.remote_addr()
                );
                connection.abort();
                error
            }
        },
        _ => {
            connection.abort();
            error
        }
    }
}

/// Write one fault record, then shut the connection down.
async fn reject(
    mut connection: Connection,
    fault: FramingFault,
    error: CommunicationError,
) -> CommunicationError {
    warn!(
        "rejecting session: fault={fault}, error={error}, remote_addr={:?}",
        connection.remote_addr()
    );
    match connection.write_all(&writer::fault(&fault)).await {
        Ok(()) => metrics::inc_framing_faults(&fault),
        Err(e) => debug!("failed to write fault: fault={fault}, error={e}"),
    }
    if let Err(e) = connection.shutdown().await {
        debug!("shutdown after fault failed: error={e}");
    }
    error
}
