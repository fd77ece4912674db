//! Opening a duplex session from the client side.

use std::sync::Arc;

use log::debug;

use super::{ChannelParts, ClientDuplexSessionChannel};
use crate::{
    buffer::BufferManager,
    config::TransportSettings,
    connection::Connection,
    encoding::MessageEncoder,
    error::CommunicationError,
    framing::{
        ClientDuplexDecoder,
        ClientDuplexState,
        FramingError,
        writer::{self, ClientPreamble, PREAMBLE_END},
    },
    session::SessionInfo,
    timeout::TimeoutHelper,
    transport::StreamUpgradeInitiator,
};

/// What a client needs to open a session over a connection.
#[derive(Clone)]
pub struct ClientSessionOptions {
    /// Address announced in the preamble.
    pub via: String,
    /// Encoder for every envelope in the session.
    pub encoder: Arc<dyn MessageEncoder>,
    /// Optional stream upgrade requested before `PreambleEnd`.
    pub upgrade: Option<Arc<dyn StreamUpgradeInitiator>>,
    /// Quotas and timeouts.
    pub settings: TransportSettings,
    /// Pool for received envelopes.
    pub buffers: BufferManager,
}

impl ClientSessionOptions {
    /// Options for `via` using `encoder` and default settings.
    pub fn new(via: impl Into<String>, encoder: Arc<dyn MessageEncoder>) -> Self {
        let settings = TransportSettings::default();
        Self {
            via: via.into(),
            encoder,
            upgrade: None,
            buffers: BufferManager::new(crate::buffer::DEFAULT_POOL_SIZE, settings.max_buffer_size),
            settings,
        }
    }

    /// Request `initiator`'s upgrade during the preamble.
    #[must_use]
    pub fn with_upgrade(mut self, initiator: Arc<dyn StreamUpgradeInitiator>) -> Self {
        self.upgrade = Some(initiator);
        self
    }

    /// Replace the transport settings. The envelope pool follows the new
    /// buffer quota.
    #[must_use]
    pub fn with_settings(mut self, settings: TransportSettings) -> Self {
        let settings = settings.normalized();
        self.buffers = BufferManager::new(crate::buffer::DEFAULT_POOL_SIZE, settings.max_buffer_size);
        self.settings = settings;
        self
    }
}

impl std::fmt::Debug for ClientSessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSessionOptions")
            .field("via", &self.via)
            .field("content_type", &self.encoder.content_type())
            .field("upgrade", &self.upgrade.as_ref().map(|u| u.protocol().to_owned()))
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ClientDuplexSessionChannel {
    /// Run the client preamble over `connection` and return an open
    /// channel.
    ///
    /// The whole exchange, including any upgrade, runs under the open
    /// timeout.
    ///
    /// # Errors
    ///
    /// - [`CommunicationError::Timeout`] naming `"open"`.
    /// - The translated fault if the server rejects the session, for
    ///   example a protocol error naming the content type when the server
    ///   does not support the encoder.
    /// - A framing error if the server closes the connection early.
    pub async fn open(
        connection: Connection,
        options: ClientSessionOptions,
    ) -> Result<Self, CommunicationError> {
        let helper = TimeoutHelper::new(options.settings.timeouts.open);
        let remote_addr = connection.remote_addr();
        let (connection, decoder) = helper.run("open", handshake(connection, &options)).await??;
        debug!(
            "client session opened: via={}, content_type={}, remote_addr={remote_addr:?}",
            options.via,
            options.encoder.content_type()
        );
        let session = SessionInfo::new(options.via.clone(), options.encoder.content_type())
            .with_remote_addr(remote_addr);
        Ok(Self::from_parts(ChannelParts {
            connection,
            decoder,
            encoder: options.encoder,
            buffers: options.buffers,
            session,
            settings: options.settings,
            report_faults: false,
        }))
    }
}

async fn handshake(
    mut connection: Connection,
    options: &ClientSessionOptions,
) -> Result<(Connection, ClientDuplexDecoder), CommunicationError> {
    let preamble = ClientPreamble::new(options.via.as_str(), options.encoder.content_type()).encode()?;
    connection.write_all(&preamble).await?;

    let mut decoder = match &options.upgrade {
        Some(initiator) => {
            connection
                .write_all(&writer::upgrade_request(initiator.protocol())?)
                .await?;
            let mut decoder = ClientDuplexDecoder::awaiting_upgrade();
            read_to_stop(&mut connection, &mut decoder).await?;
            expect_state(&decoder, options, |s| matches!(s, ClientDuplexState::UpgradeResponse))?;

            let remote_addr = connection.remote_addr();
            let buffer_size = connection.buffer_size();
            let upgraded = initiator
                .initiate_upgrade(Box::new(connection.into_stream()))
                .await?;
            connection = Connection::new(upgraded, buffer_size);
            if let Some(addr) = remote_addr {
                connection = connection.with_remote_addr(addr);
            }
            decoder.resume_after_upgrade()?;
            decoder
        }
        None => ClientDuplexDecoder::awaiting_ack(),
    };

    connection.write_all(&PREAMBLE_END).await?;
    read_to_stop(&mut connection, &mut decoder).await?;
    expect_state(&decoder, options, |s| matches!(s, ClientDuplexState::Start))?;
    Ok((connection, decoder))
}

async fn read_to_stop(
    connection: &mut Connection,
    decoder: &mut ClientDuplexDecoder,
) -> Result<(), CommunicationError> {
    loop {
        if !connection.buffered().is_empty() {
            let consumed = decoder.decode(connection.buffered())?;
            connection.consume(consumed);
            if decoder.state().is_stop() {
                return Ok(());
            }
        }
        if connection.fill().await? == 0 {
            return Err(FramingError::PrematureEof {
                state: decoder.state().name(),
            }
            .into());
        }
    }
}

fn expect_state(
    decoder: &ClientDuplexDecoder,
    options: &ClientSessionOptions,
    expected: impl Fn(&ClientDuplexState) -> bool,
) -> Result<(), CommunicationError> {
    if let Some(fault) = decoder.fault() {
        return Err(CommunicationError::from_framing_fault(
            fault.clone(),
            &options.via,
            options.encoder.content_type(),
        ));
    }
    if expected(decoder.state()) {
        Ok(())
    } else {
        Err(CommunicationError::Protocol(format!(
            "unexpected {} during the preamble exchange",
            decoder.state().name()
        )))
    }
}
