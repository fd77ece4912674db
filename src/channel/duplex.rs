//! The duplex session channel shared by server and client roles.

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{CommunicationObject, CommunicationState, SessionChannel};
use crate::{
    buffer::BufferManager,
    config::{Timeouts, TransportSettings},
    connection::Connection,
    encoding::MessageEncoder,
    error::CommunicationError,
    framing::{
        ClientDuplexDecoder,
        ServerSessionDecoder,
        SessionDecoder,
        writer::{self, END},
    },
    message::Message,
    metrics::{self, Direction},
    session::{SessionConnectionReader, SessionInfo, SharedWriter, SynchronizedMessageSource},
    timeout::TimeoutHelper,
};

const CHANNEL: &str = "duplex session channel";

/// Receives the connection of a gracefully closed session so it can carry
/// another one.
pub type ConnectionReuse = Box<dyn FnOnce(Connection) + Send>;

/// Channel accepted by a server after a successful preamble.
pub type ServerDuplexSessionChannel = DuplexSessionChannel<ServerSessionDecoder>;

/// Channel opened by a client.
pub type ClientDuplexSessionChannel = DuplexSessionChannel<ClientDuplexDecoder>;

/// Result of [`DuplexSessionChannel::try_receive`].
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A message arrived.
    Message(Message),
    /// The peer closed its output session.
    Ended,
    /// Nothing arrived within the timeout.
    TimedOut,
}

/// Everything a channel is built from once the preamble is done.
pub(crate) struct ChannelParts<D> {
    pub connection: Connection,
    pub decoder: D,
    pub encoder: Arc<dyn MessageEncoder>,
    pub buffers: BufferManager,
    pub session: SessionInfo,
    pub settings: TransportSettings,
    /// Tell the peer about oversized envelopes with a framing fault.
    pub report_faults: bool,
}

/// Full-duplex message exchange over one framed connection.
pub struct DuplexSessionChannel<D> {
    object: CommunicationObject,
    source: SynchronizedMessageSource<D>,
    writer: SharedWriter,
    encoder: Arc<dyn MessageEncoder>,
    session: SessionInfo,
    timeouts: Timeouts,
    max_buffer_size: usize,
    output_closed: AtomicBool,
    aborted: CancellationToken,
    reuse: Mutex<Option<ConnectionReuse>>,
}

impl<D: SessionDecoder> DuplexSessionChannel<D> {
    pub(crate) fn from_parts(parts: ChannelParts<D>) -> Self {
        let ChannelParts {
            connection,
            decoder,
            encoder,
            buffers,
            session,
            settings,
            report_faults,
        } = parts;
        let (read, write) = connection.split();
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Some(write)));
        let mut reader =
            SessionConnectionReader::new(read, decoder, Arc::clone(&encoder), buffers, session.clone());
        if report_faults {
            reader = reader.with_fault_writer(Arc::clone(&writer));
        }
        Self {
            object: CommunicationObject::opened(CHANNEL),
            source: SynchronizedMessageSource::new(reader),
            writer,
            encoder,
            session,
            timeouts: settings.timeouts,
            max_buffer_size: settings.max_buffer_size,
            output_closed: AtomicBool::new(false),
            aborted: CancellationToken::new(),
            reuse: Mutex::new(None),
        }
    }

    /// Hand the connection to `reuse` after a graceful close instead of
    /// shutting it down.
    #[must_use]
    pub fn with_connection_reuse(self, reuse: ConnectionReuse) -> Self {
        *self.reuse.lock() = Some(reuse);
        self
    }

    /// Identity of the session.
    #[must_use]
    pub fn session(&self) -> &SessionInfo { &self.session }

    /// Unique identifier of the session.
    #[must_use]
    pub fn session_id(&self) -> &str { &self.session.id }

    /// Via the session was opened against.
    #[must_use]
    pub fn via(&self) -> &str { &self.session.via }

    /// Address of the peer, when known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.session.remote_addr }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CommunicationState { self.object.state() }

    /// Operation budgets.
    #[must_use]
    pub fn timeouts(&self) -> Timeouts { self.timeouts }

    /// Encoder negotiated for the session.
    #[must_use]
    pub fn encoder(&self) -> &Arc<dyn MessageEncoder> { &self.encoder }

    /// Returns true once `End` has been written.
    #[must_use]
    pub fn is_output_closed(&self) -> bool { self.output_closed.load(Ordering::Acquire) }

    /// Encode `message` and write it as one sized-envelope record.
    ///
    /// Concurrent sends are serialized; each record reaches the wire
    /// contiguously.
    ///
    /// # Errors
    ///
    /// - [`CommunicationError::Timeout`] naming `"send"` if the send lock or
    ///   the write does not complete in time.
    /// - [`CommunicationError::QuotaExceeded`] if the encoded message is
    ///   larger than the buffer quota. Nothing is written and the channel
    ///   stays usable.
    /// - A state error unless the channel is open with its output session
    ///   still open.
    ///
    /// A failed or timed-out write faults the channel.
    pub async fn send(&self, message: &Message, timeout: Duration) -> Result<(), CommunicationError> {
        self.object.ensure_opened()?;
        if self.is_output_closed() {
            return Err(CommunicationError::InvalidState {
                object: "output session",
                state: CommunicationState::Closed,
            });
        }
        let payload = self.encoder.write_message(message)?;
        if payload.len() > self.max_buffer_size {
            return Err(CommunicationError::QuotaExceeded {
                size: payload.len(),
                max: self.max_buffer_size,
            });
        }
        let record = writer::sized_envelope(&payload)?;
        self.write_record("send", &record, TimeoutHelper::new(timeout))
            .await?;
        metrics::inc_messages(Direction::Outbound);
        Ok(())
    }

    /// Receive the next message, or `None` once the peer has closed its
    /// output session.
    ///
    /// # Errors
    ///
    /// Timeouts leave the channel usable. Any other failure faults it.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>, CommunicationError> {
        self.ensure_receivable()?;
        let result = self.unless_aborted(self.source.receive(timeout)).await;
        self.observe(result).await
    }

    /// Like [`receive`](Self::receive) but reports a timeout as
    /// [`ReceiveOutcome::TimedOut`].
    ///
    /// # Errors
    ///
    /// Any failure other than a timeout.
    pub async fn try_receive(&self, timeout: Duration) -> Result<ReceiveOutcome, CommunicationError> {
        match self.receive(timeout).await {
            Ok(Some(message)) => Ok(ReceiveOutcome::Message(message)),
            Ok(None) => Ok(ReceiveOutcome::Ended),
            Err(error) if error.is_timeout() => Ok(ReceiveOutcome::TimedOut),
            Err(error) => Err(error),
        }
    }

    /// Wait up to `timeout` for the next receive to be ready.
    ///
    /// # Errors
    ///
    /// [`CommunicationError::Timeout`] naming `"wait_for_message"` if
    /// another receive holds the session past the deadline.
    pub async fn wait_for_message(&self, timeout: Duration) -> Result<bool, CommunicationError> {
        self.ensure_receivable()?;
        let result = self
            .unless_aborted(self.source.wait_for_message(timeout))
            .await;
        self.observe(result).await
    }

    /// Write the `End` record. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// A failed write faults the channel and is returned.
    pub async fn close_output_session(&self, timeout: Duration) -> Result<(), CommunicationError> {
        if self.output_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.write_record("close_output_session", &END, TimeoutHelper::new(timeout))
            .await
    }

    /// Close the output session, drain the input session, and release the
    /// connection.
    ///
    /// # Errors
    ///
    /// [`CommunicationError::Protocol`] if a message arrives while draining,
    /// [`CommunicationError::Timeout`] naming `"close"` if the peer does not
    /// end its session in time. The channel is aborted in both cases.
    pub async fn close(&self, timeout: Duration) -> Result<(), CommunicationError> {
        if !self.object.begin_close()? {
            return Ok(());
        }
        match self.close_gracefully(TimeoutHelper::new(timeout)).await {
            Ok(()) => {
                self.object.complete_close();
                debug!("channel closed: session_id={}", self.session.id);
                Ok(())
            }
            Err(error) => {
                warn!(
                    "channel close failed, aborting: error={error}, session_id={}",
                    self.session.id
                );
                self.abort().await;
                Err(error)
            }
        }
    }

    /// Drop the connection without any handshake. Pending sends and
    /// receives fail with [`CommunicationError::Aborted`].
    pub async fn abort(&self) {
        if self.object.abort() {
            debug!("channel aborted: session_id={}", self.session.id);
        }
        self.return_connection_if_necessary(true).await;
    }

    async fn close_gracefully(&self, helper: TimeoutHelper) -> Result<(), CommunicationError> {
        if !self.output_closed.swap(true, Ordering::AcqRel) {
            self.write_record("close", &END, helper).await?;
        }
        let drained = self
            .unless_aborted(self.source.receive(helper.remaining()))
            .await
            .map_err(|e| if e.is_timeout() { helper.elapsed("close") } else { e })?;
        if drained.is_some() {
            return Err(CommunicationError::Protocol(
                "unexpected message while closing".to_owned(),
            ));
        }
        self.return_connection_if_necessary(false).await;
        Ok(())
    }

    fn ensure_receivable(&self) -> Result<(), CommunicationError> {
        match self.object.state() {
            CommunicationState::Opened | CommunicationState::Closing => Ok(()),
            _ => self.object.ensure_opened(),
        }
    }

    async fn unless_aborted<T>(
        &self,
        fut: impl Future<Output = Result<T, CommunicationError>>,
    ) -> Result<T, CommunicationError> {
        tokio::select! {
            biased;
            () = self.aborted.cancelled() => Err(CommunicationError::Aborted(CHANNEL)),
            result = fut => result,
        }
    }

    async fn observe<T>(&self, result: Result<T, CommunicationError>) -> Result<T, CommunicationError> {
        if let Err(error) = &result
            && !error.is_timeout()
            && !matches!(error, CommunicationError::Aborted(_))
        {
            self.fault(error).await;
        }
        result
    }

    async fn write_record(
        &self,
        operation: &'static str,
        record: &[u8],
        helper: TimeoutHelper,
    ) -> Result<(), CommunicationError> {
        let mut slot = self
            .unless_aborted(helper.run(operation, self.writer.lock()))
            .await?;
        let Some(sink) = slot.as_mut() else {
            return Err(CommunicationError::Aborted(CHANNEL));
        };
        let written = self
            .unless_aborted(async {
                helper
                    .run(operation, sink.write_all(record))
                    .await?
                    .map_err(CommunicationError::from)
            })
            .await;
        drop(slot);
        if let Err(error) = written {
            if !matches!(error, CommunicationError::Aborted(_)) {
                self.fault(&error).await;
            }
            return Err(error);
        }
        Ok(())
    }

    async fn fault(&self, error: &CommunicationError) {
        if self.object.fault() {
            warn!("channel faulted: error={error}, session_id={}", self.session.id);
            metrics::inc_errors();
            self.return_connection_if_necessary(true).await;
        }
    }

    /// Release the connection. An abort drops both halves; a graceful
    /// return hands an ended session's connection to the reuse hook, or
    /// shuts the write side down.
    async fn return_connection_if_necessary(&self, abort: bool) {
        if abort {
            self.aborted.cancel();
        }
        let writer = self.writer.lock().await.take();
        let reader = self.source.take().await;
        let reuse = self.reuse.lock().take();
        let (Some(mut writer), Some(reader)) = (writer, reader) else {
            return;
        };
        if abort {
            return;
        }
        if let Some(reuse) = reuse
            && reader.is_ended()
        {
            match reader.into_inner().reunite(writer) {
                Some(connection) => reuse(connection),
                None => warn!("connection halves did not match: session_id={}", self.session.id),
            }
            return;
        }
        if let Err(e) = writer.shutdown().await {
            debug!("shutdown after close failed: error={e}, session_id={}", self.session.id);
        }
    }
}

impl<D> std::fmt::Debug for DuplexSessionChannel<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexSessionChannel")
            .field("session", &self.session)
            .field("state", &self.object.state())
            .field("output_closed", &self.output_closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<D: SessionDecoder> SessionChannel for DuplexSessionChannel<D> {
    fn session(&self) -> &SessionInfo { DuplexSessionChannel::session(self) }

    fn session_id(&self) -> &str { DuplexSessionChannel::session_id(self) }

    fn via(&self) -> &str { DuplexSessionChannel::via(self) }

    fn remote_addr(&self) -> Option<SocketAddr> { DuplexSessionChannel::remote_addr(self) }

    fn state(&self) -> CommunicationState { DuplexSessionChannel::state(self) }

    fn timeouts(&self) -> Timeouts { DuplexSessionChannel::timeouts(self) }

    async fn send(&self, message: &Message, timeout: Duration) -> Result<(), CommunicationError> {
        DuplexSessionChannel::send(self, message, timeout).await
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Message>, CommunicationError> {
        DuplexSessionChannel::receive(self, timeout).await
    }

    async fn close(&self, timeout: Duration) -> Result<(), CommunicationError> {
        DuplexSessionChannel::close(self, timeout).await
    }

    async fn abort(&self) { DuplexSessionChannel::abort(self).await; }
}

#[cfg(test)]
mod tests;
