//! Envelope pump over a framed connection.

use std::sync::Arc;

use log::{debug, warn};

use super::{SessionInfo, SharedWriter};
use crate::{
    buffer::{BufferManager, PooledBuffer},
    connection::ConnectionReader,
    encoding::MessageEncoder,
    error::CommunicationError,
    framing::{FramingFault, SessionDecoder, SessionProgress, writer},
    message::Message,
    metrics::{self, Direction},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Reading,
    Ended,
    Failed,
}

/// Reads one message per call from a session until the peer ends it.
///
/// All in-flight state (decoder position, partial envelope) lives in the
/// reader, so a `receive` abandoned by a timeout resumes where it stopped on
/// the next call.
pub struct SessionConnectionReader<D> {
    reader: ConnectionReader,
    decoder: D,
    encoder: Arc<dyn MessageEncoder>,
    buffers: BufferManager,
    envelope: Option<PooledBuffer>,
    fault_writer: Option<SharedWriter>,
    session: SessionInfo,
    pending: Option<Result<Option<Message>, CommunicationError>>,
    phase: Phase,
}

impl<D: SessionDecoder> SessionConnectionReader<D> {
    /// Create a reader for a session whose preamble `decoder` has completed.
    pub fn new(
        reader: ConnectionReader,
        decoder: D,
        encoder: Arc<dyn MessageEncoder>,
        buffers: BufferManager,
        session: SessionInfo,
    ) -> Self {
        Self {
            reader,
            decoder,
            encoder,
            buffers,
            envelope: None,
            fault_writer: None,
            session,
            pending: None,
            phase: Phase::Reading,
        }
    }

    /// Report oversized envelopes to the peer through `writer`.
    ///
    /// Servers set this; the fault is written at most once.
    #[must_use]
    pub fn with_fault_writer(mut self, writer: SharedWriter) -> Self {
        self.fault_writer = Some(writer);
        self
    }

    /// The session this reader serves.
    #[must_use]
    pub fn session(&self) -> &SessionInfo { &self.session }

    /// Returns true once the peer has ended the session.
    #[must_use]
    pub fn is_ended(&self) -> bool { self.phase == Phase::Ended }

    /// Returns true once a read has failed.
    #[must_use]
    pub fn is_failed(&self) -> bool { self.phase == Phase::Failed }

    /// Return the connection half once the session has ended.
    #[must_use]
    pub fn into_inner(self) -> ConnectionReader { self.reader }

    /// Receive the next message, or `None` once the session has ended.
    ///
    /// A result pended by [`wait_for_message`](Self::wait_for_message) is
    /// returned without reading.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for malformed framing or premature end of
    /// stream, [`CommunicationError::QuotaExceeded`] for an envelope larger
    /// than the buffer quota, and an encoding error for an undecodable
    /// envelope. After any error the reader stays failed.
    pub async fn receive(&mut self) -> Result<Option<Message>, CommunicationError> {
        match self.pending.take() {
            Some(result) => result,
            None => self.read_next().await,
        }
    }

    /// Read ahead and keep the outcome for the next
    /// [`receive`](Self::receive).
    pub async fn wait_for_message(&mut self) {
        if self.pending.is_none() {
            let result = self.read_next().await;
            self.pending = Some(result);
        }
    }

    async fn read_next(&mut self) -> Result<Option<Message>, CommunicationError> {
        match self.phase {
            Phase::Ended => return Ok(None),
            Phase::Failed => return Err(CommunicationError::ObjectFaulted("session reader")),
            Phase::Reading => {}
        }
        match self.pump().await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => {
                self.phase = Phase::Ended;
                Ok(None)
            }
            Err(error) => {
                self.phase = Phase::Failed;
                self.envelope = None;
                Err(error)
            }
        }
    }

    async fn pump(&mut self) -> Result<Option<Message>, CommunicationError> {
        loop {
            let before = self.decoder.progress();
            if !matches!(before, SessionProgress::EnvelopeStart(_))
                && self.reader.buffered().is_empty()
                && self.reader.fill().await? == 0
            {
                self.decoder.on_eof()?;
                debug!("session closed by peer: session_id={}", self.session.id);
                return Ok(None);
            }

            let buffered = self.reader.buffered();
            let consumed = self.decoder.decode(buffered)?;
            if before.is_envelope_payload()
                && let Some(envelope) = self.envelope.as_mut()
            {
                envelope.extend_from_slice(&buffered[..consumed]);
            }
            self.reader.consume(consumed);

            match self.decoder.progress() {
                SessionProgress::EnvelopeStart(size) => self.begin_envelope(size).await?,
                SessionProgress::EnvelopeEnd if before != SessionProgress::EnvelopeEnd => {
                    return self.finish_envelope().map(Some);
                }
                SessionProgress::End => return Ok(None),
                SessionProgress::Fault(fault) => {
                    return Err(CommunicationError::from_framing_fault(
                        fault,
                        &self.session.via,
                        &self.session.content_type,
                    ));
                }
                _ => {}
            }
        }
    }

    async fn begin_envelope(&mut self, size: usize) -> Result<(), CommunicationError> {
        match self.buffers.take(size) {
            Ok(buffer) => {
                self.envelope = Some(buffer);
                Ok(())
            }
            Err(error) => {
                warn!(
                    "envelope exceeds quota: size={size}, max={}, session_id={}",
                    self.buffers.max_buffer_size(),
                    self.session.id
                );
                self.send_fault(FramingFault::MaxMessageSizeExceeded).await;
                Err(error)
            }
        }
    }

    async fn send_fault(&mut self, fault: FramingFault) {
        let Some(shared) = self.fault_writer.take() else {
            return;
        };
        let mut slot = shared.lock().await;
        let Some(sink) = slot.as_mut() else {
            return;
        };
        if let Err(e) = sink.write_all(&writer::fault(&fault)).await {
            debug!("failed to write fault: fault={fault}, error={e}");
            return;
        }
        metrics::inc_framing_faults(&fault);
        if let Err(e) = sink.shutdown().await {
            debug!("failed to shut down after fault: error={e}");
        }
    }

    fn finish_envelope(&mut self) -> Result<Message, CommunicationError> {
        let envelope = self
            .envelope
            .take()
            .ok_or_else(|| CommunicationError::Protocol("envelope ended before it began".to_owned()))?;
        let mut message = self.encoder.read_message(&envelope)?;
        drop(envelope);

        let properties = message.properties_mut();
        properties.via = Some(self.session.via.clone());
        properties.content_type = Some(self.session.content_type.clone());
        properties.session_id = Some(self.session.id.clone());
        properties.remote_addr = self.session.remote_addr;
        metrics::inc_messages(Direction::Inbound);
        Ok(message)
    }
}

impl<D> std::fmt::Debug for SessionConnectionReader<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnectionReader")
            .field("session", &self.session)
            .field("phase", &self.phase)
            .field("pending", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
        sync::Mutex,
    };

    use super::*;
    use crate::{
        connection::Connection,
        encoding::TextMessageEncoder,
        framing::{
            DecoderLimits,
            FramingError,
            RecordType,
            ServerSessionDecoder,
            encode_varint,
            writer::{ClientPreamble, END, PREAMBLE_END},
        },
        message::MessageVersion,
    };

    const VIA: &str = "net.tcp://localhost/service";

    fn encoder() -> Arc<dyn MessageEncoder> { Arc::new(TextMessageEncoder::soap12()) }

    fn decoder_at_start() -> ServerSessionDecoder {
        let mut decoder = ServerSessionDecoder::new(DecoderLimits::default());
        let preamble = ClientPreamble::new(VIA, encoder().content_type())
            .encode()
            .expect("preamble");
        assert_eq!(decoder.decode(&preamble).expect("preamble decodes"), preamble.len());
        assert_eq!(decoder.decode(&PREAMBLE_END).expect("end decodes"), 1);
        decoder
    }

    fn envelope(action: &str, body: &str) -> bytes::Bytes {
        let message = Message::new(MessageVersion::default(), action, body);
        let bytes = encoder().write_message(&message).expect("encodes");
        writer::sized_envelope(&bytes).expect("frames")
    }

    struct Harness {
        reader: SessionConnectionReader<ServerSessionDecoder>,
        peer: DuplexStream,
        buffers: BufferManager,
    }

    fn harness(max_buffer_size: usize) -> Harness {
        let (local, peer) = duplex(4096);
        let (read, write) = Connection::new(local, 64).split();
        let buffers = BufferManager::new(4, max_buffer_size);
        let reader = SessionConnectionReader::new(
            read,
            decoder_at_start(),
            encoder(),
            buffers.clone(),
            SessionInfo::new(VIA, encoder().content_type()),
        )
        .with_fault_writer(Arc::new(Mutex::new(Some(write))));
        Harness {
            reader,
            peer,
            buffers,
        }
    }

    #[tokio::test]
    async fn messages_arrive_in_order_then_the_session_ends() {
        let mut h = harness(65_536);
        h.peer.write_all(&envelope("urn:a", "first")).await.expect("write");
        h.peer.write_all(&envelope("urn:b", "second")).await.expect("write");
        h.peer.write_all(&END).await.expect("write");

        let mut first = h.reader.receive().await.expect("ok").expect("message");
        assert_eq!(first.headers().action(), Some("urn:a"));
        assert_eq!(first.read_body::<String>().expect("body"), "first");
        assert_eq!(first.properties().via.as_deref(), Some(VIA));

        let second = h.reader.receive().await.expect("ok").expect("message");
        assert_eq!(second.headers().action(), Some("urn:b"));
        assert!(h.reader.receive().await.expect("ok").is_none());
        assert!(h.reader.receive().await.expect("still ended").is_none());
        assert!(h.reader.is_ended());
        assert_eq!(h.buffers.outstanding(), 0);
    }

    #[tokio::test]
    async fn oversized_envelope_sends_one_fault_and_fails() {
        let mut h = harness(16);
        let mut record = BytesMut::new();
        record.extend_from_slice(&[RecordType::SizedEnvelope.as_u8()]);
        encode_varint(17, &mut record).expect("varint");
        h.peer.write_all(&record).await.expect("write");

        let err = h.reader.receive().await.expect_err("over quota");
        assert!(matches!(err, CommunicationError::QuotaExceeded { size: 17, max: 16 }));
        let again = h.reader.receive().await.expect_err("reader failed");
        assert!(matches!(again, CommunicationError::ObjectFaulted(_)));

        let mut written = Vec::new();
        h.peer.read_to_end(&mut written).await.expect("read fault");
        assert_eq!(written, writer::fault(&FramingFault::MaxMessageSizeExceeded).to_vec());
        assert_eq!(h.buffers.outstanding(), 0);
    }

    #[rstest]
    #[case::mid_envelope(true)]
    #[case::mid_size(false)]
    #[tokio::test]
    async fn eof_inside_a_record_is_premature(#[case] mid_envelope: bool) {
        let mut h = harness(65_536);
        let full = envelope("urn:a", "cut short");
        let cut = if mid_envelope { full.len() - 3 } else { 1 };
        h.peer.write_all(&full[..cut]).await.expect("write");
        drop(h.peer);

        let err = h.reader.receive().await.expect_err("premature eof");
        assert!(err.is_protocol());
        assert!(matches!(
            err,
            CommunicationError::Framing(FramingError::PrematureEof { .. })
        ));
        assert_eq!(h.buffers.outstanding(), 0);
    }

    #[tokio::test]
    async fn eof_after_a_complete_envelope_ends_cleanly() {
        let mut h = harness(65_536);
        h.peer.write_all(&envelope("urn:a", "only")).await.expect("write");
        drop(h.peer);

        assert!(h.reader.receive().await.expect("ok").is_some());
        assert!(h.reader.receive().await.expect("clean end").is_none());
    }

    #[tokio::test]
    async fn waited_message_is_returned_by_the_next_receive() {
        let mut h = harness(65_536);
        h.peer.write_all(&envelope("urn:peek", "x")).await.expect("write");
        h.reader.wait_for_message().await;
        h.reader.wait_for_message().await;
        drop(h.peer);

        let message = h.reader.receive().await.expect("ok").expect("pended message");
        assert_eq!(message.headers().action(), Some("urn:peek"));
        assert!(h.reader.receive().await.expect("clean end").is_none());
    }

    #[tokio::test]
    async fn undecodable_envelope_returns_its_buffer() {
        let mut h = harness(65_536);
        let framed = writer::sized_envelope(b"<not-soap/>").expect("frames");
        h.peer.write_all(&framed).await.expect("write");

        let err = h.reader.receive().await.expect_err("bad envelope");
        assert!(matches!(err, CommunicationError::Encoding(_)));
        assert_eq!(h.buffers.outstanding(), 0);
    }
}
