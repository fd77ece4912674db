//! Server-side decoder for duplex sessions.

use std::mem;

use url::Url;

use super::{
    Decoded,
    DecoderLimits,
    FramingError,
    FramingMode,
    FramingVersion,
    KnownEncoding,
    RecordType,
    SessionDecoder,
    SessionProgress,
    Transition,
    VarintDecoder,
    expect_record,
    string::{FramedField, StringDecoder},
};

/// States of the server session decoder.
///
/// `PreUpgradeStart`, `UpgradeRequest`, `Start`, `EnvelopeStart`,
/// `EnvelopeEnd`, and `End` are stopping states: [`ServerSessionDecoder::decode`]
/// returns as soon as it reaches one so the caller can act on it.
#[derive(Debug)]
pub enum ServerSessionState {
    /// Awaiting the `Version` record.
    ReadingVersionRecord,
    /// Awaiting the major version byte.
    ReadingMajorVersion,
    /// Awaiting the minor version byte.
    ReadingMinorVersion {
        /// Major version already read.
        major: u8,
    },
    /// Awaiting the `Mode` record.
    ReadingModeRecord,
    /// Awaiting the mode byte.
    ReadingModeValue,
    /// Awaiting the `Via` record.
    ReadingViaRecord,
    /// Reading the via string.
    ReadingViaString(StringDecoder),
    /// Awaiting a known or extensible encoding record.
    ReadingContentTypeRecord,
    /// Reading an extensible content type.
    ReadingContentTypeString(StringDecoder),
    /// Awaiting the known encoding byte.
    ReadingContentTypeByte,
    /// Via and content type are known; the caller validates them.
    PreUpgradeStart,
    /// Awaiting an upgrade request or the end of the preamble.
    ReadingUpgradeRecord,
    /// Reading the requested upgrade protocol.
    ReadingUpgradeString(StringDecoder),
    /// The client asked for an upgrade; the caller must perform it.
    UpgradeRequest,
    /// Awaiting `PreambleEnd`.
    ReadingPreambleEndRecord,
    /// The preamble is complete.
    Start,
    /// Awaiting `SizedEnvelope` or `End`.
    ReadingEnvelopeRecord,
    /// Reading an envelope size prefix.
    ReadingEnvelopeSize(VarintDecoder),
    /// An envelope of `size` bytes follows.
    EnvelopeStart {
        /// Declared payload length.
        size: usize,
    },
    /// Consuming envelope payload.
    ReadingEnvelopeBytes {
        /// Payload bytes still expected.
        remaining: usize,
    },
    /// The current envelope is complete.
    EnvelopeEnd,
    /// The client ended the session.
    End,
    /// A previous call failed; the decoder accepts no further input.
    Failed,
}

impl ServerSessionState {
    /// Returns true for states at which `decode` returns to its caller.
    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(
            self,
            Self::PreUpgradeStart
                | Self::UpgradeRequest
                | Self::Start
                | Self::EnvelopeStart { .. }
                | Self::EnvelopeEnd
                | Self::End
        )
    }

    /// Name of the state for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadingVersionRecord => "ReadingVersionRecord",
            Self::ReadingMajorVersion => "ReadingMajorVersion",
            Self::ReadingMinorVersion { .. } => "ReadingMinorVersion",
            Self::ReadingModeRecord => "ReadingModeRecord",
            Self::ReadingModeValue => "ReadingModeValue",
            Self::ReadingViaRecord => "ReadingViaRecord",
            Self::ReadingViaString(_) => "ReadingViaString",
            Self::ReadingContentTypeRecord => "ReadingContentTypeRecord",
            Self::ReadingContentTypeString(_) => "ReadingContentTypeString",
            Self::ReadingContentTypeByte => "ReadingContentTypeByte",
            Self::PreUpgradeStart => "PreUpgradeStart",
            Self::ReadingUpgradeRecord => "ReadingUpgradeRecord",
            Self::ReadingUpgradeString(_) => "ReadingUpgradeString",
            Self::UpgradeRequest => "UpgradeRequest",
            Self::ReadingPreambleEndRecord => "ReadingPreambleEndRecord",
            Self::Start => "Start",
            Self::ReadingEnvelopeRecord => "ReadingEnvelopeRecord",
            Self::ReadingEnvelopeSize(_) => "ReadingEnvelopeSize",
            Self::EnvelopeStart { .. } => "EnvelopeStart",
            Self::ReadingEnvelopeBytes { .. } => "ReadingEnvelopeBytes",
            Self::EnvelopeEnd => "EnvelopeEnd",
            Self::End => "End",
            Self::Failed => "Failed",
        }
    }
}

/// Advance `state` over `bytes` by one step.
///
/// Reading states are only entered with at least one byte available.
fn step(
    state: ServerSessionState,
    bytes: &[u8],
    limits: &DecoderLimits,
) -> Result<Transition<ServerSessionState>, FramingError> {
    use ServerSessionState as S;

    let first = bytes.first().copied().unwrap_or_default();
    Ok(match state {
        S::ReadingVersionRecord => {
            expect_record(first, RecordType::Version, "awaiting the version record")?;
            Transition::to(S::ReadingMajorVersion, 1)
        }
        S::ReadingMajorVersion => {
            if first != FramingVersion::V1_0.major {
                return Err(FramingError::UnsupportedVersion(first));
            }
            Transition::to(S::ReadingMinorVersion { major: first }, 1)
        }
        S::ReadingMinorVersion { major } => Transition::with(
            S::ReadingModeRecord,
            1,
            Decoded::Version(FramingVersion {
                major,
                minor: first,
            }),
        ),
        S::ReadingModeRecord => {
            expect_record(first, RecordType::Mode, "awaiting the mode record")?;
            Transition::to(S::ReadingModeValue, 1)
        }
        S::ReadingModeValue => {
            let mode = FramingMode::try_from(first)?;
            Transition::with(S::ReadingViaRecord, 1, Decoded::Mode(mode))
        }
        S::ReadingViaRecord => {
            expect_record(first, RecordType::Via, "awaiting the via record")?;
            Transition::to(
                S::ReadingViaString(StringDecoder::new(FramedField::Via, limits.max_via_size)),
                1,
            )
        }
        S::ReadingViaString(mut decoder) => {
            let consumed = decoder.decode(bytes)?;
            match decoder.take_value() {
                Some(via) => {
                    let uri = Url::parse(&via).map_err(|_| FramingError::InvalidVia(via))?;
                    Transition::with(S::ReadingContentTypeRecord, consumed, Decoded::Via(uri))
                }
                None => Transition::to(S::ReadingViaString(decoder), consumed),
            }
        }
        S::ReadingContentTypeRecord => match RecordType::try_from(first) {
            Ok(RecordType::KnownEncoding) => Transition::to(S::ReadingContentTypeByte, 1),
            Ok(RecordType::ExtensibleEncoding) => Transition::to(
                S::ReadingContentTypeString(StringDecoder::new(
                    FramedField::ContentType,
                    limits.max_content_type_size,
                )),
                1,
            ),
            _ => {
                return Err(FramingError::UnexpectedRecord {
                    found: first,
                    expected: "awaiting an encoding record",
                });
            }
        },
        S::ReadingContentTypeByte => {
            let known = KnownEncoding::try_from(first)?;
            Transition::with(
                S::PreUpgradeStart,
                1,
                Decoded::ContentType(known.content_type().to_owned()),
            )
        }
        S::ReadingContentTypeString(mut decoder) => {
            let consumed = decoder.decode(bytes)?;
            match decoder.take_value() {
                Some(content_type) => Transition::with(
                    S::PreUpgradeStart,
                    consumed,
                    Decoded::ContentType(content_type),
                ),
                None => Transition::to(S::ReadingContentTypeString(decoder), consumed),
            }
        }
        S::PreUpgradeStart => Transition::to(S::ReadingUpgradeRecord, 0),
        S::ReadingUpgradeRecord => {
            if first == RecordType::UpgradeRequest.as_u8() {
                Transition::to(
                    S::ReadingUpgradeString(StringDecoder::new(
                        FramedField::UpgradeProtocol,
                        limits.max_content_type_size,
                    )),
                    1,
                )
            } else {
                Transition::to(S::ReadingPreambleEndRecord, 0)
            }
        }
        S::ReadingUpgradeString(mut decoder) => {
            let consumed = decoder.decode(bytes)?;
            match decoder.take_value() {
                Some(protocol) => {
                    Transition::with(S::UpgradeRequest, consumed, Decoded::Upgrade(protocol))
                }
                None => Transition::to(S::ReadingUpgradeString(decoder), consumed),
            }
        }
        S::UpgradeRequest => {
            if bytes.is_empty() {
                Transition::to(S::UpgradeRequest, 0)
            } else {
                return Err(FramingError::DataInState("UpgradeRequest"));
            }
        }
        S::ReadingPreambleEndRecord => {
            expect_record(first, RecordType::PreambleEnd, "awaiting the end of the preamble")?;
            Transition::to(S::Start, 1)
        }
        S::Start | S::EnvelopeEnd => Transition::to(S::ReadingEnvelopeRecord, 0),
        S::ReadingEnvelopeRecord => match RecordType::try_from(first) {
            Ok(RecordType::SizedEnvelope) => {
                Transition::to(S::ReadingEnvelopeSize(VarintDecoder::new()), 1)
            }
            Ok(RecordType::End) => Transition::to(S::End, 1),
            _ => {
                return Err(FramingError::UnexpectedRecord {
                    found: first,
                    expected: "awaiting an envelope or end record",
                });
            }
        },
        S::ReadingEnvelopeSize(mut decoder) => {
            let consumed = decoder.decode(bytes)?;
            match decoder.value() {
                Some(size) => Transition::to(S::EnvelopeStart { size }, consumed),
                None => Transition::to(S::ReadingEnvelopeSize(decoder), consumed),
            }
        }
        S::EnvelopeStart { size: 0 } => Transition::to(S::EnvelopeEnd, 0),
        S::EnvelopeStart { size } => Transition::to(S::ReadingEnvelopeBytes { remaining: size }, 0),
        S::ReadingEnvelopeBytes { remaining } => {
            let take = remaining.min(bytes.len());
            if take == remaining {
                Transition::to(S::EnvelopeEnd, take)
            } else {
                Transition::to(
                    S::ReadingEnvelopeBytes {
                        remaining: remaining - take,
                    },
                    take,
                )
            }
        }
        S::End => {
            if bytes.is_empty() {
                Transition::to(S::End, 0)
            } else {
                return Err(FramingError::DataInState("End"));
            }
        }
        S::Failed => return Err(FramingError::InvalidState("Failed")),
    })
}

/// Incremental decoder for the server side of a duplex session.
///
/// The decoder reads the preamble, pauses for validation and upgrades, and
/// then delimits envelopes. It never buffers envelope payload; callers copy
/// the bytes consumed while [`progress`](SessionDecoder::progress) reports an
/// envelope in flight.
#[derive(Debug)]
pub struct ServerSessionDecoder {
    state: ServerSessionState,
    limits: DecoderLimits,
    version: Option<FramingVersion>,
    mode: Option<FramingMode>,
    via: Option<Url>,
    content_type: Option<String>,
    upgrade: Option<String>,
}

impl ServerSessionDecoder {
    /// Create a decoder awaiting the version record.
    #[must_use]
    pub fn new(limits: DecoderLimits) -> Self {
        Self {
            state: ServerSessionState::ReadingVersionRecord,
            limits,
            version: None,
            mode: None,
            via: None,
            content_type: None,
            upgrade: None,
        }
    }

    /// Consume as many bytes as the current phase allows.
    ///
    /// Returns the number of bytes consumed. Decoding stops early at any
    /// stopping state; call again with the unconsumed remainder to continue.
    ///
    /// # Errors
    ///
    /// Returns a [`FramingError`] on any protocol violation. The decoder then
    /// moves to [`ServerSessionState::Failed`] and rejects further input.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, FramingError> {
        let mut consumed = 0;
        loop {
            let rest = &bytes[consumed..];
            if rest.is_empty() && !self.state.is_stop() {
                break;
            }
            let state = mem::replace(&mut self.state, ServerSessionState::Failed);
            let transition = step(state, rest, &self.limits)?;
            consumed += transition.consumed;
            if let Some(decoded) = transition.decoded {
                self.record(decoded);
            }
            self.state = transition.next;
            if self.state.is_stop() {
                break;
            }
        }
        Ok(consumed)
    }

    fn record(&mut self, decoded: Decoded) {
        match decoded {
            Decoded::Version(version) => self.version = Some(version),
            Decoded::Mode(mode) => self.mode = Some(mode),
            Decoded::Via(via) => self.via = Some(via),
            Decoded::ContentType(content_type) => self.content_type = Some(content_type),
            Decoded::Upgrade(protocol) => self.upgrade = Some(protocol),
        }
    }

    /// Resume decoding after the caller has performed a requested upgrade.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::InvalidState`] unless the decoder is paused at
    /// [`ServerSessionState::UpgradeRequest`].
    pub fn resume_after_upgrade(&mut self) -> Result<(), FramingError> {
        if !matches!(self.state, ServerSessionState::UpgradeRequest) {
            return Err(FramingError::InvalidState(self.state.name()));
        }
        self.upgrade = None;
        self.state = ServerSessionState::PreUpgradeStart;
        Ok(())
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &ServerSessionState { &self.state }

    /// Version announced by the client.
    #[must_use]
    pub fn version(&self) -> Option<FramingVersion> { self.version }

    /// Mode announced by the client.
    #[must_use]
    pub fn mode(&self) -> Option<FramingMode> { self.mode }

    /// Via announced by the client.
    #[must_use]
    pub fn via(&self) -> Option<&Url> { self.via.as_ref() }

    /// Content type announced by the client.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> { self.content_type.as_deref() }

    /// Protocol named by a pending upgrade request.
    #[must_use]
    pub fn upgrade(&self) -> Option<&str> { self.upgrade.as_deref() }
}

impl SessionDecoder for ServerSessionDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<usize, FramingError> {
        ServerSessionDecoder::decode(self, bytes)
    }

    fn progress(&self) -> SessionProgress {
        match self.state {
            ServerSessionState::EnvelopeStart { size } => SessionProgress::EnvelopeStart(size),
            ServerSessionState::ReadingEnvelopeBytes { .. } => SessionProgress::EnvelopeBody,
            ServerSessionState::EnvelopeEnd => SessionProgress::EnvelopeEnd,
            ServerSessionState::End => SessionProgress::End,
            _ => SessionProgress::Framing,
        }
    }

    fn on_eof(&self) -> Result<(), FramingError> {
        match self.state {
            ServerSessionState::End | ServerSessionState::EnvelopeEnd => Ok(()),
            ref other => Err(FramingError::PrematureEof {
                state: other.name(),
            }),
        }
    }
}
