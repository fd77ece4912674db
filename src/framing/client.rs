//! Client-side decoder for duplex sessions.

use std::mem;

use super::{
    FramingError,
    FramingFault,
    MAX_FAULT_SIZE,
    RecordType,
    SessionDecoder,
    SessionProgress,
    Transition,
    VarintDecoder,
    string::{FramedField, StringDecoder},
};

/// States of the client duplex decoder.
///
/// `UpgradeResponse`, `Start`, `Fault`, `EnvelopeStart`, `EnvelopeEnd`, and
/// `End` are stopping states.
#[derive(Debug)]
pub enum ClientDuplexState {
    /// Awaiting the server's answer to an upgrade request.
    ReadingUpgradeRecord,
    /// The server accepted the upgrade; the caller must perform it.
    UpgradeResponse,
    /// Awaiting `PreambleAck`.
    ReadingAckRecord,
    /// The server acknowledged the preamble.
    Start,
    /// Reading a fault string.
    ReadingFault(StringDecoder),
    /// The server sent a fault.
    Fault(FramingFault),
    /// Awaiting `SizedEnvelope`, `End`, or `Fault`.
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
    /// The server ended the session.
    End,
    /// A previous call failed; the decoder accepts no further input.
    Failed,
}

impl ClientDuplexState {
    /// Returns true for states at which `decode` returns to its caller.
    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(
            self,
            Self::UpgradeResponse
                | Self::Start
                | Self::Fault(_)
                | Self::EnvelopeStart { .. }
                | Self::EnvelopeEnd
                | Self::End
        )
    }

    /// Name of the state for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadingUpgradeRecord => "ReadingUpgradeRecord",
            Self::UpgradeResponse => "UpgradeResponse",
            Self::ReadingAckRecord => "ReadingAckRecord",
            Self::Start => "Start",
            Self::ReadingFault(_) => "ReadingFault",
            Self::Fault(_) => "Fault",
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

fn fault_decoder() -> ClientDuplexState {
    ClientDuplexState::ReadingFault(StringDecoder::new(FramedField::Fault, MAX_FAULT_SIZE))
}

fn paused(
    state: ClientDuplexState,
    bytes: &[u8],
) -> Result<Transition<ClientDuplexState>, FramingError> {
    if bytes.is_empty() {
        Ok(Transition::to(state, 0))
    } else {
        Err(FramingError::DataInState(state.name()))
    }
}

fn step(
    state: ClientDuplexState,
    bytes: &[u8],
) -> Result<Transition<ClientDuplexState>, FramingError> {
    use ClientDuplexState as S;

    let first = bytes.first().copied().unwrap_or_default();
    let record = RecordType::try_from(first);
    Ok(match state {
        S::ReadingUpgradeRecord => match record {
            Ok(RecordType::UpgradeResponse) => Transition::to(S::UpgradeResponse, 1),
            Ok(RecordType::Fault) => Transition::to(fault_decoder(), 1),
            _ => {
                return Err(FramingError::UnexpectedRecord {
                    found: first,
                    expected: "awaiting the upgrade response",
                });
            }
        },
        S::ReadingAckRecord => match record {
            Ok(RecordType::PreambleAck) => Transition::to(S::Start, 1),
            Ok(RecordType::Fault) => Transition::to(fault_decoder(), 1),
            _ => {
                return Err(FramingError::UnexpectedRecord {
                    found: first,
                    expected: "awaiting the preamble acknowledgement",
                });
            }
        },
        S::ReadingFault(mut decoder) => {
            let consumed = decoder.decode(bytes)?;
            match decoder.take_value() {
                Some(fault) => {
                    Transition::to(S::Fault(FramingFault::from_wire_string(&fault)), consumed)
                }
                None => Transition::to(S::ReadingFault(decoder), consumed),
            }
        }
        S::Start | S::EnvelopeEnd => Transition::to(S::ReadingEnvelopeRecord, 0),
        S::ReadingEnvelopeRecord => match record {
            Ok(RecordType::SizedEnvelope) => {
                Transition::to(S::ReadingEnvelopeSize(VarintDecoder::new()), 1)
            }
            Ok(RecordType::End) => Transition::to(S::End, 1),
            Ok(RecordType::Fault) => Transition::to(fault_decoder(), 1),
            _ => {
                return Err(FramingError::UnexpectedRecord {
                    found: first,
                    expected: "awaiting an envelope, end, or fault record",
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
        paused_state @ (S::UpgradeResponse | S::Fault(_) | S::End) => paused(paused_state, bytes)?,
        S::Failed => return Err(FramingError::InvalidState("Failed")),
    })
}

/// Incremental decoder for the client side of a duplex session.
#[derive(Debug)]
pub struct ClientDuplexDecoder {
    state: ClientDuplexState,
}

impl ClientDuplexDecoder {
    /// Create a decoder for a session that sent an upgrade request and now
    /// awaits the server's response.
    #[must_use]
    pub fn awaiting_upgrade() -> Self {
        Self {
            state: ClientDuplexState::ReadingUpgradeRecord,
        }
    }

    /// Create a decoder awaiting the preamble acknowledgement.
    #[must_use]
    pub fn awaiting_ack() -> Self {
        Self {
            state: ClientDuplexState::ReadingAckRecord,
        }
    }

    /// Consume as many bytes as the current phase allows.
    ///
    /// # Errors
    ///
    /// Returns a [`FramingError`] on any protocol violation.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, FramingError> {
        let mut consumed = 0;
        loop {
            let rest = &bytes[consumed..];
            if rest.is_empty() && !self.state.is_stop() {
                break;
            }
            let state = mem::replace(&mut self.state, ClientDuplexState::Failed);
            let transition = step(state, rest)?;
            consumed += transition.consumed;
            self.state = transition.next;
            if self.state.is_stop() {
                break;
            }
        }
        Ok(consumed)
    }

    /// Await the preamble acknowledgement after an upgrade completed.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::InvalidState`] unless the decoder is paused at
    /// [`ClientDuplexState::UpgradeResponse`].
    pub fn resume_after_upgrade(&mut self) -> Result<(), FramingError> {
        if !matches!(self.state, ClientDuplexState::UpgradeResponse) {
            return Err(FramingError::InvalidState(self.state.name()));
        }
        self.state = ClientDuplexState::ReadingAckRecord;
        Ok(())
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &ClientDuplexState { &self.state }

    /// The fault sent by the server, if one was received.
    #[must_use]
    pub fn fault(&self) -> Option<&FramingFault> {
        match &self.state {
            ClientDuplexState::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

impl SessionDecoder for ClientDuplexDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<usize, FramingError> {
        ClientDuplexDecoder::decode(self, bytes)
    }

    fn progress(&self) -> SessionProgress {
        match &self.state {
            ClientDuplexState::EnvelopeStart { size } => SessionProgress::EnvelopeStart(*size),
            ClientDuplexState::ReadingEnvelopeBytes { .. } => SessionProgress::EnvelopeBody,
            ClientDuplexState::EnvelopeEnd => SessionProgress::EnvelopeEnd,
            ClientDuplexState::End => SessionProgress::End,
            ClientDuplexState::Fault(fault) => SessionProgress::Fault(fault.clone()),
            _ => SessionProgress::Framing,
        }
    }

    fn on_eof(&self) -> Result<(), FramingError> {
        match self.state {
            ClientDuplexState::End | ClientDuplexState::EnvelopeEnd => Ok(()),
            ref other => Err(FramingError::PrematureEof {
                state: other.name(),
            }),
        }
    }
}
