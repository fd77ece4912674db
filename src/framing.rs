//! The .NET Message Framing protocol.
//!
//! A session begins with a preamble of fixed records (version, mode, via,
//! encoding), optionally followed by stream upgrades, and ends with
//! `PreambleEnd`. The server acknowledges with `PreambleAck` or rejects with a
//! single `Fault` record. Envelopes then travel as `SizedEnvelope` records
//! until either side writes `End`.
//!
//! Decoding is incremental: decoders accept whatever bytes are available,
//! report how many they consumed, and pause at states where the caller must
//! act (validate the preamble, perform an upgrade, allocate an envelope
//! buffer, hand over a completed envelope).

mod client;
mod error;
mod fault;
mod records;
mod server;
pub mod string;
mod varint;
pub mod writer;

pub use client::{ClientDuplexDecoder, ClientDuplexState};
pub use error::FramingError;
pub use fault::{FAULT_NAMESPACE, FramingFault, MAX_FAULT_SIZE};
pub use records::{FramingMode, FramingVersion, KnownEncoding, RecordType};
pub use server::{ServerSessionDecoder, ServerSessionState};
pub use varint::{MAX_VARINT_VALUE, VarintDecoder, encode_varint, encoded_len};

use crate::config::{DEFAULT_MAX_CONTENT_TYPE_SIZE, DEFAULT_MAX_VIA_SIZE};

/// String quotas enforced while decoding a preamble.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderLimits {
    /// Largest via accepted.
    pub max_via_size: usize,
    /// Largest content type or upgrade protocol name accepted.
    pub max_content_type_size: usize,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            max_via_size: DEFAULT_MAX_VIA_SIZE,
            max_content_type_size: DEFAULT_MAX_CONTENT_TYPE_SIZE,
        }
    }
}

/// Where a session decoder stands relative to envelope boundaries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionProgress {
    /// Still inside the preamble, or between records.
    Framing,
    /// An envelope of the given size is about to be read.
    EnvelopeStart(usize),
    /// Envelope payload bytes are being consumed.
    EnvelopeBody,
    /// The current envelope is complete.
    EnvelopeEnd,
    /// The peer ended the session.
    End,
    /// The peer sent a fault record.
    Fault(FramingFault),
}

impl SessionProgress {
    /// Returns true when bytes consumed from this point are envelope payload.
    #[must_use]
    pub fn is_envelope_payload(&self) -> bool {
        matches!(self, Self::EnvelopeStart(_) | Self::EnvelopeBody)
    }
}

/// A decoder that can drive the envelope phase of a session.
pub trait SessionDecoder: Send + 'static {
    /// Consume bytes and advance, returning the count consumed.
    ///
    /// # Errors
    ///
    /// Returns a [`FramingError`] when the bytes violate the protocol.
    fn decode(&mut self, bytes: &[u8]) -> Result<usize, FramingError>;

    /// Current position relative to envelope boundaries.
    fn progress(&self) -> SessionProgress;

    /// Report whether end-of-stream is acceptable in the current state.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::PrematureEof`] unless the decoder is at a
    /// session or envelope boundary.
    fn on_eof(&self) -> Result<(), FramingError>;
}

/// A preamble value recognised by a decoder step.
#[derive(Debug)]
enum Decoded {
    Version(FramingVersion),
    Mode(FramingMode),
    Via(url::Url),
    ContentType(String),
    Upgrade(String),
}

/// Result of one decoder step.
#[derive(Debug)]
struct Transition<S> {
    next: S,
    consumed: usize,
    decoded: Option<Decoded>,
}

impl<S> Transition<S> {
    fn to(next: S, consumed: usize) -> Self {
        Self {
            next,
            consumed,
            decoded: None,
        }
    }

    fn with(next: S, consumed: usize, decoded: Decoded) -> Self {
        Self {
            next,
            consumed,
            decoded: Some(decoded),
        }
    }
}

fn expect_record(
    byte: u8,
    expected: RecordType,
    context: &'static str,
) -> Result<(), FramingError> {
    if byte == expected.as_u8() {
        Ok(())
    } else {
        Err(FramingError::UnexpectedRecord {
            found: byte,
            expected: context,
        })
    }
}
