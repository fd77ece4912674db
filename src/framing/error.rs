//! Errors raised while decoding or encoding framing records.

use thiserror::Error;

use super::{FramingFault, string::FramedField};

/// A violation of the framing protocol.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// The peer announced a major version other than 1.
    #[error("unsupported framing version {0}.x")]
    UnsupportedVersion(u8),
    /// The mode byte is not a known mode, or names a mode the server refuses.
    #[error("unsupported framing mode {0:#04x}")]
    UnsupportedMode(u8),
    /// A record arrived where the state machine expected something else.
    #[error("unexpected record type {found:#04x} while {expected}")]
    UnexpectedRecord {
        /// Byte found on the wire.
        found: u8,
        /// What the decoder was waiting for.
        expected: &'static str,
    },
    /// A size prefix ran past five bytes or exceeded `i32::MAX`.
    #[error("invalid size prefix")]
    InvalidVarint,
    /// A size is too large to be written as a size prefix.
    #[error("size {0} cannot be encoded as a size prefix")]
    SizeOutOfRange(usize),
    /// A length-prefixed string exceeded its quota.
    #[error("{field} of {size} bytes exceeds the maximum of {max} bytes")]
    FieldTooLong {
        /// Which string overflowed.
        field: FramedField,
        /// Declared length.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// A length-prefixed string was not valid UTF-8.
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(FramedField),
    /// The via could not be parsed as an absolute URI.
    #[error("via {0} is not an absolute URI")]
    InvalidVia(String),
    /// A known-encoding byte outside the predefined table.
    #[error("unknown known-encoding byte {0:#04x}")]
    UnknownEncoding(u8),
    /// The stream ended before the session completed.
    #[error("connection closed prematurely in state {state}")]
    PrematureEof {
        /// Decoder state when the stream ended.
        state: &'static str,
    },
    /// Bytes arrived after the decoder reached a terminal or paused state.
    #[error("received data in state {0}")]
    DataInState(&'static str),
    /// A state transition was requested from the wrong state.
    #[error("operation is not valid in state {0}")]
    InvalidState(&'static str),
}

impl FramingError {
    /// The fault a server should send before closing, if any.
    #[must_use]
    pub fn fault(&self) -> Option<FramingFault> {
        match self {
            Self::UnsupportedVersion(_) => Some(FramingFault::UnsupportedVersion),
            Self::UnsupportedMode(_) => Some(FramingFault::UnsupportedMode),
            Self::FieldTooLong { field, .. } => match field {
                FramedField::Via => Some(FramingFault::ViaTooLong),
                FramedField::ContentType => Some(FramingFault::ContentTypeTooLong),
                FramedField::UpgradeProtocol => Some(FramingFault::UpgradeInvalid),
                FramedField::Fault => None,
            },
            Self::UnknownEncoding(_) => Some(FramingFault::ContentTypeInvalid),
            _ => None,
        }
    }
}
