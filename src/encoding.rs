//! Message encoders.
//!
//! An encoder turns a [`Message`] into the bytes of one envelope and back.
//! Sessions pick one encoder for their lifetime, announced in the preamble
//! by content type.

mod binary;
mod text;

pub use binary::BinaryMessageEncoder;
pub use text::TextMessageEncoder;
use thiserror::Error;

use crate::{
    framing::KnownEncoding,
    message::{Message, MessageError, MessageVersion},
};

/// Errors raised while encoding or decoding an envelope.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The XML was malformed.
    #[error("malformed XML: {0}")]
    Xml(String),
    /// An element appeared where another was required.
    #[error("expected {expected} but found {found}")]
    UnexpectedElement {
        /// What the decoder required.
        expected: &'static str,
        /// What it found.
        found: String,
    },
    /// The envelope used a different message version than the encoder.
    #[error("message version {found} does not match the encoder's {expected}")]
    VersionMismatch {
        /// Version the encoder was configured with.
        expected: MessageVersion,
        /// Version found in the envelope, when recognisable.
        found: String,
    },
    /// Base64 content could not be decoded.
    #[error("invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),
    /// Binary envelope could not be decoded or encoded.
    #[error("binary envelope error: {0}")]
    Binary(String),
    /// The message body was unavailable.
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl From<bincode::error::DecodeError> for EncodingError {
    fn from(error: bincode::error::DecodeError) -> Self { Self::Binary(error.to_string()) }
}

impl From<bincode::error::EncodeError> for EncodingError {
    fn from(error: bincode::error::EncodeError) -> Self { Self::Binary(error.to_string()) }
}

/// Converts messages to and from envelope bytes.
pub trait MessageEncoder: Send + Sync {
    /// Full content type announced for sessions using this encoder.
    fn content_type(&self) -> &str;

    /// Message version this encoder reads and writes.
    fn message_version(&self) -> MessageVersion;

    /// Media type without parameters.
    fn media_type(&self) -> &str { media_type(self.content_type()) }

    /// Returns true if a session announcing `content_type` can use this
    /// encoder.
    fn is_content_type_supported(&self, content_type: &str) -> bool {
        media_type(content_type).eq_ignore_ascii_case(self.media_type())
    }

    /// Single-byte encoding for the preamble, when one exists.
    fn known_encoding(&self) -> Option<KnownEncoding> {
        KnownEncoding::from_content_type(self.content_type())
    }

    /// Decode one envelope.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodingError`] if the bytes are not a valid envelope
    /// for this encoder.
    fn read_message(&self, bytes: &[u8]) -> Result<Message, EncodingError>;

    /// Encode one envelope.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodingError`] if the body was already consumed or
    /// cannot be represented.
    fn write_message(&self, message: &Message) -> Result<Vec<u8>, EncodingError>;
}

/// The media type of `content_type`, without parameters.
///
/// ```
/// use corewcf::encoding::media_type;
///
/// assert_eq!(media_type("text/xml; charset=utf-8"), "text/xml");
/// ```
#[must_use]
pub fn media_type(content_type: &str) -> &str {
    content_type
        .split_once(';')
        .map_or(content_type, |(media, _)| media)
        .trim()
}

/// The `charset` parameter of `content_type`, if present.
#[must_use]
pub fn charset(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}
