//! Length-prefixed UTF-8 strings.

use std::fmt;

use super::{FramingError, VarintDecoder};

/// Which length-prefixed string is being decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FramedField {
    /// Via URI.
    Via,
    /// Extensible content type.
    ContentType,
    /// Upgrade protocol name.
    UpgradeProtocol,
    /// Fault string.
    Fault,
}

impl fmt::Display for FramedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Via => "via",
            Self::ContentType => "content type",
            Self::UpgradeProtocol => "upgrade protocol",
            Self::Fault => "fault string",
        })
    }
}

/// Incremental decoder for one length-prefixed string.
///
/// The declared length is checked against `max` before any body byte is
/// buffered.
#[derive(Clone, Debug)]
pub struct StringDecoder {
    field: FramedField,
    max: usize,
    size: VarintDecoder,
    bytes: Vec<u8>,
    value: Option<String>,
}

impl StringDecoder {
    /// Create a decoder for `field` accepting at most `max` bytes.
    #[must_use]
    pub fn new(field: FramedField, max: usize) -> Self {
        Self {
            field,
            max,
            size: VarintDecoder::new(),
            bytes: Vec::new(),
            value: None,
        }
    }

    /// Consume bytes until the string is complete or `bytes` is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed size prefix, a length above the
    /// quota, or invalid UTF-8.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, FramingError> {
        if self.value.is_some() {
            return Ok(0);
        }
        let mut consumed = 0;
        if !self.size.is_complete() {
            consumed = self.size.decode(bytes)?;
            let Some(size) = self.size.value() else {
                return Ok(consumed);
            };
            if size > self.max {
                return Err(FramingError::FieldTooLong {
                    field: self.field,
                    size,
                    max: self.max,
                });
            }
            self.bytes.reserve_exact(size);
        }
        let size = self.size.value().unwrap_or_default();
        let wanted = size - self.bytes.len();
        let available = &bytes[consumed..];
        let take = wanted.min(available.len());
        self.bytes.extend_from_slice(&available[..take]);
        consumed += take;
        if self.bytes.len() == size {
            let raw = std::mem::take(&mut self.bytes);
            let value = String::from_utf8(raw).map_err(|_| FramingError::InvalidUtf8(self.field))?;
            self.value = Some(value);
        }
        Ok(consumed)
    }

    /// Returns true once every byte of the string has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool { self.value.is_some() }

    /// Take the decoded string, leaving the decoder empty.
    pub fn take_value(&mut self) -> Option<String> { self.value.take() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string_split_across_calls() {
        let mut decoder = StringDecoder::new(FramedField::Via, 64);
        let wire = b"\x05hello";
        assert_eq!(decoder.decode(&wire[..3]), Ok(3));
        assert!(!decoder.is_complete());
        assert_eq!(decoder.decode(&wire[3..]), Ok(3));
        assert_eq!(decoder.take_value().as_deref(), Some("hello"));
    }

    #[test]
    fn rejects_length_above_quota_before_buffering() {
        let mut decoder = StringDecoder::new(FramedField::ContentType, 4);
        assert_eq!(
            decoder.decode(b"\x05"),
            Err(FramingError::FieldTooLong {
                field: FramedField::ContentType,
                size: 5,
                max: 4,
            })
        );
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut decoder = StringDecoder::new(FramedField::Fault, 8);
        assert_eq!(
            decoder.decode(&[0x02, 0xC3, 0x28]),
            Err(FramingError::InvalidUtf8(FramedField::Fault))
        );
    }

    #[test]
    fn empty_string_completes_immediately() {
        let mut decoder = StringDecoder::new(FramedField::UpgradeProtocol, 8);
        assert_eq!(decoder.decode(&[0x00, 0x07]), Ok(1));
        assert_eq!(decoder.take_value().as_deref(), Some(""));
    }
}
