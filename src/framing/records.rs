//! Record type identifiers and the fixed-value records of the preamble.

use std::fmt;

use super::FramingError;

/// One-byte identifier at the start of every framing record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Protocol version, followed by major and minor bytes.
    Version = 0x00,
    /// Communication mode, followed by one mode byte.
    Mode = 0x01,
    /// Target address, followed by a length-prefixed UTF-8 URI.
    Via = 0x02,
    /// Encoding chosen from the predefined table, followed by one byte.
    KnownEncoding = 0x03,
    /// Encoding named by a length-prefixed content type string.
    ExtensibleEncoding = 0x04,
    /// Envelope streamed as length-prefixed chunks.
    UnsizedEnvelope = 0x05,
    /// Envelope carried as one length-prefixed payload.
    SizedEnvelope = 0x06,
    /// End of the session.
    End = 0x07,
    /// Fault, followed by a length-prefixed fault string.
    Fault = 0x08,
    /// Request to upgrade the stream, followed by a protocol name.
    UpgradeRequest = 0x09,
    /// Acceptance of an upgrade request.
    UpgradeResponse = 0x0A,
    /// Acknowledgement that the preamble was accepted.
    PreambleAck = 0x0B,
    /// End of the client preamble.
    PreambleEnd = 0x0C,
}

impl RecordType {
    /// The wire value of this record type.
    #[must_use]
    pub const fn as_u8(self) -> u8 { self as u8 }
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Version,
            0x01 => Self::Mode,
            0x02 => Self::Via,
            0x03 => Self::KnownEncoding,
            0x04 => Self::ExtensibleEncoding,
            0x05 => Self::UnsizedEnvelope,
            0x06 => Self::SizedEnvelope,
            0x07 => Self::End,
            0x08 => Self::Fault,
            0x09 => Self::UpgradeRequest,
            0x0A => Self::UpgradeResponse,
            0x0B => Self::PreambleAck,
            0x0C => Self::PreambleEnd,
            other => return Err(other),
        })
    }
}

/// Communication mode announced in the preamble.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FramingMode {
    /// One unsized envelope per connection.
    SingletonUnsized = 0x01,
    /// Full-duplex session of sized envelopes.
    Duplex = 0x02,
    /// One-way stream of sized envelopes.
    Simplex = 0x03,
    /// One sized envelope per connection.
    SingletonSized = 0x04,
}

impl FramingMode {
    /// The wire value of this mode.
    #[must_use]
    pub const fn as_u8(self) -> u8 { self as u8 }
}

impl TryFrom<u8> for FramingMode {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::SingletonUnsized),
            0x02 => Ok(Self::Duplex),
            0x03 => Ok(Self::Simplex),
            0x04 => Ok(Self::SingletonSized),
            other => Err(FramingError::UnsupportedMode(other)),
        }
    }
}

/// Framing protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FramingVersion {
    /// Major version; only 1 is understood.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl FramingVersion {
    /// Version 1.0, the only version this crate speaks.
    pub const V1_0: FramingVersion = FramingVersion { major: 1, minor: 0 };
}

impl fmt::Display for FramingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Predefined encodings that can be named with a single byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KnownEncoding {
    /// SOAP 1.1 text, UTF-8.
    Soap11Utf8 = 0x00,
    /// SOAP 1.1 text, UTF-16.
    Soap11Utf16 = 0x01,
    /// SOAP 1.1 text, UTF-16 little-endian.
    Soap11Utf16Fffe = 0x02,
    /// SOAP 1.2 text, UTF-8.
    Soap12Utf8 = 0x03,
    /// SOAP 1.2 text, UTF-16.
    Soap12Utf16 = 0x04,
    /// SOAP 1.2 text, UTF-16 little-endian.
    Soap12Utf16Fffe = 0x05,
    /// MTOM.
    Mtom = 0x06,
    /// Binary XML.
    Binary = 0x07,
    /// Binary XML with a session dictionary.
    BinarySession = 0x08,
}

impl KnownEncoding {
    const ALL: [KnownEncoding; 9] = [
        Self::Soap11Utf8,
        Self::Soap11Utf16,
        Self::Soap11Utf16Fffe,
        Self::Soap12Utf8,
        Self::Soap12Utf16,
        Self::Soap12Utf16Fffe,
        Self::Mtom,
        Self::Binary,
        Self::BinarySession,
    ];

    /// The wire value of this encoding.
    #[must_use]
    pub const fn as_u8(self) -> u8 { self as u8 }

    /// Content type this encoding stands for.
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Soap11Utf8 => "text/xml; charset=utf-8",
            Self::Soap11Utf16 => "text/xml; charset=utf-16",
            Self::Soap11Utf16Fffe => "text/xml; charset=unicodeFFFE",
            Self::Soap12Utf8 => "application/soap+xml; charset=utf-8",
            Self::Soap12Utf16 => "application/soap+xml; charset=utf-16",
            Self::Soap12Utf16Fffe => "application/soap+xml; charset=unicodeFFFE",
            Self::Mtom => "multipart/related",
            Self::Binary => "application/soap+msbin1",
            Self::BinarySession => "application/soap+msbinsession1",
        }
    }

    /// Find the known encoding whose content type equals `content_type`,
    /// ignoring ASCII case.
    #[must_use]
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|known| known.content_type().eq_ignore_ascii_case(content_type))
    }
}

impl TryFrom<u8> for KnownEncoding {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|known| known.as_u8() == value)
            .ok_or(FramingError::UnknownEncoding(value))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0x00, "text/xml; charset=utf-8")]
    #[case(0x03, "application/soap+xml; charset=utf-8")]
    #[case(0x07, "application/soap+msbin1")]
    #[case(0x08, "application/soap+msbinsession1")]
    fn known_encoding_bytes_map_to_content_types(#[case] byte: u8, #[case] content_type: &str) {
        let known = KnownEncoding::try_from(byte).expect("known encoding");
        assert_eq!(known.content_type(), content_type);
        assert_eq!(KnownEncoding::from_content_type(content_type), Some(known));
    }

    #[test]
    fn unknown_encoding_byte_is_rejected() {
        assert_eq!(
            KnownEncoding::try_from(0x09),
            Err(FramingError::UnknownEncoding(0x09))
        );
    }

    #[test]
    fn record_types_round_trip_through_bytes() {
        for byte in 0x00..=0x0C_u8 {
            let record = RecordType::try_from(byte).expect("defined record");
            assert_eq!(record.as_u8(), byte);
        }
        assert_eq!(RecordType::try_from(0x0D), Err(0x0D));
    }
}
