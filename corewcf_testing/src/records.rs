//! Byte-level builders for framing records.
//!
//! [`RecordBuilder`] writes records the way a client would, and also the
//! ways a misbehaving one might: wrong versions, oversized strings, envelopes
//! that declare more bytes than they carry.

use bytes::{BufMut, BytesMut};
use corewcf::framing::{
    FramingFault,
    FramingMode,
    FramingVersion,
    KnownEncoding,
    RecordType,
    encode_varint,
};

/// Accumulates raw framing records.
///
/// ```rust
/// use corewcf_testing::RecordBuilder;
///
/// let bytes = RecordBuilder::new()
///     .duplex_preamble("net.tcp://localhost/svc", "application/soap+xml")
///     .preamble_end()
///     .build();
/// assert_eq!(bytes[0], 0x00);
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordBuilder {
    bytes: BytesMut,
}

impl RecordBuilder {
    /// An empty builder.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// `Version` with `major.minor`.
    #[must_use]
    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.bytes
            .put_slice(&[RecordType::Version.as_u8(), major, minor]);
        self
    }

    /// `Mode` with a raw mode byte.
    #[must_use]
    pub fn mode(mut self, mode: u8) -> Self {
        self.bytes.put_slice(&[RecordType::Mode.as_u8(), mode]);
        self
    }

    /// `Via` naming `uri`.
    #[must_use]
    pub fn via(self, uri: &str) -> Self { self.string(RecordType::Via, uri) }

    /// `KnownEncoding` with `encoding`.
    #[must_use]
    pub fn known_encoding(mut self, encoding: KnownEncoding) -> Self {
        self.bytes
            .put_slice(&[RecordType::KnownEncoding.as_u8(), encoding.as_u8()]);
        self
    }

    /// `ExtensibleEncoding` naming `content_type`.
    #[must_use]
    pub fn extensible_encoding(self, content_type: &str) -> Self {
        self.string(RecordType::ExtensibleEncoding, content_type)
    }

    /// The four preamble records of a duplex session. Content types with a
    /// known-encoding byte use it.
    #[must_use]
    pub fn duplex_preamble(self, via: &str, content_type: &str) -> Self {
        let version = FramingVersion::V1_0;
        let builder = self
            .version(version.major, version.minor)
            .mode(FramingMode::Duplex.as_u8())
            .via(via);
        match KnownEncoding::from_content_type(content_type) {
            Some(known) => builder.known_encoding(known),
            None => builder.extensible_encoding(content_type),
        }
    }

    /// `UpgradeRequest` naming `protocol`.
    #[must_use]
    pub fn upgrade_request(self, protocol: &str) -> Self { self.string(RecordType::UpgradeRequest, protocol) }

    /// `PreambleEnd`.
    #[must_use]
    pub fn preamble_end(self) -> Self { self.record(RecordType::PreambleEnd) }

    /// `SizedEnvelope` carrying `payload`.
    #[must_use]
    pub fn sized_envelope(self, payload: &[u8]) -> Self { self.envelope_declaring(payload.len(), payload) }

    /// `SizedEnvelope` that declares `size` bytes but carries `payload`.
    #[must_use]
    pub fn envelope_declaring(mut self, size: usize, payload: &[u8]) -> Self {
        self.bytes.put_u8(RecordType::SizedEnvelope.as_u8());
        self.varint(size);
        self.bytes.put_slice(payload);
        self
    }

    /// `End`.
    #[must_use]
    pub fn end(self) -> Self { self.record(RecordType::End) }

    /// A bare record type byte.
    #[must_use]
    pub fn record(mut self, record: RecordType) -> Self {
        self.bytes.put_u8(record.as_u8());
        self
    }

    /// Arbitrary bytes.
    #[must_use]
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.put_slice(bytes);
        self
    }

    /// The accumulated bytes.
    #[must_use]
    pub fn build(self) -> Vec<u8> { self.bytes.to_vec() }

    fn string(mut self, record: RecordType, value: &str) -> Self {
        self.bytes.put_u8(record.as_u8());
        self.varint(value.len());
        self.bytes.put_slice(value.as_bytes());
        self
    }

    fn varint(&mut self, value: usize) {
        if encode_varint(value, &mut self.bytes).is_err() {
            // Out-of-range sizes are written as the largest five-byte form.
            self.bytes.put_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x07]);
        }
    }
}

/// The fault carried by the first record of `bytes`, if it is a `Fault`
/// record.
#[must_use]
pub fn first_fault(bytes: &[u8]) -> Option<FramingFault> {
    let (&record, rest) = bytes.split_first()?;
    if record != RecordType::Fault.as_u8() {
        return None;
    }
    let mut len = 0usize;
    let mut shift = 0;
    let mut used = 0;
    for &byte in rest.iter().take(5) {
        len |= usize::from(byte & 0x7F) << shift;
        used += 1;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let text = rest.get(used..used + len)?;
    Some(FramingFault::from_wire_string(std::str::from_utf8(text).ok()?))
}
