//! Builders for outgoing framing records.

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    FramingError,
    FramingFault,
    FramingMode,
    FramingVersion,
    KnownEncoding,
    RecordType,
    encode_varint,
    encoded_len,
};

/// The single-byte `PreambleEnd` record.
pub const PREAMBLE_END: [u8; 1] = [RecordType::PreambleEnd as u8];
/// The single-byte `PreambleAck` record.
pub const PREAMBLE_ACK: [u8; 1] = [RecordType::PreambleAck as u8];
/// The single-byte `UpgradeResponse` record.
pub const UPGRADE_RESPONSE: [u8; 1] = [RecordType::UpgradeResponse as u8];
/// The single-byte `End` record.
pub const END: [u8; 1] = [RecordType::End as u8];

fn put_string(
    dst: &mut BytesMut,
    record: RecordType,
    value: &str,
) -> Result<(), FramingError> {
    dst.reserve(1 + encoded_len(value.len()) + value.len());
    dst.put_u8(record.as_u8());
    encode_varint(value.len(), dst)?;
    dst.put_slice(value.as_bytes());
    Ok(())
}

/// The records a client sends before `PreambleEnd`.
///
/// # Examples
///
/// ```
/// use corewcf::framing::{FramingMode, writer::ClientPreamble};
///
/// let preamble = ClientPreamble::new("net.tcp://localhost/svc", "application/soap+msbin1");
/// let bytes = preamble.encode().expect("preamble encodes");
/// assert_eq!(&bytes[..5], &[0x00, 0x01, 0x00, 0x01, FramingMode::Duplex.as_u8()]);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientPreamble {
    /// Framing version.
    pub version: FramingVersion,
    /// Communication mode.
    pub mode: FramingMode,
    /// Target address.
    pub via: String,
    /// Content type of every envelope in the session.
    pub content_type: String,
}

impl ClientPreamble {
    /// A version 1.0 duplex preamble for `via` and `content_type`.
    pub fn new(via: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            version: FramingVersion::V1_0,
            mode: FramingMode::Duplex,
            via: via.into(),
            content_type: content_type.into(),
        }
    }

    /// Override the announced mode.
    #[must_use]
    pub fn with_mode(mut self, mode: FramingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Encode the version, mode, via, and encoding records.
    ///
    /// Content types from the known-encoding table use the one-byte form.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::SizeOutOfRange`] if a string is too long to
    /// size-prefix.
    pub fn encode(&self) -> Result<Bytes, FramingError> {
        let mut dst = BytesMut::with_capacity(16 + self.via.len() + self.content_type.len());
        dst.put_u8(RecordType::Version.as_u8());
        dst.put_u8(self.version.major);
        dst.put_u8(self.version.minor);
        dst.put_u8(RecordType::Mode.as_u8());
        dst.put_u8(self.mode.as_u8());
        put_string(&mut dst, RecordType::Via, &self.via)?;
        match KnownEncoding::from_content_type(&self.content_type) {
            Some(known) => {
                dst.put_u8(RecordType::KnownEncoding.as_u8());
                dst.put_u8(known.as_u8());
            }
            None => put_string(&mut dst, RecordType::ExtensibleEncoding, &self.content_type)?,
        }
        Ok(dst.freeze())
    }
}

/// Encode an `UpgradeRequest` record naming `protocol`.
///
/// # Errors
///
/// Returns [`FramingError::SizeOutOfRange`] if `protocol` is too long.
pub fn upgrade_request(protocol: &str) -> Result<Bytes, FramingError> {
    let mut dst = BytesMut::new();
    put_string(&mut dst, RecordType::UpgradeRequest, protocol)?;
    Ok(dst.freeze())
}

/// Encode a `Fault` record.
#[must_use]
pub fn fault(fault: &FramingFault) -> Bytes {
    let mut dst = BytesMut::new();
    // Fault strings are bounded well below the size-prefix limit.
    let wire = fault.as_wire_string();
    dst.put_u8(RecordType::Fault.as_u8());
    let _ = encode_varint(wire.len(), &mut dst);
    dst.put_slice(wire.as_bytes());
    dst.freeze()
}

/// Encode a `SizedEnvelope` record carrying `payload`.
///
/// # Errors
///
/// Returns [`FramingError::SizeOutOfRange`] if the payload is too long to
/// size-prefix.
pub fn sized_envelope(payload: &[u8]) -> Result<Bytes, FramingError> {
    let mut dst = BytesMut::with_capacity(1 + encoded_len(payload.len()) + payload.len());
    dst.put_u8(RecordType::SizedEnvelope.as_u8());
    encode_varint(payload.len(), &mut dst)?;
    dst.put_slice(payload);
    Ok(dst.freeze())
}
