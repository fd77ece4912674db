//! Compact binary encoder for the `msbin1` content types.
//!
//! Envelopes are a `bincode` image of the message infoset: version,
//! headers and body. The bytes are not interoperable with .NET binary XML;
//! both peers must use this crate.

use bincode::{Decode, Encode, config, decode_from_slice, encode_to_vec};
use bytes::Bytes;

use super::{EncodingError, MessageEncoder};
use crate::message::{
    AddressingVersion,
    BodyContent,
    EnvelopeVersion,
    FaultCode,
    Message,
    MessageFault,
    MessageHeader,
    MessageHeaders,
    MessageVersion,
};

const BINARY: &str = "application/soap+msbin1";
const BINARY_SESSION: &str = "application/soap+msbinsession1";

#[derive(Encode, Decode)]
struct WireEnvelope {
    envelope: u8,
    addressing: u8,
    headers: Vec<WireHeader>,
    body: WireBody,
}

#[derive(Encode, Decode)]
struct WireHeader {
    name: String,
    namespace: String,
    must_understand: bool,
    value: String,
}

#[derive(Encode, Decode)]
struct WireCode {
    name: String,
    namespace: String,
    subcode: Option<Box<WireCode>>,
}

#[derive(Encode, Decode)]
enum WireBody {
    Empty,
    Text(String),
    Xml(String),
    Binary(Vec<u8>),
    Fault {
        code: WireCode,
        reason: String,
        detail: Option<String>,
    },
}

impl From<&FaultCode> for WireCode {
    fn from(code: &FaultCode) -> Self {
        Self {
            name: code.name.clone(),
            namespace: code.namespace.clone(),
            subcode: code.subcode.as_deref().map(|sub| Box::new(Self::from(sub))),
        }
    }
}

impl From<WireCode> for FaultCode {
    fn from(code: WireCode) -> Self {
        Self {
            name: code.name,
            namespace: code.namespace,
            subcode: code.subcode.map(|sub| Box::new(Self::from(*sub))),
        }
    }
}

impl From<&BodyContent> for WireBody {
    fn from(body: &BodyContent) -> Self {
        match body {
            BodyContent::Empty => Self::Empty,
            BodyContent::Text(text) => Self::Text(text.clone()),
            BodyContent::Xml(xml) => Self::Xml(xml.clone()),
            BodyContent::Binary(bytes) => Self::Binary(bytes.to_vec()),
            BodyContent::Fault(fault) => Self::Fault {
                code: WireCode::from(&fault.code),
                reason: fault.reason.clone(),
                detail: fault.detail.clone(),
            },
        }
    }
}

impl From<WireBody> for BodyContent {
    fn from(body: WireBody) -> Self {
        match body {
            WireBody::Empty => Self::Empty,
            WireBody::Text(text) => Self::Text(text),
            WireBody::Xml(xml) => Self::Xml(xml),
            WireBody::Binary(bytes) => Self::Binary(Bytes::from(bytes)),
            WireBody::Fault {
                code,
                reason,
                detail,
            } => Self::Fault(MessageFault {
                code: code.into(),
                reason,
                detail,
            }),
        }
    }
}

fn envelope_tag(version: EnvelopeVersion) -> u8 {
    match version {
        EnvelopeVersion::Soap11 => 1,
        EnvelopeVersion::Soap12 => 2,
    }
}

fn addressing_tag(version: AddressingVersion) -> u8 {
    match version {
        AddressingVersion::None => 0,
        AddressingVersion::August2004 => 1,
        AddressingVersion::WsAddressing10 => 2,
    }
}

/// Encodes messages as a compact binary infoset.
#[derive(Clone, Debug)]
pub struct BinaryMessageEncoder {
    version: MessageVersion,
    content_type: &'static str,
}

impl BinaryMessageEncoder {
    /// The `application/soap+msbin1` encoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: MessageVersion::SOAP12_WSADDRESSING10,
            content_type: BINARY,
        }
    }

    /// The session-aware `application/soap+msbinsession1` encoder used by
    /// duplex TCP bindings.
    #[must_use]
    pub fn session() -> Self {
        Self {
            content_type: BINARY_SESSION,
            ..Self::new()
        }
    }
}

impl Default for BinaryMessageEncoder {
    fn default() -> Self { Self::session() }
}

impl MessageEncoder for BinaryMessageEncoder {
    fn content_type(&self) -> &str { self.content_type }

    fn message_version(&self) -> MessageVersion { self.version }

    fn read_message(&self, bytes: &[u8]) -> Result<Message, EncodingError> {
        let (wire, consumed): (WireEnvelope, usize) = decode_from_slice(bytes, config::standard())?;
        if consumed != bytes.len() {
            return Err(EncodingError::Binary(format!(
                "{} trailing bytes after envelope",
                bytes.len() - consumed
            )));
        }
        if wire.envelope != envelope_tag(self.version.envelope)
            || wire.addressing != addressing_tag(self.version.addressing)
        {
            return Err(EncodingError::VersionMismatch {
                expected: self.version,
                found: format!("envelope {} addressing {}", wire.envelope, wire.addressing),
            });
        }
        let mut headers = MessageHeaders::new(self.version.addressing);
        for header in wire.headers {
            headers.add(MessageHeader {
                name: header.name,
                namespace: header.namespace,
                must_understand: header.must_understand,
                value: header.value,
            });
        }
        Ok(Message::from_parts(self.version, headers, wire.body.into()))
    }

    fn write_message(&self, message: &Message) -> Result<Vec<u8>, EncodingError> {
        let wire = WireEnvelope {
            envelope: envelope_tag(self.version.envelope),
            addressing: addressing_tag(self.version.addressing),
            headers: message
                .headers()
                .iter()
                .map(|h| WireHeader {
                    name: h.name.clone(),
                    namespace: h.namespace.clone(),
                    must_understand: h.must_understand,
                    value: h.value.clone(),
                })
                .collect(),
            body: message.body()?.into(),
        };
        Ok(encode_to_vec(&wire, config::standard())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::KnownEncoding;

    #[test]
    fn headers_and_fault_survive_binary_encoding() {
        let encoder = BinaryMessageEncoder::session();
        let version = encoder.message_version();
        let fault = MessageFault::new(
            FaultCode::sender(version.envelope).with_subcode(FaultCode::new("Custom", "urn:x")),
            "rejected",
        );
        let mut message = Message::fault(version, fault.clone());
        message.headers_mut().set_relates_to("urn:uuid:1");

        let bytes = encoder.write_message(&message).expect("encodes");
        let mut decoded = encoder.read_message(&bytes).expect("decodes");
        assert_eq!(decoded.headers(), message.headers());
        assert_eq!(decoded.read_body::<MessageFault>().expect("fault"), fault);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let encoder = BinaryMessageEncoder::new();
        let message = Message::new(encoder.message_version(), "urn:a", "b");
        let mut bytes = encoder.write_message(&message).expect("encodes");
        bytes.push(0);
        assert!(matches!(
            encoder.read_message(&bytes),
            Err(EncodingError::Binary(_))
        ));
    }

    #[test]
    fn content_types_map_to_known_encodings() {
        assert_eq!(
            BinaryMessageEncoder::new().known_encoding(),
            Some(KnownEncoding::Binary)
        );
        assert_eq!(
            BinaryMessageEncoder::session().known_encoding(),
            Some(KnownEncoding::BinarySession)
        );
    }
}
