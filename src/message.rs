//! The SOAP message model.
//!
//! A [`Message`] owns its headers, local properties, and a body that can be
//! consumed once. Encoders borrow the body to serialise it; application code
//! takes it with [`Message::read_body`].

mod fault;
mod headers;
mod properties;
mod version;

use bytes::Bytes;
pub use fault::{DISPATCHER_NAMESPACE, FaultCode, MessageFault};
pub use headers::{MessageHeader, MessageHeaders};
pub use properties::MessageProperties;
use thiserror::Error;
pub use version::{AddressingVersion, EnvelopeVersion, MessageVersion};

/// Errors raised by misuse of a [`Message`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The body was already consumed.
    #[error("the message body has already been read")]
    BodyAlreadyRead,
    /// The message was closed.
    #[error("the message has been closed")]
    Closed,
    /// The body could not be converted to the requested type.
    #[error("expected a {expected} body but found {found}")]
    UnexpectedBody {
        /// Requested representation.
        expected: &'static str,
        /// Representation actually present.
        found: &'static str,
    },
}

/// Lifecycle of a message body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageState {
    /// The body has not been consumed.
    Created,
    /// The body was consumed by [`Message::read_body`].
    Read,
    /// The message was closed.
    Closed,
}

/// Body payload of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BodyContent {
    /// No body element.
    Empty,
    /// Character data.
    Text(String),
    /// A raw XML element.
    Xml(String),
    /// Opaque bytes.
    Binary(Bytes),
    /// A SOAP fault.
    Fault(MessageFault),
}

impl BodyContent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Text(_) => "text",
            Self::Xml(_) => "xml",
            Self::Binary(_) => "binary",
            Self::Fault(_) => "fault",
        }
    }
}

/// Values that can become a message body.
pub trait IntoBody {
    /// Convert into body content.
    fn into_body(self) -> BodyContent;
}

/// Values that can be taken out of a message body.
pub trait FromBody: Sized {
    /// Convert from body content.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::UnexpectedBody`] when the content has a
    /// different shape.
    fn from_body(body: BodyContent) -> Result<Self, MessageError>;
}

impl IntoBody for BodyContent {
    fn into_body(self) -> BodyContent { self }
}

impl IntoBody for () {
    fn into_body(self) -> BodyContent { BodyContent::Empty }
}

impl IntoBody for String {
    fn into_body(self) -> BodyContent { BodyContent::Text(self) }
}

impl IntoBody for &str {
    fn into_body(self) -> BodyContent { BodyContent::Text(self.to_owned()) }
}

impl IntoBody for Bytes {
    fn into_body(self) -> BodyContent { BodyContent::Binary(self) }
}

impl IntoBody for Vec<u8> {
    fn into_body(self) -> BodyContent { BodyContent::Binary(Bytes::from(self)) }
}

impl IntoBody for MessageFault {
    fn into_body(self) -> BodyContent { BodyContent::Fault(self) }
}

impl FromBody for BodyContent {
    fn from_body(body: BodyContent) -> Result<Self, MessageError> { Ok(body) }
}

impl FromBody for () {
    fn from_body(_: BodyContent) -> Result<Self, MessageError> { Ok(()) }
}

impl FromBody for String {
    fn from_body(body: BodyContent) -> Result<Self, MessageError> {
        match body {
            BodyContent::Text(text) | BodyContent::Xml(text) => Ok(text),
            BodyContent::Empty => Ok(String::new()),
            other => Err(MessageError::UnexpectedBody {
                expected: "text",
                found: other.kind(),
            }),
        }
    }
}

impl FromBody for Bytes {
    fn from_body(body: BodyContent) -> Result<Self, MessageError> {
        match body {
            BodyContent::Binary(bytes) => Ok(bytes),
            BodyContent::Text(text) | BodyContent::Xml(text) => Ok(Bytes::from(text)),
            BodyContent::Empty => Ok(Bytes::new()),
            other @ BodyContent::Fault(_) => Err(MessageError::UnexpectedBody {
                expected: "binary",
                found: other.kind(),
            }),
        }
    }
}

impl FromBody for Vec<u8> {
    fn from_body(body: BodyContent) -> Result<Self, MessageError> {
        Bytes::from_body(body).map(|bytes| bytes.to_vec())
    }
}

impl FromBody for MessageFault {
    fn from_body(body: BodyContent) -> Result<Self, MessageError> {
        match body {
            BodyContent::Fault(fault) => Ok(fault),
            other => Err(MessageError::UnexpectedBody {
                expected: "fault",
                found: other.kind(),
            }),
        }
    }
}

/// A SOAP message.
#[derive(Debug)]
pub struct Message {
    version: MessageVersion,
    headers: MessageHeaders,
    properties: MessageProperties,
    body: Option<BodyContent>,
    state: MessageState,
}

impl Message {
    /// Create a message with `action` and `body`.
    ///
    /// # Examples
    ///
    /// ```
    /// use corewcf::message::{Message, MessageVersion};
    ///
    /// let mut message = Message::new(MessageVersion::default(), "urn:echo", "hello");
    /// assert_eq!(message.headers().action(), Some("urn:echo"));
    /// assert_eq!(message.read_body::<String>().unwrap(), "hello");
    /// assert!(message.read_body::<String>().is_err());
    /// ```
    pub fn new(version: MessageVersion, action: &str, body: impl IntoBody) -> Self {
        let mut headers = MessageHeaders::new(version.addressing);
        headers.set_action(action);
        Self::from_parts(version, headers, body.into_body())
    }

    /// Create a fault message using the addressing fault action.
    #[must_use]
    pub fn fault(version: MessageVersion, fault: MessageFault) -> Self {
        Self::new(version, version.addressing.fault_action(), fault)
    }

    /// Assemble a message from decoded parts.
    #[must_use]
    pub fn from_parts(version: MessageVersion, headers: MessageHeaders, body: BodyContent) -> Self {
        Self {
            version,
            headers,
            properties: MessageProperties::default(),
            body: Some(body),
            state: MessageState::Created,
        }
    }

    /// Message version.
    #[must_use]
    pub fn version(&self) -> MessageVersion { self.version }

    /// Headers.
    #[must_use]
    pub fn headers(&self) -> &MessageHeaders { &self.headers }

    /// Mutable headers.
    pub fn headers_mut(&mut self) -> &mut MessageHeaders { &mut self.headers }

    /// Local properties.
    #[must_use]
    pub fn properties(&self) -> &MessageProperties { &self.properties }

    /// Mutable local properties.
    pub fn properties_mut(&mut self) -> &mut MessageProperties { &mut self.properties }

    /// Body lifecycle state.
    #[must_use]
    pub fn state(&self) -> MessageState { self.state }

    /// Returns true if the unread body is a fault.
    #[must_use]
    pub fn is_fault(&self) -> bool { matches!(self.body, Some(BodyContent::Fault(_))) }

    /// Returns true if the unread body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { matches!(self.body, Some(BodyContent::Empty)) }

    /// Borrow the body without consuming it.
    ///
    /// # Errors
    ///
    /// Fails once the body has been read or the message closed.
    pub fn body(&self) -> Result<&BodyContent, MessageError> {
        match self.state {
            MessageState::Created => self.body.as_ref().ok_or(MessageError::BodyAlreadyRead),
            MessageState::Read => Err(MessageError::BodyAlreadyRead),
            MessageState::Closed => Err(MessageError::Closed),
        }
    }

    /// Consume the body as `T`.
    ///
    /// # Errors
    ///
    /// Fails on a second read, after [`close`](Self::close), or when the
    /// content cannot become `T`. The body is consumed even if conversion
    /// fails.
    pub fn read_body<T: FromBody>(&mut self) -> Result<T, MessageError> {
        if self.state == MessageState::Closed {
            return Err(MessageError::Closed);
        }
        let body = self.body.take().ok_or(MessageError::BodyAlreadyRead)?;
        self.state = MessageState::Read;
        T::from_body(body)
    }

    /// Release the body.
    pub fn close(&mut self) {
        self.body = None;
        self.state = MessageState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_read_fails() {
        let mut message = Message::new(MessageVersion::default(), "urn:a", b"abc".to_vec());
        assert_eq!(message.read_body::<Vec<u8>>(), Ok(b"abc".to_vec()));
        assert_eq!(
            message.read_body::<Vec<u8>>(),
            Err(MessageError::BodyAlreadyRead)
        );
        assert_eq!(message.body(), Err(MessageError::BodyAlreadyRead));
    }

    #[test]
    fn closed_message_rejects_reads() {
        let mut message = Message::new(MessageVersion::default(), "urn:a", "x");
        message.close();
        assert_eq!(message.read_body::<String>(), Err(MessageError::Closed));
        assert_eq!(message.state(), MessageState::Closed);
    }

    #[test]
    fn fault_messages_use_the_fault_action() {
        let version = MessageVersion::SOAP12_WSADDRESSING10;
        let fault = MessageFault::new(FaultCode::sender(version.envelope), "bad");
        let message = Message::fault(version, fault);
        assert!(message.is_fault());
        assert_eq!(
            message.headers().action(),
            Some("http://www.w3.org/2005/08/addressing/soap/fault")
        );
    }

    #[test]
    fn fault_body_is_not_text() {
        let version = MessageVersion::default();
        let fault = MessageFault::new(FaultCode::receiver(version.envelope), "oops");
        let mut message = Message::fault(version, fault);
        assert_eq!(
            message.read_body::<String>(),
            Err(MessageError::UnexpectedBody {
                expected: "text",
                found: "fault",
            })
        );
    }
}
