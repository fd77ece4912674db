//! Ordered SOAP header collection with addressing accessors.

use super::AddressingVersion;

/// A single SOAP header.
///
/// Header content is kept as text; structured headers are flattened to the
/// text of their children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Local name.
    pub name: String,
    /// Namespace URI.
    pub namespace: String,
    /// Whether the receiver must understand the header.
    pub must_understand: bool,
    /// Text content.
    pub value: String,
}

impl MessageHeader {
    /// Build a header that receivers may ignore.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            must_understand: false,
            value: value.into(),
        }
    }

    /// Mark the header as one receivers must understand.
    #[must_use]
    pub fn must_understand(mut self) -> Self {
        self.must_understand = true;
        self
    }

    fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }
}

const ACTION: &str = "Action";
const TO: &str = "To";
const MESSAGE_ID: &str = "MessageID";
const RELATES_TO: &str = "RelatesTo";
const REPLY_TO: &str = "ReplyTo";

/// Ordered collection of headers bound to an addressing version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeaders {
    addressing: AddressingVersion,
    headers: Vec<MessageHeader>,
}

impl MessageHeaders {
    /// An empty collection for `addressing`.
    #[must_use]
    pub fn new(addressing: AddressingVersion) -> Self {
        Self {
            addressing,
            headers: Vec::new(),
        }
    }

    /// Addressing version the accessors use.
    #[must_use]
    pub fn addressing(&self) -> AddressingVersion { self.addressing }

    /// Append a header.
    pub fn add(&mut self, header: MessageHeader) { self.headers.push(header); }

    /// Position of the first header with `name` in `namespace`.
    #[must_use]
    pub fn find(&self, name: &str, namespace: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.is(name, namespace))
    }

    /// First header with `name` in `namespace`.
    #[must_use]
    pub fn get(&self, name: &str, namespace: &str) -> Option<&MessageHeader> {
        self.headers.iter().find(|h| h.is(name, namespace))
    }

    /// Remove every header with `name` in `namespace`.
    pub fn remove_all(&mut self, name: &str, namespace: &str) {
        self.headers.retain(|h| !h.is(name, namespace));
    }

    /// Iterate headers in order.
    pub fn iter(&self) -> impl Iterator<Item = &MessageHeader> { self.headers.iter() }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize { self.headers.len() }

    /// Returns true when there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.headers.is_empty() }

    fn addressing_value(&self, name: &str) -> Option<&str> {
        self.get(name, self.addressing.namespace())
            .map(|h| h.value.as_str())
    }

    fn set_addressing_value(&mut self, name: &str, value: &str, must_understand: bool) {
        let namespace = self.addressing.namespace();
        self.remove_all(name, namespace);
        let mut header = MessageHeader::new(name, namespace, value);
        header.must_understand = must_understand;
        self.headers.push(header);
    }

    /// The `Action` header.
    #[must_use]
    pub fn action(&self) -> Option<&str> { self.addressing_value(ACTION) }

    /// Replace the `Action` header.
    pub fn set_action(&mut self, action: &str) { self.set_addressing_value(ACTION, action, true); }

    /// The `To` header.
    #[must_use]
    pub fn to(&self) -> Option<&str> { self.addressing_value(TO) }

    /// Replace the `To` header.
    pub fn set_to(&mut self, to: &str) { self.set_addressing_value(TO, to, true); }

    /// The `MessageID` header.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> { self.addressing_value(MESSAGE_ID) }

    /// Replace the `MessageID` header.
    pub fn set_message_id(&mut self, id: &str) { self.set_addressing_value(MESSAGE_ID, id, false); }

    /// The `RelatesTo` header.
    #[must_use]
    pub fn relates_to(&self) -> Option<&str> { self.addressing_value(RELATES_TO) }

    /// Replace the `RelatesTo` header.
    pub fn set_relates_to(&mut self, id: &str) { self.set_addressing_value(RELATES_TO, id, false); }

    /// The `ReplyTo` address.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> { self.addressing_value(REPLY_TO) }

    /// Replace the `ReplyTo` address.
    pub fn set_reply_to(&mut self, address: &str) {
        self.set_addressing_value(REPLY_TO, address, false);
    }

    /// Returns true if `header` belongs to the addressing namespace.
    #[must_use]
    pub fn is_addressing_header(&self, header: &MessageHeader) -> bool {
        header.namespace == self.addressing.namespace()
    }

    /// Headers marked `mustUnderstand` that neither the addressing layer
    /// nor `understood` accepts.
    pub fn not_understood<'a>(
        &'a self,
        understood: impl Fn(&MessageHeader) -> bool + 'a,
    ) -> impl Iterator<Item = &'a MessageHeader> + 'a {
        self.headers.iter().filter(move |h| {
            h.must_understand && !self.is_addressing_header(h) && !understood(h)
        })
    }
}

impl<'a> IntoIterator for &'a MessageHeaders {
    type Item = &'a MessageHeader;
    type IntoIter = std::slice::Iter<'a, MessageHeader>;

    fn into_iter(self) -> Self::IntoIter { self.headers.iter() }
}
