//! SOAP text encoder over UTF-8 XML.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use quick_xml::{
    Writer,
    events::{BytesEnd, BytesStart, BytesText, Event},
    name::{Namespace, QName, ResolveResult},
    reader::NsReader,
};

use super::{EncodingError, MessageEncoder, charset};
use crate::message::{
    BodyContent,
    EnvelopeVersion,
    FaultCode,
    Message,
    MessageFault,
    MessageHeader,
    MessageHeaders,
    MessageVersion,
};

/// Namespace of the element wrapping binary bodies.
const SERIALIZATION_NAMESPACE: &str = "http://schemas.microsoft.com/2003/10/Serialization/";
const BINARY_ELEMENT: &str = "base64Binary";

fn xml_error(error: impl std::fmt::Display) -> EncodingError { EncodingError::Xml(error.to_string()) }

/// Encodes messages as SOAP envelopes in UTF-8 XML.
#[derive(Clone, Debug)]
pub struct TextMessageEncoder {
    version: MessageVersion,
    content_type: String,
}

impl TextMessageEncoder {
    /// An encoder for `version` using the standard content type.
    #[must_use]
    pub fn new(version: MessageVersion) -> Self {
        let content_type = match version.envelope {
            EnvelopeVersion::Soap11 => "text/xml; charset=utf-8",
            EnvelopeVersion::Soap12 => "application/soap+xml; charset=utf-8",
        };
        Self {
            version,
            content_type: content_type.to_owned(),
        }
    }

    /// SOAP 1.2 with WS-Addressing 1.0.
    #[must_use]
    pub fn soap12() -> Self { Self::new(MessageVersion::SOAP12_WSADDRESSING10) }

    /// SOAP 1.1 without addressing.
    #[must_use]
    pub fn soap11() -> Self { Self::new(MessageVersion::SOAP11) }
}

impl Default for TextMessageEncoder {
    fn default() -> Self { Self::soap12() }
}

impl MessageEncoder for TextMessageEncoder {
    fn content_type(&self) -> &str { &self.content_type }

    fn message_version(&self) -> MessageVersion { self.version }

    fn is_content_type_supported(&self, content_type: &str) -> bool {
        super::media_type(content_type).eq_ignore_ascii_case(self.media_type())
            && charset(content_type).is_none_or(|c| c.eq_ignore_ascii_case("utf-8"))
    }

    fn read_message(&self, bytes: &[u8]) -> Result<Message, EncodingError> {
        let text = std::str::from_utf8(bytes).map_err(xml_error)?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        EnvelopeReader::new(text, self.version).read()
    }

    fn write_message(&self, message: &Message) -> Result<Vec<u8>, EncodingError> {
        let body = message.body()?;
        let mut out = EnvelopeWriter {
            writer: Writer::new(Vec::new()),
            version: self.version,
        };
        out.envelope(message.headers(), body)?;
        Ok(out.writer.into_inner())
    }
}

struct EnvelopeWriter {
    writer: Writer<Vec<u8>>,
    version: MessageVersion,
}

impl EnvelopeWriter {
    fn event(&mut self, event: Event<'_>) -> Result<(), EncodingError> {
        self.writer.write_event(event).map_err(xml_error)
    }

    fn start(&mut self, element: BytesStart<'_>) -> Result<(), EncodingError> {
        self.event(Event::Start(element))
    }

    fn end(&mut self, name: &str) -> Result<(), EncodingError> {
        self.event(Event::End(BytesEnd::new(name)))
    }

    fn text(&mut self, text: &str) -> Result<(), EncodingError> {
        self.event(Event::Text(BytesText::new(text)))
    }

    fn text_element(&mut self, element: BytesStart<'_>, text: &str) -> Result<(), EncodingError> {
        let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
        self.start(element)?;
        self.text(text)?;
        self.end(&name)
    }

    fn envelope(&mut self, headers: &MessageHeaders, body: &BodyContent) -> Result<(), EncodingError> {
        let mut envelope = BytesStart::new("s:Envelope");
        envelope.push_attribute(("xmlns:s", self.version.envelope.namespace()));
        envelope.push_attribute(("xmlns:a", self.version.addressing.namespace()));
        self.start(envelope)?;
        if !headers.is_empty() {
            self.start(BytesStart::new("s:Header"))?;
            for header in headers {
                self.header(header)?;
            }
            self.end("s:Header")?;
        }
        self.start(BytesStart::new("s:Body"))?;
        self.body(body)?;
        self.end("s:Body")?;
        self.end("s:Envelope")
    }

    fn header(&mut self, header: &MessageHeader) -> Result<(), EncodingError> {
        let addressing = header.namespace == self.version.addressing.namespace();
        let name = if addressing {
            format!("a:{}", header.name)
        } else {
            format!("h:{}", header.name)
        };
        let mut element = BytesStart::new(name.as_str());
        if !addressing {
            element.push_attribute(("xmlns:h", header.namespace.as_str()));
        }
        if header.must_understand {
            element.push_attribute(("s:mustUnderstand", "1"));
        }
        self.text_element(element, &header.value)
    }

    fn body(&mut self, body: &BodyContent) -> Result<(), EncodingError> {
        match body {
            BodyContent::Empty => Ok(()),
            BodyContent::Text(text) => self.text(text),
            BodyContent::Xml(raw) => self.event(Event::Text(BytesText::from_escaped(raw.as_str()))),
            BodyContent::Binary(bytes) => {
                let mut element = BytesStart::new(BINARY_ELEMENT);
                element.push_attribute(("xmlns", SERIALIZATION_NAMESPACE));
                self.text_element(element, &STANDARD.encode(bytes))
            }
            BodyContent::Fault(fault) => self.fault(fault),
        }
    }

    fn fault(&mut self, fault: &MessageFault) -> Result<(), EncodingError> {
        self.start(BytesStart::new("s:Fault"))?;
        match self.version.envelope {
            EnvelopeVersion::Soap12 => {
                self.start(BytesStart::new("s:Code"))?;
                self.code_12(&fault.code)?;
                self.end("s:Code")?;
                self.start(BytesStart::new("s:Reason"))?;
                let mut text = BytesStart::new("s:Text");
                text.push_attribute(("xml:lang", "en-US"));
                self.text_element(text, &fault.reason)?;
                self.end("s:Reason")?;
                if let Some(detail) = &fault.detail {
                    self.text_element(BytesStart::new("s:Detail"), detail)?;
                }
            }
            EnvelopeVersion::Soap11 => {
                let code = fault.code.innermost();
                let mut element = BytesStart::new("faultcode");
                let value = self.qualified(&mut element, code);
                self.text_element(element, &value)?;
                self.text_element(BytesStart::new("faultstring"), &fault.reason)?;
                if let Some(detail) = &fault.detail {
                    self.text_element(BytesStart::new("detail"), detail)?;
                }
            }
        }
        self.end("s:Fault")
    }

    fn code_12(&mut self, code: &FaultCode) -> Result<(), EncodingError> {
        let mut value = BytesStart::new("s:Value");
        let qualified = self.qualified(&mut value, code);
        self.text_element(value, &qualified)?;
        if let Some(subcode) = code.subcode.as_deref() {
            self.start(BytesStart::new("s:Subcode"))?;
            self.code_12(subcode)?;
            self.end("s:Subcode")?;
        }
        Ok(())
    }

    /// Render `code` as a prefixed name, declaring its namespace on
    /// `element` when it is not the envelope namespace.
    fn qualified(&self, element: &mut BytesStart<'_>, code: &FaultCode) -> String {
        if code.namespace == self.version.envelope.namespace() {
            format!("s:{}", code.name)
        } else if code.namespace.is_empty() {
            code.name.clone()
        } else {
            element.push_attribute(("xmlns:c", code.namespace.as_str()));
            format!("c:{}", code.name)
        }
    }
}

enum Node<'i> {
    Start {
        ns: Option<String>,
        element: BytesStart<'i>,
    },
    Empty {
        ns: Option<String>,
        element: BytesStart<'i>,
    },
    End,
    Text(String),
    Eof,
}

impl Node<'_> {
    fn describe(&self) -> String {
        match self {
            Node::Start { element, .. } | Node::Empty { element, .. } => {
                String::from_utf8_lossy(element.name().as_ref()).into_owned()
            }
            Node::End => "end of element".to_owned(),
            Node::Text(_) => "text".to_owned(),
            Node::Eof => "end of document".to_owned(),
        }
    }

    fn is_element(&self, local: &str, namespace: &str) -> bool {
        match self {
            Node::Start { ns, element } | Node::Empty { ns, element } => {
                element.local_name().as_ref() == local.as_bytes() && ns.as_deref() == Some(namespace)
            }
            _ => false,
        }
    }
}

fn bound_namespace(resolved: &ResolveResult<'_>) -> Option<String> {
    match resolved {
        ResolveResult::Bound(Namespace(ns)) => Some(String::from_utf8_lossy(ns).into_owned()),
        _ => None,
    }
}

fn unexpected(expected: &'static str, found: &Node<'_>) -> EncodingError {
    EncodingError::UnexpectedElement {
        expected,
        found: found.describe(),
    }
}

struct EnvelopeReader<'i> {
    reader: NsReader<&'i [u8]>,
    input: &'i str,
    version: MessageVersion,
    mark: usize,
}

impl<'i> EnvelopeReader<'i> {
    fn new(input: &'i str, version: MessageVersion) -> Self {
        Self {
            reader: NsReader::from_str(input),
            input,
            version,
            mark: 0,
        }
    }

    fn position(&self) -> Result<usize, EncodingError> {
        usize::try_from(self.reader.buffer_position()).map_err(xml_error)
    }

    fn next(&mut self) -> Result<Node<'i>, EncodingError> {
        loop {
            self.mark = self.position()?;
            let (resolved, event) = self.reader.read_resolved_event().map_err(xml_error)?;
            let ns = bound_namespace(&resolved);
            return Ok(match event {
                Event::Start(element) => Node::Start { ns, element },
                Event::Empty(element) => Node::Empty { ns, element },
                Event::End(_) => Node::End,
                Event::Text(text) => Node::Text(text.unescape().map_err(xml_error)?.into_owned()),
                Event::CData(data) => Node::Text(String::from_utf8_lossy(&data).into_owned()),
                Event::Eof => Node::Eof,
                _ => continue,
            });
        }
    }

    /// Next node that is not whitespace between elements.
    fn next_structural(&mut self) -> Result<Node<'i>, EncodingError> {
        loop {
            match self.next()? {
                Node::Text(text) if text.trim().is_empty() => {}
                node => return Ok(node),
            }
        }
    }

    /// Collect the text of the element just opened, up to its end tag.
    ///
    /// Leaf text is kept verbatim. Once the element has children,
    /// whitespace-only runs between them are dropped.
    fn read_text(&mut self) -> Result<String, EncodingError> {
        let mut depth = 0_usize;
        let mut nested = false;
        let mut pieces = Vec::new();
        loop {
            match self.next()? {
                Node::Text(chunk) => pieces.push(chunk),
                Node::Start { .. } => {
                    depth += 1;
                    nested = true;
                }
                Node::Empty { .. } => nested = true,
                Node::End if depth == 0 => break,
                Node::End => depth -= 1,
                eof @ Node::Eof => return Err(unexpected("end of element", &eof)),
            }
        }
        Ok(if nested {
            pieces.into_iter().filter(|p| !p.trim().is_empty()).collect()
        } else {
            pieces.concat()
        })
    }

    fn skip_to_end(&mut self) -> Result<(), EncodingError> { self.read_text().map(drop) }

    fn read(mut self) -> Result<Message, EncodingError> {
        let envelope_ns = self.version.envelope.namespace();
        let root = self.next_structural()?;
        let Node::Start { ns, element } = &root else {
            return Err(unexpected("Envelope", &root));
        };
        if element.local_name().as_ref() != b"Envelope" {
            return Err(unexpected("Envelope", &root));
        }
        if ns.as_deref() != Some(envelope_ns) {
            return Err(EncodingError::VersionMismatch {
                expected: self.version,
                found: ns.clone().unwrap_or_default(),
            });
        }

        let mut headers = MessageHeaders::new(self.version.addressing);
        let body = loop {
            let node = self.next_structural()?;
            if node.is_element("Header", envelope_ns) {
                if matches!(node, Node::Start { .. }) {
                    self.read_headers(&mut headers)?;
                }
            } else if node.is_element("Body", envelope_ns) {
                break match node {
                    Node::Start { .. } => self.read_body()?,
                    _ => BodyContent::Empty,
                };
            } else {
                return Err(unexpected("Header or Body", &node));
            }
        };
        Ok(Message::from_parts(self.version, headers, body))
    }

    fn read_headers(&mut self, headers: &mut MessageHeaders) -> Result<(), EncodingError> {
        loop {
            let (ns, element, empty) = match self.next()? {
                Node::Start { ns, element } => (ns, element, false),
                Node::Empty { ns, element } => (ns, element, true),
                Node::End => return Ok(()),
                Node::Text(_) => continue,
                eof @ Node::Eof => return Err(unexpected("header", &eof)),
            };
            let mut must_understand = false;
            for attribute in element.attributes() {
                let attribute = attribute.map_err(xml_error)?;
                if attribute.key.local_name().as_ref() == b"mustUnderstand" {
                    let value = attribute.unescape_value().map_err(xml_error)?;
                    must_understand = value == "1" || value == "true";
                }
            }
            let value = if empty { String::new() } else { self.read_text()? };
            headers.add(MessageHeader {
                name: String::from_utf8_lossy(element.local_name().as_ref()).into_owned(),
                namespace: ns.unwrap_or_default(),
                must_understand,
                value,
            });
        }
    }

    fn read_body(&mut self) -> Result<BodyContent, EncodingError> {
        let envelope_ns = self.version.envelope.namespace();
        let mut leading = String::new();
        let mut node = self.next()?;
        while let Node::Text(chunk) = node {
            leading.push_str(&chunk);
            node = self.next()?;
        }
        if matches!(node, Node::End) {
            return Ok(if leading.is_empty() {
                BodyContent::Empty
            } else {
                BodyContent::Text(leading)
            });
        }
        if !leading.trim().is_empty() {
            return Err(unexpected("text or a single element", &node));
        }
        let content = if node.is_element("Fault", envelope_ns) && matches!(node, Node::Start { .. }) {
            BodyContent::Fault(self.read_fault()?)
        } else if node.is_element(BINARY_ELEMENT, SERIALIZATION_NAMESPACE) {
            let encoded = match node {
                Node::Start { .. } => self.read_text()?,
                _ => String::new(),
            };
            BodyContent::Binary(Bytes::from(STANDARD.decode(encoded.trim())?))
        } else {
            match node {
                Node::Start { element, .. } => {
                    let start = self.mark;
                    let name = element.name().as_ref().to_vec();
                    self.reader.read_to_end(QName(&name)).map_err(xml_error)?;
                    BodyContent::Xml(self.slice(start)?)
                }
                Node::Empty { .. } => BodyContent::Xml(self.slice(self.mark)?),
                other => return Err(unexpected("body content", &other)),
            }
        };
        self.skip_to_end()?;
        Ok(content)
    }

    fn slice(&self, start: usize) -> Result<String, EncodingError> {
        let end = self.position()?;
        self.input
            .get(start..end)
            .map(str::to_owned)
            .ok_or_else(|| EncodingError::Xml("element span out of bounds".to_owned()))
    }

    fn read_fault(&mut self) -> Result<MessageFault, EncodingError> {
        let envelope_ns = self.version.envelope.namespace();
        let mut fault = MessageFault::new(FaultCode::receiver(self.version.envelope), "");
        loop {
            let node = self.next()?;
            match &node {
                Node::End => return Ok(fault),
                Node::Start { element, .. } => {
                    let local = element.local_name().as_ref().to_vec();
                    match local.as_slice() {
                        b"Code" if node.is_element("Code", envelope_ns) => {
                            fault.code = self.read_code_12()?;
                        }
                        b"Reason" => fault.reason = self.read_text()?,
                        b"faultstring" => fault.reason = self.read_text()?,
                        b"faultcode" => fault.code = self.read_qname()?,
                        b"Detail" | b"detail" => fault.detail = Some(self.read_text()?),
                        _ => self.skip_to_end()?,
                    }
                }
                Node::Empty { .. } | Node::Text(_) => {}
                Node::Eof => return Err(unexpected("end of fault", &node)),
            }
        }
    }

    fn read_code_12(&mut self) -> Result<FaultCode, EncodingError> {
        let mut code = FaultCode::new("", "");
        loop {
            let node = self.next()?;
            match &node {
                Node::End => return Ok(code),
                Node::Start { element, .. } => match element.local_name().as_ref() {
                    b"Value" => {
                        let value = self.read_qname()?;
                        code.name = value.name;
                        code.namespace = value.namespace;
                    }
                    b"Subcode" => code.subcode = Some(Box::new(self.read_code_12()?)),
                    _ => self.skip_to_end()?,
                },
                Node::Empty { .. } | Node::Text(_) => {}
                Node::Eof => return Err(unexpected("end of fault code", &node)),
            }
        }
    }

    /// Read a prefixed name as element text, resolving its prefix in the
    /// element's scope.
    fn read_qname(&mut self) -> Result<FaultCode, EncodingError> {
        let value = match self.next()? {
            Node::Text(text) => text,
            Node::End => return Ok(FaultCode::new("", "")),
            other => return Err(unexpected("qualified name", &other)),
        };
        let (resolved, local) = self.reader.resolve_element(QName(value.trim().as_bytes()));
        let code = FaultCode::new(
            String::from_utf8_lossy(local.as_ref()).into_owned(),
            bound_namespace(&resolved).unwrap_or_default(),
        );
        self.skip_to_end()?;
        Ok(code)
    }
}
