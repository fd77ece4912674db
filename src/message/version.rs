//! SOAP envelope and WS-Addressing versions.

use std::fmt;

/// SOAP envelope version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvelopeVersion {
    /// SOAP 1.1.
    Soap11,
    /// SOAP 1.2.
    Soap12,
}

impl EnvelopeVersion {
    /// Namespace of the envelope elements.
    #[must_use]
    pub const fn namespace(self) -> &'static str {
        match self {
            Self::Soap11 => "http://schemas.xmlsoap.org/soap/envelope/",
            Self::Soap12 => "http://www.w3.org/2003/05/soap-envelope",
        }
    }

    /// Look up the version owning `namespace`.
    #[must_use]
    pub fn from_namespace(namespace: &str) -> Option<Self> {
        [Self::Soap11, Self::Soap12]
            .into_iter()
            .find(|version| version.namespace() == namespace)
    }

    /// Local name of the generic sender fault code.
    #[must_use]
    pub const fn sender_code(self) -> &'static str {
        match self {
            Self::Soap11 => "Client",
            Self::Soap12 => "Sender",
        }
    }

    /// Local name of the generic receiver fault code.
    #[must_use]
    pub const fn receiver_code(self) -> &'static str {
        match self {
            Self::Soap11 => "Server",
            Self::Soap12 => "Receiver",
        }
    }
}

/// WS-Addressing version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressingVersion {
    /// No addressing headers on the wire.
    None,
    /// WS-Addressing August 2004.
    August2004,
    /// WS-Addressing 1.0.
    WsAddressing10,
}

impl AddressingVersion {
    /// Namespace of the addressing headers.
    #[must_use]
    pub const fn namespace(self) -> &'static str {
        match self {
            Self::None => "http://schemas.microsoft.com/ws/2005/05/addressing/none",
            Self::August2004 => "http://schemas.xmlsoap.org/ws/2004/08/addressing",
            Self::WsAddressing10 => "http://www.w3.org/2005/08/addressing",
        }
    }

    /// Action used for fault messages.
    #[must_use]
    pub const fn fault_action(self) -> &'static str {
        match self {
            Self::None | Self::WsAddressing10 => "http://www.w3.org/2005/08/addressing/soap/fault",
            Self::August2004 => "http://schemas.xmlsoap.org/ws/2004/08/addressing/fault",
        }
    }

    /// Address meaning "reply on the channel the request arrived on".
    #[must_use]
    pub const fn anonymous(self) -> &'static str {
        match self {
            Self::None | Self::WsAddressing10 => "http://www.w3.org/2005/08/addressing/anonymous",
            Self::August2004 => "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous",
        }
    }

    /// Look up the version owning `namespace`.
    #[must_use]
    pub fn from_namespace(namespace: &str) -> Option<Self> {
        [Self::None, Self::August2004, Self::WsAddressing10]
            .into_iter()
            .find(|version| version.namespace() == namespace)
    }
}

/// Pairing of an envelope version with an addressing version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageVersion {
    /// Envelope version.
    pub envelope: EnvelopeVersion,
    /// Addressing version.
    pub addressing: AddressingVersion,
}

impl MessageVersion {
    /// SOAP 1.1 without addressing.
    pub const SOAP11: MessageVersion = MessageVersion {
        envelope: EnvelopeVersion::Soap11,
        addressing: AddressingVersion::None,
    };
    /// SOAP 1.2 with WS-Addressing 1.0.
    pub const SOAP12_WSADDRESSING10: MessageVersion = MessageVersion {
        envelope: EnvelopeVersion::Soap12,
        addressing: AddressingVersion::WsAddressing10,
    };
    /// SOAP 1.1 with WS-Addressing 1.0.
    pub const SOAP11_WSADDRESSING10: MessageVersion = MessageVersion {
        envelope: EnvelopeVersion::Soap11,
        addressing: AddressingVersion::WsAddressing10,
    };
    /// SOAP 1.2 with WS-Addressing August 2004.
    pub const SOAP12_WSADDRESSING_AUGUST2004: MessageVersion = MessageVersion {
        envelope: EnvelopeVersion::Soap12,
        addressing: AddressingVersion::August2004,
    };
}

impl Default for MessageVersion {
    fn default() -> Self { Self::SOAP12_WSADDRESSING10 }
}

impl fmt::Display for MessageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?}", self.envelope, self.addressing)
    }
}
