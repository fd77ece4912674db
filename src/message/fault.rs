//! SOAP fault model.

use super::EnvelopeVersion;

/// Namespace of dispatcher fault subcodes.
pub const DISPATCHER_NAMESPACE: &str =
    "http://schemas.microsoft.com/net/2005/12/windowscommunicationfoundation/dispatcher";

/// A qualified fault code with an optional subcode chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaultCode {
    /// Local name.
    pub name: String,
    /// Namespace URI; empty for unqualified codes.
    pub namespace: String,
    /// More specific code.
    pub subcode: Option<Box<FaultCode>>,
}

impl FaultCode {
    /// A code with no subcode.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            subcode: None,
        }
    }

    /// The generic "sender is at fault" code for `version`.
    #[must_use]
    pub fn sender(version: EnvelopeVersion) -> Self {
        Self::new(version.sender_code(), version.namespace())
    }

    /// The generic "receiver is at fault" code for `version`.
    #[must_use]
    pub fn receiver(version: EnvelopeVersion) -> Self {
        Self::new(version.receiver_code(), version.namespace())
    }

    /// Attach `subcode`.
    #[must_use]
    pub fn with_subcode(mut self, subcode: FaultCode) -> Self {
        self.subcode = Some(Box::new(subcode));
        self
    }

    /// Returns true for either generic sender code.
    #[must_use]
    pub fn is_sender(&self) -> bool { matches!(self.name.as_str(), "Sender" | "Client") }

    /// The most specific code in the chain.
    #[must_use]
    pub fn innermost(&self) -> &FaultCode {
        let mut code = self;
        while let Some(next) = code.subcode.as_deref() {
            code = next;
        }
        code
    }
}

/// A SOAP fault body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageFault {
    /// Fault code.
    pub code: FaultCode,
    /// Human-readable reason.
    pub reason: String,
    /// Optional detail text.
    pub detail: Option<String>,
}

impl MessageFault {
    /// Build a fault with no detail.
    pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            detail: None,
        }
    }

    /// Attach detail text.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
