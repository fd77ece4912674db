//! Framing fault strings.

use std::fmt;

/// Namespace shared by every predefined framing fault.
pub const FAULT_NAMESPACE: &str = "http://schemas.microsoft.com/ws/2006/05/framing/faults/";

/// Longest fault string accepted from a peer.
pub const MAX_FAULT_SIZE: usize = 256;

/// A fault carried by a framing `Fault` record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FramingFault {
    /// The content type is not supported by the endpoint.
    ContentTypeInvalid,
    /// The content type exceeded the configured maximum.
    ContentTypeTooLong,
    /// The connection could not be handed to a listener.
    ConnectionDispatchFailed,
    /// No endpoint is listening at the via.
    EndpointNotFound,
    /// An endpoint exists but is not accepting sessions.
    EndpointUnavailable,
    /// An envelope exceeded the configured maximum.
    MaxMessageSizeExceeded,
    /// The server cannot accept more sessions.
    ServerTooBusy,
    /// The service could not be activated.
    ServiceActivationFailed,
    /// The framing mode is not supported.
    UnsupportedMode,
    /// The framing version is not supported.
    UnsupportedVersion,
    /// The requested upgrade is not supported.
    UpgradeInvalid,
    /// The via exceeded the configured maximum.
    ViaTooLong,
    /// A fault string outside the predefined set.
    Other(String),
}

impl FramingFault {
    /// Short name of the fault, used as a metric label.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::ContentTypeInvalid => "ContentTypeInvalid",
            Self::ContentTypeTooLong => "ContentTypeTooLong",
            Self::ConnectionDispatchFailed => "ConnectionDispatchFailed",
            Self::EndpointNotFound => "EndpointNotFound",
            Self::EndpointUnavailable => "EndpointUnavailable",
            Self::MaxMessageSizeExceeded => "MaxMessageSizeExceededFault",
            Self::ServerTooBusy => "ServerTooBusy",
            Self::ServiceActivationFailed => "ServiceActivationFailed",
            Self::UnsupportedMode => "UnsupportedMode",
            Self::UnsupportedVersion => "UnsupportedVersion",
            Self::UpgradeInvalid => "UpgradeInvalid",
            Self::ViaTooLong => "ViaTooLong",
            Self::Other(_) => "Other",
        }
    }

    /// The string written on the wire.
    #[must_use]
    pub fn as_wire_string(&self) -> String {
        match self {
            Self::Other(value) => value.clone(),
            predefined => format!("{FAULT_NAMESPACE}{}", predefined.name()),
        }
    }

    /// Parse a fault string received from a peer.
    #[must_use]
    pub fn from_wire_string(value: &str) -> Self {
        let Some(name) = value.strip_prefix(FAULT_NAMESPACE) else {
            return Self::Other(value.to_owned());
        };
        match name {
            "ContentTypeInvalid" => Self::ContentTypeInvalid,
            "ContentTypeTooLong" => Self::ContentTypeTooLong,
            "ConnectionDispatchFailed" => Self::ConnectionDispatchFailed,
            "EndpointNotFound" => Self::EndpointNotFound,
            "EndpointUnavailable" => Self::EndpointUnavailable,
            "MaxMessageSizeExceededFault" => Self::MaxMessageSizeExceeded,
            "ServerTooBusy" => Self::ServerTooBusy,
            "ServiceActivationFailed" => Self::ServiceActivationFailed,
            "UnsupportedMode" => Self::UnsupportedMode,
            "UnsupportedVersion" => Self::UnsupportedVersion,
            "UpgradeInvalid" => Self::UpgradeInvalid,
            "ViaTooLong" => Self::ViaTooLong,
            _ => Self::Other(value.to_owned()),
        }
    }
}

impl fmt::Display for FramingFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(value) => f.write_str(value),
            predefined => f.write_str(predefined.name()),
        }
    }
}
