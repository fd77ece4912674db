//! Canonical error and result types for the crate.
//!
//! [`CommunicationError`] is the single failure surface shared by the
//! transport, channel, dispatcher, and client layers. Lower layers keep
//! their own narrower error types ([`FramingError`], [`EncodingError`],
//! [`MessageError`]) which convert into it with `?`.

use std::{io, time::Duration};

use thiserror::Error;

use crate::{
    channel::CommunicationState,
    encoding::EncodingError,
    framing::{FramingError, FramingFault},
    message::{MessageError, MessageFault},
};

/// Top-level error type exposed by `corewcf`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommunicationError {
    /// The peer violated the framing protocol.
    #[error("framing protocol violation: {0}")]
    Framing(#[from] FramingError),
    /// A protocol-level failure that is not tied to a single framing record.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A message exceeded a configured size quota.
    #[error("message of {size} bytes exceeds the configured quota of {max} bytes")]
    QuotaExceeded {
        /// Observed or declared size in bytes.
        size: usize,
        /// Configured maximum in bytes.
        max: usize,
    },
    /// The communication object has faulted and can no longer be used.
    #[error("the communication object {0} is in the Faulted state")]
    ObjectFaulted(&'static str),
    /// The operation is not valid for the object's current state.
    #[error("the communication object {object} cannot be used in the {state} state")]
    InvalidState {
        /// Name of the object.
        object: &'static str,
        /// State observed when the call was made.
        state: CommunicationState,
    },
    /// An operation did not finish within its time budget.
    #[error("{operation} did not complete within the allotted timeout of {budget:?}")]
    Timeout {
        /// Name of the timed operation.
        operation: &'static str,
        /// Budget that was exceeded.
        budget: Duration,
    },
    /// No endpoint is listening at the requested address.
    #[error("there was no endpoint listening at {0} that could accept the message")]
    EndpointNotFound(String),
    /// The server rejected the session with a framing fault.
    #[error("the server rejected the session with fault {0}")]
    ServerFault(FramingFault),
    /// A SOAP fault returned by a service operation.
    #[error("{0}")]
    Fault(#[from] FaultError),
    /// An address is already registered with the transport.
    #[error("an endpoint is already listening at {0}")]
    AddressAlreadyInUse(String),
    /// The requested client operation is not part of the contract.
    #[error("operation {0} is not defined by the contract")]
    UnknownOperation(String),
    /// A message could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    /// The message was used in an invalid way.
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    /// The session ended before an outstanding operation completed.
    #[error("communication failed: {0}")]
    Communication(String),
    /// An error in the underlying transport.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// The communication object was aborted while the operation was pending.
    #[error("the communication object {0} has been aborted")]
    Aborted(&'static str),
}

impl CommunicationError {
    /// Build a timeout error for `operation` with the given `budget`.
    #[must_use]
    pub fn timeout(operation: &'static str, budget: Duration) -> Self {
        Self::Timeout { operation, budget }
    }

    /// Returns true if this error is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool { matches!(self, Self::Timeout { .. }) }

    /// Returns true if this error reports a protocol violation.
    #[must_use]
    pub fn is_protocol(&self) -> bool { matches!(self, Self::Framing(_) | Self::Protocol(_)) }

    /// Translate a framing fault received from a server into a typed error.
    ///
    /// `via` and `content_type` name what the client asked for so the error
    /// can say what was rejected.
    #[must_use]
    pub fn from_framing_fault(fault: FramingFault, via: &str, content_type: &str) -> Self {
        match fault {
            FramingFault::EndpointNotFound | FramingFault::EndpointUnavailable => {
                Self::EndpointNotFound(via.to_owned())
            }
            FramingFault::ContentTypeInvalid => Self::Protocol(format!(
                "content type {content_type} was not supported by the service at {via}"
            )),
            FramingFault::ContentTypeTooLong => Self::Protocol(format!(
                "content type {content_type} is longer than the service at {via} accepts"
            )),
            FramingFault::ViaTooLong => {
                Self::Protocol(format!("via {via} is longer than the service accepts"))
            }
            FramingFault::UnsupportedVersion => {
                Self::Protocol(format!("the service at {via} does not support this framing version"))
            }
            FramingFault::UnsupportedMode => {
                Self::Protocol(format!("the service at {via} does not support this framing mode"))
            }
            FramingFault::UpgradeInvalid => {
                Self::Protocol(format!("the service at {via} rejected the stream upgrade"))
            }
            other => Self::ServerFault(other),
        }
    }
}

/// A SOAP fault surfaced to the caller of a client operation.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{}", .fault.reason)]
pub struct FaultError {
    /// The fault carried by the reply.
    pub fault: MessageFault,
    /// Action of the fault message, if any.
    pub action: Option<String>,
}

impl FaultError {
    /// Wrap a fault with no action.
    #[must_use]
    pub fn new(fault: MessageFault) -> Self { Self { fault, action: None } }
}

/// Canonical result alias used by `corewcf` public APIs.
pub type Result<T, E = CommunicationError> = std::result::Result<T, E>;
