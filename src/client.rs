//! Client runtime: contract description and correlated calls.
//!
//! A [`ClientBuilder`] connects to an endpoint and opens a duplex session
//! with it. The resulting [`ServiceClient`] turns operation names into
//! requests through an [`ImmutableClientRuntime`], matches replies to
//! requests by `MessageID`, and surfaces SOAP faults as
//! [`CommunicationError::Fault`](crate::error::CommunicationError::Fault).

mod builder;
mod operation;
mod runtime;
mod service;
mod socket;

pub use builder::ClientBuilder;
pub use operation::{ClientOperation, ProxyOperationRuntime};
pub use runtime::{ClientMessageInspector, ImmutableClientRuntime};
pub use service::ServiceClient;
pub use socket::SocketOptions;
