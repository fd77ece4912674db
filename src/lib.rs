#![doc(html_root_url = "https://docs.rs/corewcf/latest")]
//! Public API for the `corewcf` library.
//!
//! This crate implements connection-oriented SOAP services over the .NET
//! Message Framing protocol: a connection acceptor, framing decoders,
//! duplex session channels, a shared TCP transport, a service dispatcher,
//! and a correlating client.

pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod encoding;
pub mod error;
pub mod framing;
pub mod message;
pub mod metrics;
pub mod panic;
pub mod rewind_stream;
pub mod session;
pub mod timeout;
pub mod transport;

pub mod test_helpers;

pub use channel::{
    ClientDuplexSessionChannel,
    CommunicationState,
    ServerDuplexSessionChannel,
    SessionChannel,
};
pub use client::{ClientBuilder, ClientOperation, ServiceClient};
pub use config::{Timeouts, TransportSettings};
pub use dispatcher::{
    DispatchOperation,
    DispatchRuntime,
    EndpointDescription,
    InstanceContextMode,
    OperationContext,
    OperationError,
    ServiceHost,
    operation_fn,
};
/// Result type alias re-exported for convenience.
pub use error::{CommunicationError, FaultError, Result};
pub use message::{Message, MessageFault, MessageVersion};
pub use metrics::{CONNECTIONS_ACTIVE, Direction, ERRORS_TOTAL, FRAMING_FAULTS_TOTAL, MESSAGES_TOTAL};
pub use transport::{ChannelListener, TransportManager};
