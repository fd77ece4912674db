//! Server-side dispatch: from accepted session channels to service code.
//!
//! A [`ServiceHost`] registers one [`ChannelListener`](crate::transport::ChannelListener)
//! per endpoint address with a [`TransportManager`](crate::transport::TransportManager).
//! A [`ListenerHandler`] takes each accepted channel and runs a
//! [`ChannelHandler`] for it, which receives requests and hands them to the
//! [`ServiceDispatcher`]. The dispatcher routes each request through the
//! [`EndpointDispatcherTable`] by address and action, picks an
//! [`InstanceContext`] according to the service's [`InstanceContextMode`],
//! and runs the matching [`DispatchOperation`] with its inspectors and
//! error handlers.

mod channel_handler;
mod endpoint;
mod filter;
mod host;
mod instance;
mod listener_handler;
mod operation;
mod registry;
mod rpc;
mod runtime;
mod service;
mod uri_table;

pub use channel_handler::ChannelHandler;
pub use endpoint::{EndpointDispatcher, EndpointDispatcherTable, EndpointLookup};
pub use filter::{
    ActionMessageFilter,
    AndMessageFilter,
    EndpointAddressMessageFilter,
    MatchAllMessageFilter,
    MatchNoneMessageFilter,
    MessageFilter,
    PrefixEndpointAddressMessageFilter,
    PrefixEndpointAddressMessageFilterTable,
};
pub use host::{EndpointDescription, HostError, ServiceHost, ServiceHostBuilder};
pub use instance::{
    InstanceContext,
    InstanceContextManager,
    InstanceContextMode,
    InstanceContextProvider,
    InstanceFactory,
    InstanceId,
    ServiceInstance,
};
pub use listener_handler::ListenerHandler;
pub use operation::{DispatchOperation, OperationContext, OperationError, OperationInvoker, operation_fn};
pub use registry::SessionRegistry;
pub use rpc::INTERNAL_ERROR_REASON;
pub use runtime::{CorrelationState, DispatchMessageInspector, DispatchRuntime, ErrorHandler};
pub use service::{ChannelSession, DispatchOutcome, ServiceDispatcher};
pub use uri_table::{DEFAULT_NET_TCP_PORT, HostNameComparisonMode, UriPrefixTable, effective_port};
