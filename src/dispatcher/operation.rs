//! Service operations and the context they run in.

use std::{fmt, future::Future, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use url::Url;

use super::InstanceContext;
use crate::message::{
    BodyContent,
    IntoBody,
    Message,
    MessageError,
    MessageFault,
    MessageHeader,
    MessageHeaders,
    MessageProperties,
};

/// Failure reported by a service operation.
#[derive(Debug, Error)]
pub enum OperationError {
    /// A fault the service chose to return; sent to the caller as is.
    #[error("{}", .0.reason)]
    Fault(MessageFault),
    /// The operation failed.
    #[error("{0}")]
    Failed(String),
    /// The operation panicked.
    #[error("operation panicked: {0}")]
    Panicked(String),
    /// The request body could not be read.
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl OperationError {
    /// Shorthand for [`OperationError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self { Self::Failed(reason.into()) }

    /// Returns true for faults the service returned on purpose.
    #[must_use]
    pub fn is_declared_fault(&self) -> bool { matches!(self, Self::Fault(_)) }
}

struct ContextInner {
    instance_context: Arc<InstanceContext>,
    session_id: String,
    endpoint_address: Url,
    action: Option<String>,
    request_headers: MessageHeaders,
    request_properties: MessageProperties,
    outgoing_headers: Mutex<Vec<MessageHeader>>,
}

/// Per-request state handed to an operation.
///
/// Cloning is cheap; clones share the outgoing headers.
#[derive(Clone)]
pub struct OperationContext {
    inner: Arc<ContextInner>,
}

impl OperationContext {
    pub(crate) fn new(
        request: &Message,
        instance_context: Arc<InstanceContext>,
        session_id: &str,
        endpoint_address: Url,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                instance_context,
                session_id: session_id.to_owned(),
                endpoint_address,
                action: request.headers().action().map(str::to_owned),
                request_headers: request.headers().clone(),
                request_properties: request.properties().clone(),
                outgoing_headers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The instance context serving this request.
    #[must_use]
    pub fn instance_context(&self) -> &Arc<InstanceContext> { &self.inner.instance_context }

    /// Identifier of the session the request arrived on.
    #[must_use]
    pub fn session_id(&self) -> &str { &self.inner.session_id }

    /// Address of the endpoint that accepted the request.
    #[must_use]
    pub fn endpoint_address(&self) -> &Url { &self.inner.endpoint_address }

    /// Action of the request.
    #[must_use]
    pub fn action(&self) -> Option<&str> { self.inner.action.as_deref() }

    /// Headers of the request.
    #[must_use]
    pub fn incoming_headers(&self) -> &MessageHeaders { &self.inner.request_headers }

    /// Transport properties of the request.
    #[must_use]
    pub fn incoming_properties(&self) -> &MessageProperties { &self.inner.request_properties }

    /// Add a header to the reply.
    pub fn add_outgoing_header(&self, header: MessageHeader) { self.inner.outgoing_headers.lock().push(header); }

    pub(crate) fn take_outgoing_headers(&self) -> Vec<MessageHeader> {
        std::mem::take(&mut *self.inner.outgoing_headers.lock())
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("session_id", &self.inner.session_id)
            .field("endpoint_address", &self.inner.endpoint_address.as_str())
            .field("action", &self.inner.action)
            .field("instance_context", &self.inner.instance_context.id())
            .finish_non_exhaustive()
    }
}

/// Runs the user code behind an operation.
#[async_trait]
pub trait OperationInvoker: Send + Sync {
    /// Handle `request` and produce the reply body.
    ///
    /// # Errors
    ///
    /// Any [`OperationError`] becomes a fault through the error handlers.
    async fn invoke(
        &self,
        context: OperationContext,
        request: Message,
    ) -> Result<BodyContent, OperationError>;
}

struct FnInvoker<F, R> {
    f: F,
    _reply: PhantomData<fn() -> R>,
}

#[async_trait]
impl<F, Fut, R> OperationInvoker for FnInvoker<F, R>
where
    F: Fn(OperationContext, Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, OperationError>> + Send,
    R: IntoBody + Send,
{
    async fn invoke(
        &self,
        context: OperationContext,
        request: Message,
    ) -> Result<BodyContent, OperationError> {
        (self.f)(context, request).await.map(IntoBody::into_body)
    }
}

/// Wrap an async closure as an [`OperationInvoker`].
///
/// ```
/// use corewcf::dispatcher::{OperationError, operation_fn};
///
/// let echo = operation_fn(|_context, mut request| async move {
///     request.read_body::<String>().map_err(OperationError::from)
/// });
/// # let _ = echo;
/// ```
pub fn operation_fn<F, Fut, R>(f: F) -> Arc<dyn OperationInvoker>
where
    F: Fn(OperationContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, OperationError>> + Send + 'static,
    R: IntoBody + Send + 'static,
{
    Arc::new(FnInvoker {
        f,
        _reply: PhantomData,
    })
}

/// One operation of a contract as the dispatcher sees it.
#[derive(Clone)]
pub struct DispatchOperation {
    name: String,
    action: String,
    reply_action: String,
    one_way: bool,
    initiating: bool,
    terminating: bool,
    invoker: Arc<dyn OperationInvoker>,
}

impl DispatchOperation {
    /// A request/reply operation answering `action` with
    /// `{action}Response`.
    pub fn new(
        name: impl Into<String>,
        action: impl Into<String>,
        invoker: Arc<dyn OperationInvoker>,
    ) -> Self {
        let action = action.into();
        Self {
            name: name.into(),
            reply_action: format!("{action}Response"),
            action,
            one_way: false,
            initiating: true,
            terminating: false,
            invoker,
        }
    }

    /// Override the reply action.
    #[must_use]
    pub fn with_reply_action(mut self, reply_action: impl Into<String>) -> Self {
        self.reply_action = reply_action.into();
        self
    }

    /// Send no reply.
    #[must_use]
    pub fn one_way(mut self) -> Self {
        self.one_way = true;
        self
    }

    /// End the session after this operation replies.
    #[must_use]
    pub fn terminating(mut self) -> Self {
        self.terminating = true;
        self
    }

    /// Whether the operation may start a session.
    #[must_use]
    pub fn initiating(mut self, initiating: bool) -> Self {
        self.initiating = initiating;
        self
    }

    /// Operation name.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Request action; `*` receives every unmatched action.
    #[must_use]
    pub fn action(&self) -> &str { &self.action }

    /// Reply action.
    #[must_use]
    pub fn reply_action(&self) -> &str { &self.reply_action }

    /// Returns true if no reply is sent.
    #[must_use]
    pub fn is_one_way(&self) -> bool { self.one_way }

    /// Returns true if the operation may start a session.
    #[must_use]
    pub fn is_initiating(&self) -> bool { self.initiating }

    /// Returns true if the operation ends the session.
    #[must_use]
    pub fn is_terminating(&self) -> bool { self.terminating }

    /// The user code.
    #[must_use]
    pub fn invoker(&self) -> &Arc<dyn OperationInvoker> { &self.invoker }
}

impl fmt::Debug for DispatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchOperation")
            .field("name", &self.name)
            .field("action", &self.action)
            .field("reply_action", &self.reply_action)
            .field("one_way", &self.one_way)
            .field("initiating", &self.initiating)
            .field("terminating", &self.terminating)
            .finish_non_exhaustive()
    }
}
