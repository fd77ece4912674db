//! Per-endpoint dispatch configuration.

use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use super::{DispatchOperation, OperationContext, OperationError};
use crate::message::{Message, MessageHeader, MessageVersion};

/// State an inspector carries from a request to its reply.
pub type CorrelationState = Option<Box<dyn Any + Send>>;

/// Observes and edits messages around an operation.
pub trait DispatchMessageInspector: Send + Sync {
    /// Called with the request before the operation runs.
    fn after_receive_request(
        &self,
        request: &mut Message,
        context: &OperationContext,
    ) -> CorrelationState;

    /// Called with the reply before it is sent, with the state returned
    /// for its request.
    fn before_send_reply(&self, reply: &mut Message, correlation: CorrelationState);
}

/// Turns operation failures into faults and observes them.
///
/// Handlers run in registration order. Every handler sees
/// [`provide_fault`](Self::provide_fault) before any sees
/// [`handle_error`](Self::handle_error).
pub trait ErrorHandler: Send + Sync {
    /// Replace or fill in the fault sent for `error`. `fault` holds the
    /// fault produced so far, if any.
    fn provide_fault(&self, error: &OperationError, version: MessageVersion, fault: &mut Option<Message>);

    /// Observe `error` after the fault was produced. Returning true marks
    /// the error as handled, which keeps the session open.
    fn handle_error(&self, error: &OperationError) -> bool;
}

/// Operations and extensions of one endpoint.
#[derive(Clone, Default)]
pub struct DispatchRuntime {
    operations: HashMap<String, Arc<DispatchOperation>>,
    order: Vec<Arc<DispatchOperation>>,
    unhandled: Option<Arc<DispatchOperation>>,
    inspectors: Vec<Arc<dyn DispatchMessageInspector>>,
    error_handlers: Vec<Arc<dyn ErrorHandler>>,
    understood_headers: Vec<(String, String)>,
    validate_must_understand: bool,
    include_exception_detail: bool,
}

impl DispatchRuntime {
    /// An empty runtime that checks `mustUnderstand` headers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            validate_must_understand: true,
            ..Self::default()
        }
    }

    /// Add an operation. An action of `*` receives every action no other
    /// operation claims.
    #[must_use]
    pub fn with_operation(mut self, operation: DispatchOperation) -> Self {
        let operation = Arc::new(operation);
        if operation.action() == "*" {
            self.unhandled = Some(Arc::clone(&operation));
        } else {
            self.operations
                .insert(operation.action().to_owned(), Arc::clone(&operation));
        }
        self.order.push(operation);
        self
    }

    /// Add a message inspector.
    #[must_use]
    pub fn with_inspector(mut self, inspector: Arc<dyn DispatchMessageInspector>) -> Self {
        self.inspectors.push(inspector);
        self
    }

    /// Add an error handler.
    #[must_use]
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handlers.push(handler);
        self
    }

    /// Accept a `mustUnderstand` header by name and namespace.
    #[must_use]
    pub fn with_understood_header(mut self, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.understood_headers.push((name.into(), namespace.into()));
        self
    }

    /// Toggle the `mustUnderstand` check.
    #[must_use]
    pub fn validate_must_understand(mut self, validate: bool) -> Self {
        self.validate_must_understand = validate;
        self
    }

    /// Put failure details into faults instead of a generic reason.
    #[must_use]
    pub fn include_exception_detail(mut self, include: bool) -> Self {
        self.include_exception_detail = include;
        self
    }

    /// The operation answering `action`.
    #[must_use]
    pub fn select_operation(&self, action: Option<&str>) -> Option<&Arc<DispatchOperation>> {
        action
            .and_then(|action| self.operations.get(action))
            .or(self.unhandled.as_ref())
    }

    /// Operations in the order they were added.
    pub fn operations(&self) -> impl Iterator<Item = &Arc<DispatchOperation>> { self.order.iter() }

    /// Returns true if no operation was added.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.order.is_empty() }

    /// Returns true if some operation accepts every action.
    #[must_use]
    pub fn has_unhandled_operation(&self) -> bool { self.unhandled.is_some() }

    pub(crate) fn inspectors(&self) -> &[Arc<dyn DispatchMessageInspector>] { &self.inspectors }

    pub(crate) fn error_handlers(&self) -> &[Arc<dyn ErrorHandler>] { &self.error_handlers }

    pub(crate) fn include_details(&self) -> bool { self.include_exception_detail }

    /// `mustUnderstand` headers in `request` that nothing here understands.
    pub(crate) fn not_understood<'a>(&'a self, request: &'a Message) -> Vec<&'a MessageHeader> {
        if !self.validate_must_understand {
            return Vec::new();
        }
        request
            .headers()
            .not_understood(|header| {
                self.understood_headers
                    .iter()
                    .any(|(name, namespace)| header.name == *name && header.namespace == *namespace)
            })
            .collect()
    }
}

impl fmt::Debug for DispatchRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRuntime")
            .field("operations", &self.order)
            .field("inspectors", &self.inspectors.len())
            .field("error_handlers", &self.error_handlers.len())
            .field("validate_must_understand", &self.validate_must_understand)
            .finish_non_exhaustive()
    }
}
