//! Execution of a single request against its operation.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use futures::FutureExt;
use log::error;

use super::{CorrelationState, DispatchOperation, DispatchRuntime, OperationContext, OperationError};
use crate::{
    message::{BodyContent, DISPATCHER_NAMESPACE, FaultCode, Message, MessageFault, MessageVersion},
    panic::format_panic,
};

/// Reason sent when an operation fails and details are withheld.
pub const INTERNAL_ERROR_REASON: &str =
    "The server was unable to process the request due to an internal error.";

/// How fault production went.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct FaultInfo {
    /// An error handler returned true from `handle_error`.
    pub handled: bool,
    /// Fault production finished without a handler panicking.
    pub consistent: bool,
}

/// What the session must do once a request finishes.
#[derive(Debug, Default)]
pub(crate) struct RpcOutcome {
    pub reply: Option<Message>,
    pub abort_session: bool,
    pub abort_instance: bool,
}

/// State of one request as it moves through the dispatch pipeline.
pub(crate) struct MessageRpc {
    request: Option<Message>,
    operation: Arc<DispatchOperation>,
    context: OperationContext,
    version: MessageVersion,
    message_id: Option<String>,
    correlation: Vec<CorrelationState>,
    reply: Option<Message>,
    error: Option<OperationError>,
    fault_info: FaultInfo,
}

impl MessageRpc {
    pub(crate) fn new(request: Message, operation: Arc<DispatchOperation>, context: OperationContext) -> Self {
        Self {
            version: request.version(),
            message_id: request.headers().message_id().map(str::to_owned),
            request: Some(request),
            operation,
            context,
            correlation: Vec::new(),
            reply: None,
            error: None,
            fault_info: FaultInfo {
                handled: false,
                consistent: true,
            },
        }
    }

    /// Run the request to completion.
    pub(crate) async fn process(mut self, runtime: &DispatchRuntime) -> RpcOutcome {
        if let Some(request) = self.request.take() {
            match self.check_headers(runtime, &request) {
                Ok(()) => self.invoke(runtime, request).await,
                Err(fault) => self.error = Some(OperationError::Fault(fault)),
            }
        }
        if let Some(error) = self.error.take() {
            self.handle_error(runtime, &error);
            self.error = Some(error);
        }
        self.before_send_reply(runtime);
        self.finish()
    }

    fn check_headers(&self, runtime: &DispatchRuntime, request: &Message) -> Result<(), MessageFault> {
        let Some(header) = runtime.not_understood(request).into_iter().next() else {
            return Ok(());
        };
        let envelope = self.version.envelope;
        Err(MessageFault::new(
            FaultCode::new("MustUnderstand", envelope.namespace()),
            format!(
                "The header '{}' from the namespace '{}' was not understood by the recipient of \
                 this message, causing the message to not be processed.",
                header.name, header.namespace
            ),
        ))
    }

    async fn invoke(&mut self, runtime: &DispatchRuntime, mut request: Message) {
        let context = self.context.clone();
        let operation = Arc::clone(&self.operation);
        let correlation = &mut self.correlation;
        let invoked = AssertUnwindSafe(async {
            for inspector in runtime.inspectors() {
                correlation.push(inspector.after_receive_request(&mut request, &context));
            }
            operation.invoker().invoke(context.clone(), request).await
        })
        .catch_unwind()
        .await;

        match invoked {
            Ok(Ok(body)) => {
                if !self.operation.is_one_way() {
                    self.reply = Some(self.build_reply(body));
                }
            }
            Ok(Err(error)) => self.error = Some(error),
            Err(panic) => {
                crate::metrics::inc_panics();
                let panic_msg = format_panic(panic.as_ref()).to_string();
                let operation = self.operation.name();
                // Emit via both `log` and `tracing` for tests that capture either.
                error!("operation panicked: panic={panic_msg}, operation={operation}");
                tracing::error!(panic = %panic_msg, %operation, "operation panicked");
                self.error = Some(OperationError::Panicked(panic_msg));
            }
        }
    }

    /// Hand the reply, fault or not, to the inspectors that saw the request.
    fn before_send_reply(&mut self, runtime: &DispatchRuntime) {
        let correlation = std::mem::take(&mut self.correlation);
        if let Some(reply) = self.reply.as_mut() {
            for (inspector, state) in runtime.inspectors().iter().zip(correlation) {
                inspector.before_send_reply(reply, state);
            }
        }
    }

    fn build_reply(&self, body: BodyContent) -> Message {
        let mut reply = Message::new(self.version, self.operation.reply_action(), body);
        if let Some(id) = &self.message_id {
            reply.headers_mut().set_relates_to(id);
        }
        for header in self.context.take_outgoing_headers() {
            reply.headers_mut().add(header);
        }
        reply
    }

    /// Run the error handler chain for `error`.
    ///
    /// A handler that panics leaves the fault in an unknown state; nothing
    /// is sent and the session is torn down.
    fn handle_error(&mut self, runtime: &DispatchRuntime, error: &OperationError) {
        let mut fault = match error {
            OperationError::Fault(fault) => Some(Message::fault(self.version, fault.clone())),
            _ => None,
        };

        for handler in runtime.error_handlers() {
            let provided = catch_unwind(AssertUnwindSafe(|| {
                handler.provide_fault(error, self.version, &mut fault);
            }));
            if let Err(panic) = provided {
                self.report_handler_panic(&*panic);
                return;
            }
        }

        if fault.is_none() {
            fault = Some(Message::fault(self.version, self.default_fault(runtime, error)));
        }

        for handler in runtime.error_handlers() {
            match catch_unwind(AssertUnwindSafe(|| handler.handle_error(error))) {
                Ok(handled) => self.fault_info.handled |= handled,
                Err(panic) => {
                    self.report_handler_panic(&*panic);
                    return;
                }
            }
        }

        if self.operation.is_one_way() {
            return;
        }
        if let Some(mut fault) = fault {
            if let Some(id) = &self.message_id {
                fault.headers_mut().set_relates_to(id);
            }
            self.reply = Some(fault);
        }
    }

    fn default_fault(&self, runtime: &DispatchRuntime, error: &OperationError) -> MessageFault {
        let code = FaultCode::receiver(self.version.envelope)
            .with_subcode(FaultCode::new("InternalServiceFault", DISPATCHER_NAMESPACE));
        if runtime.include_details() {
            MessageFault::new(code, error.to_string()).with_detail(format!("{error:?}"))
        } else {
            MessageFault::new(code, INTERNAL_ERROR_REASON)
        }
    }

    fn report_handler_panic(&mut self, panic: &(dyn std::any::Any + Send)) {
        crate::metrics::inc_panics();
        let panic_msg = format_panic(panic);
        error!("error handler panicked: panic={panic_msg}, operation={}", self.operation.name());
        tracing::error!(panic = %panic_msg, operation = %self.operation.name(), "error handler panicked");
        self.fault_info.consistent = false;
        self.reply = None;
    }

    fn finish(self) -> RpcOutcome {
        let Some(error) = self.error else {
            return RpcOutcome {
                reply: self.reply,
                ..RpcOutcome::default()
            };
        };
        let FaultInfo { handled, consistent } = self.fault_info;
        if !consistent {
            return RpcOutcome {
                reply: None,
                abort_session: true,
                abort_instance: true,
            };
        }
        RpcOutcome {
            reply: self.reply,
            abort_session: !handled && !error.is_declared_fault(),
            abort_instance: matches!(error, OperationError::Panicked(_)),
        }
    }
}
