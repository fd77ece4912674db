//! Service-level dispatch: routing, instance selection and execution.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::debug;

use super::{
    EndpointDispatcherTable,
    EndpointLookup,
    InstanceContextProvider,
    OperationContext,
    rpc::MessageRpc,
};
use crate::{
    message::{DISPATCHER_NAMESPACE, FaultCode, Message, MessageFault},
    session::SessionInfo,
};

/// Per-session dispatch state held by a channel handler.
#[derive(Debug)]
pub struct ChannelSession {
    info: SessionInfo,
    started: AtomicBool,
}

impl ChannelSession {
    /// Dispatch state for a fresh session.
    #[must_use]
    pub fn new(info: SessionInfo) -> Self {
        Self {
            info,
            started: AtomicBool::new(false),
        }
    }

    /// Session identity.
    #[must_use]
    pub fn info(&self) -> &SessionInfo { &self.info }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str { &self.info.id }

    /// Returns true once an operation has run on this session.
    #[must_use]
    pub fn is_started(&self) -> bool { self.started.load(Ordering::Acquire) }
}

/// What the channel handler does after a request.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Message to send back, if any.
    pub reply: Option<Message>,
    /// Abort the session instead of reading further requests.
    pub abort_session: bool,
    /// The operation ends the session.
    pub terminating: bool,
}

/// Routes requests of one service to its endpoints and runs them.
pub struct ServiceDispatcher {
    table: Arc<EndpointDispatcherTable>,
    provider: Arc<InstanceContextProvider>,
}

impl ServiceDispatcher {
    /// A dispatcher over `table` drawing instances from `provider`.
    #[must_use]
    pub fn new(table: Arc<EndpointDispatcherTable>, provider: Arc<InstanceContextProvider>) -> Self {
        Self { table, provider }
    }

    /// Endpoint table.
    #[must_use]
    pub fn table(&self) -> &Arc<EndpointDispatcherTable> { &self.table }

    /// Instance provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<InstanceContextProvider> { &self.provider }

    /// Handle one request received on `session`.
    pub async fn dispatch(&self, request: Message, session: &ChannelSession) -> DispatchOutcome {
        let endpoint = match self.table.lookup(&request) {
            EndpointLookup::Found(endpoint) => endpoint,
            EndpointLookup::ContractMismatch => return reject(&request, action_not_supported(&request)),
            EndpointLookup::NotFound => return reject(&request, destination_unreachable(&request)),
        };
        let runtime = endpoint.runtime();
        let Some(operation) = runtime.select_operation(request.headers().action()).cloned() else {
            return reject(&request, action_not_supported(&request));
        };
        if !session.is_started() && !operation.is_initiating() {
            return reject(&request, not_initiating(&request, operation.name()));
        }
        session.started.store(true, Ordering::Release);

        debug!(
            action = request.headers().action().unwrap_or_default(),
            operation = operation.name(),
            session = session.id(),
            "dispatching"
        );
        let instance = self.provider.acquire(session.id());
        let context = OperationContext::new(
            &request,
            Arc::clone(&instance),
            session.id(),
            endpoint.address().clone(),
        );
        let terminating = operation.is_terminating();
        let outcome = MessageRpc::new(request, operation, context).process(runtime).await;

        if outcome.abort_instance {
            self.provider.abort(&instance, session.id());
        } else {
            self.provider.release_call(&instance);
        }
        DispatchOutcome {
            reply: outcome.reply,
            abort_session: outcome.abort_session,
            terminating,
        }
    }

    /// The session ended; release what it held.
    pub fn release_session(&self, session: &ChannelSession, aborted: bool) {
        self.provider.release_session(session.id(), aborted);
    }
}

impl fmt::Debug for ServiceDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDispatcher")
            .field("endpoints", &self.table.endpoints().len())
            .field("provider", &self.provider)
            .finish()
    }
}

fn sender_fault(request: &Message, subcode: &str, reason: String) -> MessageFault {
    let version = request.version();
    let code = FaultCode::sender(version.envelope)
        .with_subcode(FaultCode::new(subcode, version.addressing.namespace()));
    MessageFault::new(code, reason)
}

fn destination_unreachable(request: &Message) -> MessageFault {
    let to = request
        .headers()
        .to()
        .or(request.properties().via.as_deref())
        .unwrap_or_default();
    sender_fault(
        request,
        "DestinationUnreachable",
        format!(
            "The message with To '{to}' cannot be processed at the receiver, due to an \
             AddressFilter mismatch at the EndpointDispatcher."
        ),
    )
}

fn action_not_supported(request: &Message) -> MessageFault {
    let action = request.headers().action().unwrap_or_default();
    sender_fault(
        request,
        "ActionNotSupported",
        format!(
            "The message with Action '{action}' cannot be processed at the receiver, due to a \
             ContractFilter mismatch at the EndpointDispatcher."
        ),
    )
}

fn not_initiating(request: &Message, operation: &str) -> MessageFault {
    let version = request.version();
    MessageFault::new(
        FaultCode::sender(version.envelope)
            .with_subcode(FaultCode::new("InvalidSessionOperation", DISPATCHER_NAMESPACE)),
        format!(
            "The operation '{operation}' cannot be the first operation to be called because \
             IsInitiating is false."
        ),
    )
}

fn reject(request: &Message, fault: MessageFault) -> DispatchOutcome {
    debug!(
        action = request.headers().action().unwrap_or_default(),
        reason = %fault.reason,
        "request rejected"
    );
    let mut reply = Message::fault(request.version(), fault);
    if let Some(id) = request.headers().message_id() {
        reply.headers_mut().set_relates_to(id);
    }
    DispatchOutcome {
        reply: Some(reply),
        ..DispatchOutcome::default()
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::{
        dispatcher::{
            DispatchOperation,
            DispatchRuntime,
            EndpointDispatcher,
            InstanceContextManager,
            InstanceContextMode,
            InstanceFactory,
            ServiceInstance,
            operation_fn,
        },
        message::MessageVersion,
    };

    fn dispatcher(mode: InstanceContextMode) -> ServiceDispatcher {
        let runtime = DispatchRuntime::new()
            .with_operation(DispatchOperation::new(
                "Singleton",
                "urn:singleton",
                operation_fn(|context: OperationContext, _| async move {
                    Ok(context.instance_context().is_singleton().to_string())
                }),
            ))
            .with_operation(
                DispatchOperation::new("Later", "urn:later", operation_fn(|_, _| async { Ok(()) }))
                    .initiating(false),
            )
            .with_operation(
                DispatchOperation::new("Bye", "urn:bye", operation_fn(|_, _| async { Ok(()) })).terminating(),
            );
        let endpoint = EndpointDispatcher::new(
            Url::parse("net.tcp://localhost/svc").expect("uri"),
            "Test",
            runtime,
        );
        let factory: InstanceFactory = Arc::new(|| Arc::new(()) as ServiceInstance);
        ServiceDispatcher::new(
            Arc::new(EndpointDispatcherTable::new(vec![Arc::new(endpoint)])),
            Arc::new(InstanceContextProvider::new(
                mode,
                factory,
                Arc::new(InstanceContextManager::new()),
            )),
        )
    }

    fn session() -> ChannelSession {
        ChannelSession::new(SessionInfo::new("net.tcp://localhost/svc", "application/soap+xml"))
    }

    fn request(to: &str, action: &str) -> Message {
        let mut message = Message::new(MessageVersion::default(), action, ());
        message.headers_mut().set_to(to);
        message.headers_mut().set_message_id("urn:uuid:1");
        message
    }

    fn fault(outcome: DispatchOutcome) -> MessageFault {
        let mut reply = outcome.reply.expect("reply");
        assert_eq!(reply.headers().relates_to(), Some("urn:uuid:1"));
        reply.read_body::<MessageFault>().expect("fault")
    }

    #[tokio::test]
    async fn unknown_address_is_destination_unreachable() {
        let outcome = dispatcher(InstanceContextMode::PerCall)
            .dispatch(request("net.tcp://localhost/nope", "urn:singleton"), &session())
            .await;
        let fault = fault(outcome);
        assert_eq!(fault.code.innermost().name, "DestinationUnreachable");
        assert!(fault.reason.contains("'net.tcp://localhost/nope'"));
    }

    #[tokio::test]
    async fn unknown_action_is_action_not_supported() {
        let outcome = dispatcher(InstanceContextMode::PerCall)
            .dispatch(request("net.tcp://localhost/svc", "urn:missing"), &session())
            .await;
        let fault = fault(outcome);
        assert_eq!(fault.code.innermost().name, "ActionNotSupported");
        assert!(fault.reason.contains("'urn:missing'"));
        assert!(fault.code.is_sender());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn dispatches_are_traced_with_their_action() {
        let outcome = dispatcher(InstanceContextMode::PerCall)
            .dispatch(request("net.tcp://localhost/svc", "urn:singleton"), &session())
            .await;
        assert!(outcome.reply.is_some());
        assert!(logs_contain("dispatching"));
        assert!(logs_contain("urn:singleton"));
    }

    #[tokio::test]
    async fn non_initiating_operations_cannot_start_a_session() {
        let dispatcher = dispatcher(InstanceContextMode::PerSession);
        let session = session();
        let outcome = dispatcher
            .dispatch(request("net.tcp://localhost/svc", "urn:later"), &session)
            .await;
        assert_eq!(fault(outcome).code.innermost().name, "InvalidSessionOperation");
        assert!(!session.is_started());

        dispatcher
            .dispatch(request("net.tcp://localhost/svc", "urn:singleton"), &session)
            .await;
        let outcome = dispatcher
            .dispatch(request("net.tcp://localhost/svc", "urn:later"), &session)
            .await;
        assert!(outcome.reply.is_some_and(|reply| !reply.is_fault()));
    }

    #[rstest::rstest]
    #[case(InstanceContextMode::Single, "true")]
    #[case(InstanceContextMode::PerSession, "false")]
    #[case(InstanceContextMode::PerCall, "false")]
    #[tokio::test]
    async fn operations_see_the_instance_mode(#[case] mode: InstanceContextMode, #[case] expected: &str) {
        let dispatcher = dispatcher(mode);
        let outcome = dispatcher
            .dispatch(request("net.tcp://localhost/svc", "urn:singleton"), &session())
            .await;
        let mut reply = outcome.reply.expect("reply");
        assert_eq!(reply.read_body::<String>().expect("body"), expected);
    }

    #[tokio::test]
    async fn terminating_operations_are_flagged() {
        let dispatcher = dispatcher(InstanceContextMode::PerSession);
        let session = session();
        let outcome = dispatcher
            .dispatch(request("net.tcp://localhost/svc", "urn:bye"), &session)
            .await;
        assert!(outcome.terminating);
        assert_eq!(dispatcher.provider().manager().len(), 1);
        dispatcher.release_session(&session, false);
        assert!(dispatcher.provider().manager().is_empty());
    }
}
