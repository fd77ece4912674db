//! Operations and inspectors shared by every call of a client.

use std::{collections::HashMap, fmt, sync::Arc};

use super::{ClientOperation, ProxyOperationRuntime};
use crate::{
    dispatcher::CorrelationState,
    error::CommunicationError,
    message::{Message, MessageVersion},
};

/// Observes and edits messages around a client call.
pub trait ClientMessageInspector: Send + Sync {
    /// Called with each request before it is sent.
    fn before_send_request(&self, request: &mut Message) -> CorrelationState;

    /// Called with the reply to a request, with the state returned for it.
    fn after_receive_reply(&self, reply: &mut Message, correlation: CorrelationState);
}

/// The contract a client was built for. Fixed once the client connects.
#[derive(Clone, Default)]
pub struct ImmutableClientRuntime {
    operations: HashMap<String, Arc<ProxyOperationRuntime>>,
    inspectors: Vec<Arc<dyn ClientMessageInspector>>,
    version: MessageVersion,
}

impl ImmutableClientRuntime {
    /// An empty runtime producing messages of `version`.
    #[must_use]
    pub fn new(version: MessageVersion) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// Add an operation, replacing any with the same name.
    #[must_use]
    pub fn with_operation(mut self, operation: ClientOperation) -> Self {
        let name = operation.name().to_owned();
        self.operations
            .insert(name, Arc::new(ProxyOperationRuntime::new(operation, self.version)));
        self
    }

    /// Add an inspector. Inspectors run in the order they were added.
    #[must_use]
    pub fn with_inspector(mut self, inspector: Arc<dyn ClientMessageInspector>) -> Self {
        self.inspectors.push(inspector);
        self
    }

    /// Message version of created requests.
    #[must_use]
    pub fn version(&self) -> MessageVersion { self.version }

    /// The runtime of the operation called `name`.
    ///
    /// # Errors
    ///
    /// [`CommunicationError::UnknownOperation`] if the contract has no such
    /// operation.
    pub fn operation(&self, name: &str) -> Result<&Arc<ProxyOperationRuntime>, CommunicationError> {
        self.operations
            .get(name)
            .ok_or_else(|| CommunicationError::UnknownOperation(name.to_owned()))
    }

    /// Run every inspector over an outgoing request.
    pub fn before_send_request(&self, request: &mut Message) -> Vec<CorrelationState> {
        self.inspectors
            .iter()
            .map(|inspector| inspector.before_send_request(request))
            .collect()
    }

    /// Hand each inspector the reply and the state it returned for the
    /// request.
    pub fn after_receive_reply(&self, reply: &mut Message, states: Vec<CorrelationState>) {
        for (inspector, state) in self.inspectors.iter().zip(states) {
            inspector.after_receive_reply(reply, state);
        }
    }

    pub(crate) fn with_version(mut self, version: MessageVersion) -> Self {
        if self.version != version {
            self.version = version;
            self.operations = self
                .operations
                .into_iter()
                .map(|(name, op)| {
                    let operation = op.operation().clone();
                    (name, Arc::new(ProxyOperationRuntime::new(operation, version)))
                })
                .collect();
        }
        self
    }
}

impl fmt::Debug for ImmutableClientRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.operations.keys().collect();
        names.sort();
        f.debug_struct("ImmutableClientRuntime")
            .field("operations", &names)
            .field("inspectors", &self.inspectors.len())
            .field("version", &self.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::message::MessageHeader;

    const NS: &str = "urn:test";

    struct Tagger(Mutex<Vec<String>>);

    impl ClientMessageInspector for Tagger {
        fn before_send_request(&self, request: &mut Message) -> CorrelationState {
            request.headers_mut().add(MessageHeader::new("Tag", NS, "out"));
            Some(Box::new(request.headers().action().unwrap_or_default().to_owned()))
        }

        fn after_receive_reply(&self, _reply: &mut Message, correlation: CorrelationState) {
            let action = correlation
                .and_then(|state| state.downcast::<String>().ok())
                .map_or_else(String::new, |action| *action);
            self.0.lock().expect("lock").push(action);
        }
    }

    #[test]
    fn unknown_operations_are_reported_by_name() {
        let runtime = ImmutableClientRuntime::default().with_operation(ClientOperation::new("Add", "urn:add"));
        assert!(runtime.operation("Add").is_ok());
        assert!(matches!(
            runtime.operation("Divide"),
            Err(CommunicationError::UnknownOperation(name)) if name == "Divide"
        ));
    }

    #[test]
    fn inspectors_get_back_their_correlation_state() {
        let tagger = Arc::new(Tagger(Mutex::new(Vec::new())));
        let runtime = ImmutableClientRuntime::default()
            .with_operation(ClientOperation::new("Add", "urn:add"))
            .with_inspector(tagger.clone());

        let mut request = runtime.operation("Add").expect("op").create_request("1");
        let states = runtime.before_send_request(&mut request);
        assert!(request.headers().get("Tag", NS).is_some());

        let mut reply = Message::new(runtime.version(), "urn:addResponse", "2");
        runtime.after_receive_reply(&mut reply, states);
        assert_eq!(*tagger.0.lock().expect("lock"), vec!["urn:add".to_owned()]);
    }

    #[test]
    fn changing_the_version_rebuilds_operations() {
        let runtime = ImmutableClientRuntime::default()
            .with_operation(ClientOperation::new("Add", "urn:add"))
            .with_version(MessageVersion::SOAP11_WSADDRESSING10);
        let request = runtime.operation("Add").expect("op").create_request(());
        assert_eq!(request.version(), MessageVersion::SOAP11_WSADDRESSING10);
    }
}
