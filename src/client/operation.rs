//! Client-side description of contract operations.

use crate::{
    error::{CommunicationError, FaultError},
    message::{IntoBody, Message, MessageFault, MessageVersion},
};

/// One operation of a contract as the client calls it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientOperation {
    name: String,
    action: String,
    reply_action: String,
    one_way: bool,
}

impl ClientOperation {
    /// A request-reply operation. The reply action defaults to
    /// `{action}Response`.
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        let action = action.into();
        Self {
            name: name.into(),
            reply_action: format!("{action}Response"),
            action,
            one_way: false,
        }
    }

    /// Expect replies with `reply_action`. `"*"` accepts any action.
    #[must_use]
    pub fn with_reply_action(mut self, reply_action: impl Into<String>) -> Self {
        self.reply_action = reply_action.into();
        self
    }

    /// Send requests without waiting for a reply.
    #[must_use]
    pub fn one_way(mut self) -> Self {
        self.one_way = true;
        self
    }

    /// Operation name.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Request action.
    #[must_use]
    pub fn action(&self) -> &str { &self.action }

    /// Expected reply action.
    #[must_use]
    pub fn reply_action(&self) -> &str { &self.reply_action }

    /// Returns true for operations without a reply.
    #[must_use]
    pub fn is_one_way(&self) -> bool { self.one_way }
}

/// Builds requests for an operation and interprets its replies.
#[derive(Clone, Debug)]
pub struct ProxyOperationRuntime {
    operation: ClientOperation,
    version: MessageVersion,
}

impl ProxyOperationRuntime {
    /// A runtime for `operation` producing messages of `version`.
    #[must_use]
    pub fn new(operation: ClientOperation, version: MessageVersion) -> Self { Self { operation, version } }

    /// The described operation.
    #[must_use]
    pub fn operation(&self) -> &ClientOperation { &self.operation }

    /// A request carrying `body` and the operation's action.
    pub fn create_request(&self, body: impl IntoBody) -> Message {
        Message::new(self.version, &self.operation.action, body)
    }

    /// Check `reply` and hand it back.
    ///
    /// # Errors
    ///
    /// - [`CommunicationError::Fault`] when the reply is a SOAP fault.
    /// - [`CommunicationError::Protocol`] when the reply carries an action
    ///   other than the expected reply action.
    pub fn process_reply(&self, mut reply: Message) -> Result<Message, CommunicationError> {
        if reply.is_fault() {
            let action = reply.headers().action().map(str::to_owned);
            let fault = reply.read_body::<MessageFault>()?;
            return Err(FaultError { fault, action }.into());
        }
        let expected = self.operation.reply_action.as_str();
        match reply.headers().action() {
            Some(action) if expected != "*" && action != expected => Err(CommunicationError::Protocol(
                format!("reply action {action} does not match the expected {expected}"),
            )),
            _ => Ok(reply),
        }
    }
}
