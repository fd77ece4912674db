//! Correlated calls over one duplex session.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::{sync::oneshot, task::JoinHandle};
use uuid::Uuid;

use super::ImmutableClientRuntime;
use crate::{
    channel::{ClientDuplexSessionChannel, CommunicationState},
    config::Timeouts,
    error::CommunicationError,
    message::{IntoBody, Message},
    timeout::TimeoutHelper,
};

type PendingReply = oneshot::Sender<Result<Message, CommunicationError>>;
type PendingCalls = DashMap<String, PendingReply>;

/// A connected client for one service endpoint.
///
/// Calls may run concurrently. Each request carries a fresh `MessageID`
/// and a background task hands every reply to the call whose id it names
/// in `RelatesTo`.
pub struct ServiceClient {
    channel: Arc<ClientDuplexSessionChannel>,
    runtime: ImmutableClientRuntime,
    pending: Arc<PendingCalls>,
    pump: Mutex<Option<JoinHandle<()>>>,
    to: String,
    timeouts: Timeouts,
}

impl ServiceClient {
    /// Serve calls over an open `channel`, addressing requests to `to`.
    #[must_use]
    pub fn new(channel: ClientDuplexSessionChannel, runtime: ImmutableClientRuntime, to: impl Into<String>) -> Self {
        let channel = Arc::new(channel);
        let runtime = runtime.with_version(channel.encoder().message_version());
        let timeouts = channel.timeouts();
        let pending = Arc::new(PendingCalls::new());
        let pump = tokio::spawn(pump_replies(
            Arc::clone(&channel),
            Arc::clone(&pending),
            timeouts.receive,
        ));
        Self {
            channel,
            runtime,
            pending,
            pump: Mutex::new(Some(pump)),
            to: to.into(),
            timeouts,
        }
    }

    /// The underlying session channel.
    #[must_use]
    pub fn channel(&self) -> &ClientDuplexSessionChannel { &self.channel }

    /// The contract the client calls.
    #[must_use]
    pub fn runtime(&self) -> &ImmutableClientRuntime { &self.runtime }

    /// State of the session.
    #[must_use]
    pub fn state(&self) -> CommunicationState { self.channel.state() }

    /// Calls still waiting for their reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize { self.pending.len() }

    /// Call the request-reply operation `operation` with `body` and wait
    /// for its reply. The send timeout covers the whole exchange.
    ///
    /// # Errors
    ///
    /// - [`CommunicationError::UnknownOperation`] for operations outside
    ///   the contract, [`CommunicationError::Protocol`] for one-way ones.
    /// - [`CommunicationError::Fault`] when the service answers with a
    ///   fault.
    /// - [`CommunicationError::Timeout`] naming `"call"`.
    /// - [`CommunicationError::Communication`] if the session ends first.
    pub async fn call(&self, operation: &str, body: impl IntoBody) -> Result<Message, CommunicationError> {
        let proxy = Arc::clone(self.runtime.operation(operation)?);
        if proxy.operation().is_one_way() {
            return Err(CommunicationError::Protocol(format!(
                "operation {operation} is one-way and has no reply"
            )));
        }
        let helper = TimeoutHelper::new(self.timeouts.send);
        let mut request = proxy.create_request(body);
        let id = format!("urn:uuid:{}", Uuid::new_v4());
        let anonymous = request.version().addressing.anonymous();
        let headers = request.headers_mut();
        headers.set_to(&self.to);
        headers.set_message_id(&id);
        headers.set_reply_to(anonymous);
        let states = self.runtime.before_send_request(&mut request);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        if let Err(error) = self.channel.send(&request, helper.remaining()).await {
            self.pending.remove(&id);
            return Err(error);
        }
        let received = match helper.run("call", rx).await {
            Ok(received) => received,
            Err(error) => {
                self.pending.remove(&id);
                return Err(error);
            }
        };
        let mut reply = received.map_err(|_| session_ended())??;
        self.runtime.after_receive_reply(&mut reply, states);
        proxy.process_reply(reply)
    }

    /// Send `body` to the one-way operation `operation`.
    ///
    /// # Errors
    ///
    /// [`CommunicationError::UnknownOperation`],
    /// [`CommunicationError::Protocol`] for request-reply operations, or the
    /// send failure.
    pub async fn call_one_way(&self, operation: &str, body: impl IntoBody) -> Result<(), CommunicationError> {
        let proxy = self.runtime.operation(operation)?;
        if !proxy.operation().is_one_way() {
            return Err(CommunicationError::Protocol(format!(
                "operation {operation} expects a reply; use call"
            )));
        }
        let mut request = proxy.create_request(body);
        request.headers_mut().set_to(&self.to);
        self.runtime.before_send_request(&mut request);
        self.channel.send(&request, self.timeouts.send).await
    }

    /// End the session: close the output session, wait for the service to
    /// end its own, then release the connection.
    ///
    /// Calls still pending fail with [`CommunicationError::Communication`].
    ///
    /// # Errors
    ///
    /// [`CommunicationError::Timeout`] naming `"close"` if the service does
    /// not end its session in time. The client is aborted in that case.
    pub async fn close(&self, timeout: Duration) -> Result<(), CommunicationError> {
        let helper = TimeoutHelper::new(timeout);
        if let Err(error) = self.channel.close_output_session(helper.remaining()).await {
            self.abort().await;
            return Err(error);
        }
        let pump = self.pump.lock().take();
        if let Some(pump) = pump
            && helper.run("close", pump).await.is_err()
        {
            warn!("service did not end its session: session_id={}", self.channel.session_id());
            self.abort().await;
            return Err(helper.elapsed("close"));
        }
        self.channel.close(helper.remaining()).await
    }

    /// Drop the connection. Pending calls fail.
    pub async fn abort(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.channel.abort().await;
        fail_pending(&self.pending, "the client was aborted");
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("to", &self.to)
            .field("session_id", &self.channel.session_id())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

async fn pump_replies(channel: Arc<ClientDuplexSessionChannel>, pending: Arc<PendingCalls>, timeout: Duration) {
    let reason = loop {
        match channel.receive(timeout).await {
            Ok(Some(reply)) => deliver(&pending, reply),
            Ok(None) => break "the service ended the session".to_owned(),
            Err(error) if error.is_timeout() => {}
            Err(error) => break error.to_string(),
        }
    };
    debug!(
        "reply pump stopped: reason={reason}, session_id={}",
        channel.session_id()
    );
    fail_pending(&pending, &reason);
}

fn deliver(pending: &PendingCalls, reply: Message) {
    let Some(id) = reply.headers().relates_to().map(str::to_owned) else {
        warn!("dropping reply without RelatesTo: action={:?}", reply.headers().action());
        return;
    };
    match pending.remove(&id) {
        Some((_, tx)) => {
            // The caller may have timed out already.
            let _ = tx.send(Ok(reply));
        }
        None => warn!("dropping reply to an unknown request: relates_to={id}"),
    }
}

fn fail_pending(pending: &PendingCalls, reason: &str) {
    let ids: Vec<String> = pending.iter().map(|entry| entry.key().clone()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(CommunicationError::Communication(reason.to_owned())));
        }
    }
}

fn session_ended() -> CommunicationError {
    CommunicationError::Communication("the session ended before the reply arrived".to_owned())
}
