//! Per-endpoint channel listeners.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::StreamUpgradeAcceptor;
use crate::{
    buffer::{BufferManager, DEFAULT_POOL_SIZE},
    channel::{CommunicationObject, CommunicationState, ServerDuplexSessionChannel},
    config::TransportSettings,
    encoding::MessageEncoder,
    error::CommunicationError,
    framing::FramingFault,
};

/// Channels accepted but not yet taken by [`ChannelListener::accept_channel`].
pub const DEFAULT_CHANNEL_BACKLOG: usize = 16;

/// A reserved slot in a listener's queue.
pub(crate) type ChannelSlot = mpsc::OwnedPermit<ServerDuplexSessionChannel>;

/// Queues the session channels accepted for one endpoint address.
pub struct ChannelListener {
    uri: Url,
    encoder: Arc<dyn MessageEncoder>,
    settings: TransportSettings,
    buffers: BufferManager,
    upgrade: Option<Arc<dyn StreamUpgradeAcceptor>>,
    object: CommunicationObject,
    sender: mpsc::Sender<ServerDuplexSessionChannel>,
    receiver: Mutex<mpsc::Receiver<ServerDuplexSessionChannel>>,
    closed: CancellationToken,
}

impl ChannelListener {
    /// A listener for sessions addressed to `uri` that use `encoder`.
    pub fn new(uri: Url, encoder: Arc<dyn MessageEncoder>) -> Self {
        Self::with_settings(uri, encoder, TransportSettings::default(), DEFAULT_CHANNEL_BACKLOG)
    }

    /// A listener with explicit settings and queue capacity.
    pub fn with_settings(
        uri: Url,
        encoder: Arc<dyn MessageEncoder>,
        settings: TransportSettings,
        backlog: usize,
    ) -> Self {
        let settings = settings.normalized();
        let (sender, receiver) = mpsc::channel(backlog.max(1));
        Self {
            uri,
            encoder,
            buffers: BufferManager::new(DEFAULT_POOL_SIZE, settings.max_buffer_size),
            settings,
            upgrade: None,
            object: CommunicationObject::new("channel listener"),
            sender,
            receiver: Mutex::new(receiver),
            closed: CancellationToken::new(),
        }
    }

    /// Accept upgrade requests that `acceptor` supports.
    #[must_use]
    pub fn with_upgrade(mut self, acceptor: Arc<dyn StreamUpgradeAcceptor>) -> Self {
        self.upgrade = Some(acceptor);
        self
    }

    /// Address this listener serves.
    #[must_use]
    pub fn uri(&self) -> &Url { &self.uri }

    /// Encoder sessions must use.
    #[must_use]
    pub fn encoder(&self) -> &Arc<dyn MessageEncoder> { &self.encoder }

    /// Settings applied to accepted channels.
    #[must_use]
    pub fn settings(&self) -> &TransportSettings { &self.settings }

    /// Envelope pool shared by accepted channels.
    #[must_use]
    pub fn buffers(&self) -> &BufferManager { &self.buffers }

    /// Upgrade acceptor, if configured.
    #[must_use]
    pub fn upgrade(&self) -> Option<&Arc<dyn StreamUpgradeAcceptor>> { self.upgrade.as_ref() }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CommunicationState { self.object.state() }

    /// Start queueing channels.
    ///
    /// # Errors
    ///
    /// Fails unless the listener is newly created.
    pub fn open(&self) -> Result<(), CommunicationError> {
        self.object.begin_open()?;
        self.object.complete_open()
    }

    /// Wait for the next accepted channel; `None` once the listener closes.
    pub async fn accept_channel(&self) -> Option<ServerDuplexSessionChannel> {
        let mut receiver = tokio::select! {
            biased;
            () = self.closed.cancelled() => return None,
            receiver = self.receiver.lock() => receiver,
        };
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            channel = receiver.recv() => channel,
        }
    }

    /// Stop accepting. Queued channels that were never taken are aborted.
    pub async fn close(&self) {
        if !self.object.abort() {
            return;
        }
        self.closed.cancel();
        let mut receiver = self.receiver.lock().await;
        receiver.close();
        while let Ok(channel) = receiver.try_recv() {
            channel.abort().await;
        }
    }

    /// Reserve queue space for a session about to be acknowledged.
    ///
    /// Fails with the fault to send the client when the listener is not
    /// open or its queue is full.
    pub(crate) fn reserve(&self) -> Result<ChannelSlot, FramingFault> {
        if self.object.state() != CommunicationState::Opened {
            return Err(FramingFault::EndpointUnavailable);
        }
        self.sender.clone().try_reserve_owned().map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => FramingFault::ServerTooBusy,
            mpsc::error::TrySendError::Closed(_) => FramingFault::EndpointUnavailable,
        })
    }
}

impl std::fmt::Debug for ChannelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelListener")
            .field("uri", &self.uri.as_str())
            .field("content_type", &self.encoder.content_type())
            .field("state", &self.object.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::TextMessageEncoder;

    fn listener(backlog: usize) -> ChannelListener {
        ChannelListener::with_settings(
            Url::parse("net.tcp://localhost/svc").expect("uri"),
            Arc::new(TextMessageEncoder::soap12()),
            TransportSettings::default(),
            backlog,
        )
    }

    #[test]
    fn unopened_listener_is_unavailable() {
        let listener = listener(1);
        assert_eq!(listener.reserve().err(), Some(FramingFault::EndpointUnavailable));
    }

    #[test]
    fn full_queue_is_too_busy() {
        let listener = listener(1);
        listener.open().expect("open");
        let _held = listener.reserve().expect("first slot");
        assert_eq!(listener.reserve().err(), Some(FramingFault::ServerTooBusy));
    }

    #[tokio::test]
    async fn closing_wakes_a_pending_accept() {
        let listener = Arc::new(listener(1));
        listener.open().expect("open");
        let waiting = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept_channel().await })
        };
        tokio::task::yield_now().await;
        listener.close().await;
        assert!(waiting.await.expect("join").is_none());
        assert_eq!(listener.state(), CommunicationState::Closed);
    }
}
