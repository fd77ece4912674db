//! Accept loop feeding a listener's channels to channel handlers.

use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use log::{debug, error};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{ChannelHandler, ServiceDispatcher, SessionRegistry};
use crate::{channel::SessionChannel, transport::ChannelListener};

/// Takes channels from one [`ChannelListener`] and serves each on its own
/// task.
pub struct ListenerHandler {
    listener: Arc<ChannelListener>,
    dispatcher: Arc<ServiceDispatcher>,
    sessions: Arc<SessionRegistry>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ListenerHandler {
    /// A handler spawning session tasks on `tracker`.
    #[must_use]
    pub fn new(
        listener: Arc<ChannelListener>,
        dispatcher: Arc<ServiceDispatcher>,
        sessions: Arc<SessionRegistry>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            listener,
            dispatcher,
            sessions,
            tracker,
            shutdown,
        }
    }

    /// Accept until the listener closes or shutdown is requested.
    pub async fn run(self) {
        let uri = self.listener.uri().clone();
        loop {
            let channel = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                channel = self.listener.accept_channel() => channel,
            };
            let Some(channel) = channel else { break };
            self.spawn(Arc::new(channel));
        }
        debug!("listener handler stopped: uri={uri}");
    }

    fn spawn(&self, channel: Arc<dyn SessionChannel>) {
        let session_id = channel.session_id().to_owned();
        let dispatcher = Arc::clone(&self.dispatcher);
        let sessions = Arc::clone(&self.sessions);
        let handler = ChannelHandler::new(
            channel,
            Arc::clone(&dispatcher),
            Arc::clone(&sessions),
            self.shutdown.child_token(),
        );
        self.tracker.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(handler.run()).catch_unwind().await {
                crate::metrics::inc_panics();
                {
                    let panic_msg = crate::panic::format_panic(panic.as_ref());
                    // Emit via both `log` and `tracing` for tests that capture either.
                    error!("channel handler panicked: panic={panic_msg}, session_id={session_id}");
                    tracing::error!(panic = %panic_msg, %session_id, "channel handler panicked");
                }
                dispatcher.provider().release_session(&session_id, true);
                if let Some(channel) = sessions.get(&session_id) {
                    channel.abort().await;
                }
                sessions.remove(&session_id);
            }
        });
    }
}

impl std::fmt::Debug for ListenerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandler")
            .field("uri", &self.listener.uri().as_str())
            .finish_non_exhaustive()
    }
}
