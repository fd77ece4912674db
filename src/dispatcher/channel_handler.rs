//! Per-session request pump.

use std::{future, sync::Arc};

use log::{debug, warn};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::{ChannelSession, ServiceDispatcher, SessionRegistry};
use crate::channel::SessionChannel;

/// Drives one session channel: receive, dispatch, reply, until the session
/// ends.
///
/// After a terminating operation replies, the client has one close timeout
/// to end the session before the channel is aborted.
pub struct ChannelHandler {
    channel: Arc<dyn SessionChannel>,
    dispatcher: Arc<ServiceDispatcher>,
    sessions: Arc<SessionRegistry>,
    shutdown: CancellationToken,
}

impl ChannelHandler {
    /// A handler for `channel`. Cancelling `shutdown` closes the session.
    #[must_use]
    pub fn new(
        channel: Arc<dyn SessionChannel>,
        dispatcher: Arc<ServiceDispatcher>,
        sessions: Arc<SessionRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            channel,
            dispatcher,
            sessions,
            shutdown,
        }
    }

    /// Serve the session to completion.
    pub async fn run(self) {
        let session = ChannelSession::new(self.channel.session().clone());
        self.sessions.insert(&self.channel);
        debug!(
            "session started: session_id={}, via={}, remote_addr={:?}",
            session.id(),
            self.channel.via(),
            self.channel.remote_addr()
        );

        let aborted = self.pump(&session).await;

        self.dispatcher.release_session(&session, aborted);
        self.sessions.remove(session.id());
        debug!("session finished: session_id={}, aborted={aborted}", session.id());
    }

    /// Returns true if the session ended by abort.
    async fn pump(&self, session: &ChannelSession) -> bool {
        let timeouts = self.channel.timeouts();
        let mut terminate_at: Option<Instant> = None;
        loop {
            let deadline = async move {
                match terminate_at {
                    Some(at) => sleep_until(at).await,
                    None => future::pending().await,
                }
            };
            let received = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    return self.channel.close(timeouts.close).await.is_err();
                }
                () = deadline => {
                    warn!(
                        "session not closed after terminating operation, aborting: session_id={}",
                        session.id()
                    );
                    return self.abort().await;
                }
                received = self.channel.receive(timeouts.receive) => received,
            };

            let request = match received {
                Ok(Some(request)) => request,
                Ok(None) => return self.channel.close(timeouts.close).await.is_err(),
                Err(error) => {
                    debug!("session receive failed: error={error}, session_id={}", session.id());
                    return self.abort().await;
                }
            };

            let outcome = self.dispatcher.dispatch(request, session).await;
            if let Some(reply) = outcome.reply
                && let Err(error) = self.channel.send(&reply, timeouts.send).await
            {
                debug!("reply failed: error={error}, session_id={}", session.id());
                return self.abort().await;
            }
            if outcome.abort_session {
                return self.abort().await;
            }
            if outcome.terminating && terminate_at.is_none() {
                terminate_at = Some(Instant::now() + timeouts.close);
            }
        }
    }

    async fn abort(&self) -> bool {
        self.channel.abort().await;
        true
    }
}

impl std::fmt::Debug for ChannelHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandler")
            .field("session_id", &self.channel.session_id())
            .finish_non_exhaustive()
    }
}
