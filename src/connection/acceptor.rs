//! Bounded accept pump.
//!
//! [`ConnectionAcceptor`] keeps up to `max_accepts` accepts outstanding
//! while the number of accepted-but-not-released connections plus
//! outstanding accepts stays under `max_pending_connections`. Each accepted
//! connection is handed to the callback with a [`Dequeued`] token; releasing
//! the token frees the slot and lets the pump accept again.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use log::{debug, error, warn};
use tokio::sync::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{AcceptFuture, AcceptListener, BackoffConfig, Connection};

/// Receives each accepted connection.
pub type ConnectionCallback = Arc<dyn Fn(Connection, Dequeued) + Send + Sync>;

/// Receives accept failures that are not transient.
pub type ErrorCallback = Arc<dyn Fn(io::Error) + Send + Sync>;

/// Limits applied by a [`ConnectionAcceptor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcceptorSettings {
    /// Accepts outstanding at once.
    pub max_accepts: usize,
    /// Accepted connections plus outstanding accepts allowed at once.
    pub max_pending_connections: usize,
    /// Delay applied after failed accepts.
    pub backoff: BackoffConfig,
}

impl Default for AcceptorSettings {
    fn default() -> Self {
        Self {
            max_accepts: 10,
            max_pending_connections: 100,
            backoff: BackoffConfig::default(),
        }
    }
}

impl AcceptorSettings {
    fn normalized(self) -> Self {
        let max_pending_connections = self.max_pending_connections.max(1);
        Self {
            max_accepts: self.max_accepts.clamp(1, max_pending_connections),
            max_pending_connections,
            backoff: self.backoff.normalized(),
        }
    }
}

#[derive(Debug)]
struct AcceptorState {
    connections: usize,
    pending_accepts: usize,
    disposed: bool,
    delay: Duration,
    retry_scheduled: bool,
}

struct Inner {
    listener: Arc<dyn AcceptListener>,
    settings: AcceptorSettings,
    callback: ConnectionCallback,
    error_callback: Option<ErrorCallback>,
    state: Mutex<AcceptorState>,
    connections: AtomicUsize,
    pending_accepts: AtomicUsize,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Inner {
    fn publish(&self, state: &AcceptorState) {
        self.connections.store(state.connections, Ordering::Release);
        self.pending_accepts.store(state.pending_accepts, Ordering::Release);
    }

    /// Sleep for `delay`; false if the acceptor was disposed meanwhile.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn report(&self, error: io::Error) {
        crate::metrics::inc_errors();
        match &self.error_callback {
            Some(callback) => callback(error),
            None => {
                let local_addr = self.listener.local_addr().ok();
                error!("accept error: error={error:?}, local_addr={local_addr:?}");
            }
        }
    }
}

/// Errors that leave the listener usable.
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Pumps accepts from an [`AcceptListener`] within configured limits.
#[derive(Clone)]
pub struct ConnectionAcceptor {
    inner: Arc<Inner>,
}

impl ConnectionAcceptor {
    /// Create an acceptor. Nothing is accepted until
    /// [`start_accepting`](Self::start_accepting).
    pub fn new(
        listener: Arc<dyn AcceptListener>,
        settings: AcceptorSettings,
        callback: ConnectionCallback,
        error_callback: Option<ErrorCallback>,
    ) -> Self {
        let settings = settings.normalized();
        Self {
            inner: Arc::new(Inner {
                listener,
                settings,
                callback,
                error_callback,
                state: Mutex::new(AcceptorState {
                    connections: 0,
                    pending_accepts: 0,
                    disposed: false,
                    delay: settings.backoff.initial_delay,
                    retry_scheduled: false,
                }),
                connections: AtomicUsize::new(0),
                pending_accepts: AtomicUsize::new(0),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Issue the first round of accepts.
    ///
    /// # Errors
    ///
    /// Returns the listener's error if an accept cannot be started. Later
    /// failures go to the error callback instead.
    pub async fn start_accepting(&self) -> io::Result<()> {
        accept_if_necessary(Arc::clone(&self.inner), true).await
    }

    /// Accepted connections whose [`Dequeued`] token is still held.
    #[must_use]
    pub fn connection_count(&self) -> usize { self.inner.connections.load(Ordering::Acquire) }

    /// Accepts currently outstanding.
    #[must_use]
    pub fn pending_accepts(&self) -> usize { self.inner.pending_accepts.load(Ordering::Acquire) }

    /// Local address of the listener.
    ///
    /// # Errors
    ///
    /// Propagates the listener's error.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> { self.inner.listener.local_addr() }

    /// Stop accepting and close the listener. Safe to call more than once;
    /// the listener is closed exactly once.
    pub async fn dispose(&self) {
        let mut state = self.inner.state.lock().await;
        if state.disposed {
            return;
        }
        state.disposed = true;
        self.inner.listener.close();
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
    }

    /// Wait for outstanding accept tasks after [`dispose`](Self::dispose).
    pub async fn wait(&self) { self.inner.tracker.wait().await; }
}

impl std::fmt::Debug for ConnectionAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAcceptor")
            .field("settings", &self.inner.settings)
            .field("connections", &self.connection_count())
            .field("pending_accepts", &self.pending_accepts())
            .finish_non_exhaustive()
    }
}

fn accept_if_necessary(inner: Arc<Inner>, start: bool) -> BoxFuture<'static, io::Result<()>> {
    async move {
        let mut state = inner.state.lock().await;
        let limits = inner.settings;
        while !state.disposed
            && state.pending_accepts < limits.max_accepts
            && state.connections + state.pending_accepts < limits.max_pending_connections
        {
            match inner.listener.start_accept() {
                Ok(accept) => {
                    state.pending_accepts += 1;
                    inner.publish(&state);
                    inner.tracker.spawn(complete_accept(Arc::clone(&inner), accept));
                }
                Err(e) if start => return Err(e),
                Err(e) => {
                    // Outstanding accepts resume the pump when they complete.
                    let delay = state.delay;
                    state.delay = limits.backoff.next(delay);
                    let retry = state.pending_accepts == 0 && !state.retry_scheduled;
                    state.retry_scheduled |= retry;
                    drop(state);
                    warn!("accept could not start: error={e:?}, retry_in={delay:?}");
                    inner.report(e);
                    if retry {
                        inner.tracker.spawn(retry_accept(Arc::clone(&inner), delay));
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }
    .boxed()
}

async fn complete_accept(inner: Arc<Inner>, accept: AcceptFuture) {
    let result = accept.await;
    let mut state = inner.state.lock().await;
    state.pending_accepts -= 1;
    if state.disposed {
        inner.publish(&state);
        return;
    }
    match result {
        Ok(connection) => {
            state.connections += 1;
            state.delay = inner.settings.backoff.initial_delay;
            inner.publish(&state);
            drop(state);
            crate::metrics::inc_connections();
            (inner.callback)(connection, Dequeued::new(Arc::clone(&inner)));
        }
        Err(e) if is_transient(&e) => {
            inner.publish(&state);
            drop(state);
            debug!("accept interrupted: error={e}");
        }
        Err(e) => {
            let delay = state.delay;
            state.delay = inner.settings.backoff.next(delay);
            inner.publish(&state);
            drop(state);
            warn!("accept failed: error={e:?}, retry_in={delay:?}");
            inner.report(e);
            if !inner.pause(delay).await {
                return;
            }
        }
    }
    if let Err(e) = accept_if_necessary(inner.clone(), false).await {
        inner.report(e);
    }
}

async fn retry_accept(inner: Arc<Inner>, delay: Duration) {
    if !inner.pause(delay).await {
        return;
    }
    inner.state.lock().await.retry_scheduled = false;
    if let Err(e) = accept_if_necessary(Arc::clone(&inner), false).await {
        inner.report(e);
    }
}

/// Token held while an accepted connection occupies a slot.
///
/// Call [`complete`](Self::complete) once the connection has been handed
/// off or closed. Dropping the token has the same effect.
pub struct Dequeued {
    inner: Option<Arc<Inner>>,
}

impl Dequeued {
    fn new(inner: Arc<Inner>) -> Self { Self { inner: Some(inner) } }

    /// Release the slot and let the acceptor accept again.
    pub async fn complete(mut self) {
        if let Some(inner) = self.inner.take() {
            release(inner).await;
        }
    }
}

impl Drop for Dequeued {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take()
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(release(inner));
        }
    }
}

impl std::fmt::Debug for Dequeued {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dequeued")
            .field("released", &self.inner.is_none())
            .finish()
    }
}

async fn release(inner: Arc<Inner>) {
    {
        let mut state = inner.state.lock().await;
        state.connections = state.connections.saturating_sub(1);
        inner.publish(&state);
    }
    crate::metrics::dec_connections();
    if let Err(e) = accept_if_necessary(Arc::clone(&inner), false).await {
        inner.report(e);
    }
}
