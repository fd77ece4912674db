#![cfg(any(test, feature = "test-helpers"))]
//! Test-only helpers for shared test utilities.
//!
//! [`MemoryListener`] stands in for a TCP socket so transports and hosts can
//! be driven over in-memory duplex streams.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use futures::FutureExt;
use tokio::{
    io::duplex,
    sync::{Mutex, mpsc},
};
use tokio_util::sync::CancellationToken;

use crate::connection::{AcceptFuture, AcceptListener, Connection};

/// Buffer size of the duplex pipes created by [`MemoryDialer::dial`].
pub const PIPE_CAPACITY: usize = 1 << 16;

/// Read buffer size of connections created by [`MemoryDialer::dial`].
pub const CONNECTION_BUFFER: usize = 1024;

/// An [`AcceptListener`] fed by a [`MemoryDialer`].
pub struct MemoryListener {
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Connection>>>,
    closed: CancellationToken,
    port: u16,
}

impl MemoryListener {
    /// A listener reporting `port` as its local port, and the dialer that
    /// reaches it.
    #[must_use]
    pub fn new(port: u16) -> (Arc<Self>, MemoryDialer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Self {
            queue: Arc::new(Mutex::new(rx)),
            closed: CancellationToken::new(),
            port,
        });
        (listener, MemoryDialer(tx))
    }
}

impl AcceptListener for MemoryListener {
    fn start_accept(&self) -> io::Result<AcceptFuture> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed"));
        }
        let queue = Arc::clone(&self.queue);
        let closed = self.closed.clone();
        Ok(async move {
            let aborted = || io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed");
            tokio::select! {
                biased;
                () = closed.cancelled() => Err(aborted()),
                connection = async { queue.lock().await.recv().await } => connection.ok_or_else(aborted),
            }
        }
        .boxed())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, self.port)))
    }

    fn close(&self) { self.closed.cancel(); }
}

impl std::fmt::Debug for MemoryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryListener")
            .field("port", &self.port)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Opens in-memory connections to a [`MemoryListener`].
#[derive(Clone, Debug)]
pub struct MemoryDialer(mpsc::UnboundedSender<Connection>);

impl MemoryDialer {
    /// Connect, returning the client end.
    ///
    /// # Errors
    ///
    /// Fails once the listener has been dropped.
    pub fn dial(&self) -> io::Result<Connection> {
        let (server, client) = duplex(PIPE_CAPACITY);
        self.0
            .send(Connection::new(server, CONNECTION_BUFFER))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener dropped"))?;
        Ok(Connection::new(client, CONNECTION_BUFFER))
    }
}
