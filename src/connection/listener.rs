//! Sources of inbound connections.

use std::{io, net::SocketAddr, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use tokio::{net::TcpListener, select};
use tokio_util::sync::CancellationToken;

use super::Connection;
use crate::config::DEFAULT_CONNECTION_BUFFER_SIZE;

/// An accept operation in flight.
pub type AcceptFuture = BoxFuture<'static, io::Result<Connection>>;

/// A listener the [`ConnectionAcceptor`](super::ConnectionAcceptor) pumps.
///
/// Starting an accept is split from completing it: `start_accept` fails
/// synchronously when the listener cannot accept at all (for example after
/// [`close`](Self::close)), while the returned future reports failures of
/// that particular accept.
#[cfg_attr(test, mockall::automock)]
pub trait AcceptListener: Send + Sync {
    /// Begin accepting one connection.
    ///
    /// # Errors
    ///
    /// Fails if the listener can no longer accept.
    fn start_accept(&self) -> io::Result<AcceptFuture>;

    /// Local address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Propagates the socket error when the address is unavailable.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Stop accepting. Pending accepts complete with an error.
    fn close(&self);
}

/// [`AcceptListener`] over a tokio TCP listener.
#[derive(Debug)]
pub struct TcpAcceptListener {
    listener: Arc<TcpListener>,
    closed: CancellationToken,
    nodelay: bool,
    buffer_size: usize,
}

impl TcpAcceptListener {
    /// Bind a listener to `addr`.
    ///
    /// # Errors
    ///
    /// Returns the bind error, for example when the address is in use.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }

    /// Adopt an already bound standard-library listener.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be made non-blocking or registered with
    /// the runtime.
    pub fn from_std(listener: std::net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self::new(TcpListener::from_std(listener)?))
    }

    fn new(listener: TcpListener) -> Self {
        Self {
            listener: Arc::new(listener),
            closed: CancellationToken::new(),
            nodelay: true,
            buffer_size: DEFAULT_CONNECTION_BUFFER_SIZE,
        }
    }

    /// Read size used by accepted connections.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Toggle `TCP_NODELAY` on accepted sockets.
    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

fn closed_error() -> io::Error { io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed") }

impl AcceptListener for TcpAcceptListener {
    fn start_accept(&self) -> io::Result<AcceptFuture> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed"));
        }
        let listener = Arc::clone(&self.listener);
        let closed = self.closed.clone();
        let nodelay = self.nodelay;
        let buffer_size = self.buffer_size;
        Ok(async move {
            select! {
                biased;

                () = closed.cancelled() => Err(closed_error()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    stream.set_nodelay(nodelay)?;
                    Ok(Connection::new(stream, buffer_size).with_remote_addr(peer))
                }
            }
        }
        .boxed())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> { self.listener.local_addr() }

    fn close(&self) { self.closed.cancel(); }
}
