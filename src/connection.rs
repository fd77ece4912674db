//! Owned byte-stream connections.
//!
//! A [`Connection`] erases the transport (TCP, an in-memory duplex, an
//! upgraded TLS stream) behind [`ConnectionStream`] and carries a reusable
//! read buffer. Bytes read but not yet consumed stay in that buffer, so a
//! connection can be handed from the preamble reader to a session channel
//! without losing data.

mod acceptor;
mod backoff;
mod listener;

use std::{io, net::SocketAddr};

pub use acceptor::{AcceptorSettings, ConnectionAcceptor, ConnectionCallback, Dequeued, ErrorCallback};
pub use backoff::BackoffConfig;
use bytes::{Buf, Bytes, BytesMut};
pub use listener::{AcceptFuture, AcceptListener, TcpAcceptListener};
#[cfg(test)]
pub use listener::MockAcceptListener;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::rewind_stream::RewindStream;

/// Any bidirectional byte stream a connection can own.
pub trait ConnectionStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ConnectionStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Read buffer shared by [`Connection`] and [`ConnectionReader`].
#[derive(Debug)]
struct InputBuffer {
    bytes: BytesMut,
    chunk: usize,
}

impl InputBuffer {
    fn new(chunk: usize) -> Self {
        Self {
            bytes: BytesMut::with_capacity(chunk),
            chunk: chunk.max(1),
        }
    }

    async fn fill<R: AsyncRead + Unpin>(&mut self, source: &mut R) -> io::Result<usize> {
        self.bytes.reserve(self.chunk);
        source.read_buf(&mut self.bytes).await
    }

    fn consume(&mut self, count: usize) { self.bytes.advance(count.min(self.bytes.len())); }
}

/// An owned, type-erased connection with a reusable read buffer.
pub struct Connection {
    stream: Box<dyn ConnectionStream>,
    input: InputBuffer,
    remote_addr: Option<SocketAddr>,
}

impl Connection {
    /// Wrap `stream`, reading at most `buffer_size` bytes per call.
    pub fn new(stream: impl ConnectionStream, buffer_size: usize) -> Self {
        Self {
            stream: Box::new(stream),
            input: InputBuffer::new(buffer_size),
            remote_addr: None,
        }
    }

    /// Record the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Address of the peer, when known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Size of each read issued against the stream.
    #[must_use]
    pub fn buffer_size(&self) -> usize { self.input.chunk }

    /// Bytes read from the stream but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> &[u8] { &self.input.bytes }

    /// Discard the first `count` buffered bytes.
    pub fn consume(&mut self, count: usize) { self.input.consume(count); }

    /// Read more bytes into the buffer, returning the number read.
    /// Zero means the peer closed its side.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the stream.
    pub async fn fill(&mut self) -> io::Result<usize> { self.input.fill(&mut self.stream).await }

    /// Write all of `bytes` and flush.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the stream.
    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Shut down the write side gracefully.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the stream.
    pub async fn shutdown(&mut self) -> io::Result<()> { self.stream.shutdown().await }

    /// Drop the connection without any handshake.
    pub fn abort(self) { drop(self); }

    /// Surrender the stream, replaying any buffered bytes first.
    ///
    /// Stream upgrades use this to hand unread handshake bytes to the
    /// upgraded protocol.
    #[must_use]
    pub fn into_stream(self) -> RewindStream<Box<dyn ConnectionStream>> {
        RewindStream::new(self.input.bytes.freeze(), self.stream)
    }

    /// Split into independently owned read and write halves.
    #[must_use]
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        let (read, write) = tokio::io::split(self.stream);
        (
            ConnectionReader {
                half: read,
                input: self.input,
                remote_addr: self.remote_addr,
            },
            ConnectionWriter { half: write },
        )
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("buffered", &self.input.bytes.len())
            .finish_non_exhaustive()
    }
}

/// Read half of a split [`Connection`]. Owns the read buffer.
pub struct ConnectionReader {
    half: ReadHalf<Box<dyn ConnectionStream>>,
    input: InputBuffer,
    remote_addr: Option<SocketAddr>,
}

impl ConnectionReader {
    /// Bytes read but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> &[u8] { &self.input.bytes }

    /// Discard the first `count` buffered bytes.
    pub fn consume(&mut self, count: usize) { self.input.consume(count); }

    /// Read more bytes into the buffer. Zero means end of stream.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the stream.
    pub async fn fill(&mut self) -> io::Result<usize> { self.input.fill(&mut self.half).await }

    /// Address of the peer, when known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Take the unconsumed bytes out of the buffer.
    pub fn take_buffered(&mut self) -> Bytes { self.input.bytes.split().freeze() }

    /// Rejoin with the writer split from the same connection.
    ///
    /// Returns `None` if `writer` belongs to a different connection.
    #[must_use]
    pub fn reunite(self, writer: ConnectionWriter) -> Option<Connection> {
        if !self.half.is_pair_of(&writer.half) {
            return None;
        }
        Some(Connection {
            stream: self.half.unsplit(writer.half),
            input: self.input,
            remote_addr: self.remote_addr,
        })
    }
}

/// Write half of a split [`Connection`].
pub struct ConnectionWriter {
    half: WriteHalf<Box<dyn ConnectionStream>>,
}

impl ConnectionWriter {
    /// Write all of `bytes` and flush.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the stream.
    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.half.write_all(bytes).await?;
        self.half.flush().await
    }

    /// Shut down the write side.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the stream.
    pub async fn shutdown(&mut self) -> io::Result<()> { self.half.shutdown().await }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn unconsumed_bytes_survive_split_and_reunite() {
        let (local, mut remote) = duplex(64);
        let mut connection = Connection::new(local, 8);
        remote.write_all(b"abcdef").await.expect("write");
        while connection.buffered().len() < 6 {
            assert!(connection.fill().await.expect("read") > 0);
        }
        connection.consume(2);

        let (reader, writer) = connection.split();
        assert_eq!(reader.buffered(), b"cdef");
        let connection = reader.reunite(writer).expect("same connection");
        assert_eq!(connection.buffered(), b"cdef");
    }

    #[tokio::test]
    async fn halves_from_different_connections_do_not_reunite() {
        let (a, _a_peer) = duplex(8);
        let (b, _b_peer) = duplex(8);
        let (reader, _) = Connection::new(a, 8).split();
        let (_, writer) = Connection::new(b, 8).split();
        assert!(reader.reunite(writer).is_none());
    }

    #[tokio::test]
    async fn into_stream_replays_buffered_bytes() {
        let (local, mut remote) = duplex(64);
        let mut connection = Connection::new(local, 64);
        remote.write_all(b"hello").await.expect("write");
        connection.fill().await.expect("read");
        drop(remote);

        let mut stream = connection.into_stream();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.expect("read all");
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn fill_reports_end_of_stream() {
        let (local, remote) = duplex(8);
        drop(remote);
        let mut connection = Connection::new(local, 8);
        assert_eq!(connection.fill().await.expect("eof is not an error"), 0);
    }
}
