//! Async stream adapter that replays bytes read ahead of an upgrade.
//!
//! When a preamble decoder has buffered bytes past an upgrade request, those
//! bytes belong to the upgraded protocol. `RewindStream` hands them to the
//! upgrade provider before reads reach the underlying stream.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream adapter that yields `leftover` before reading from `inner`.
pub struct RewindStream<S> {
    leftover: Bytes,
    inner: S,
}

impl<S> RewindStream<S> {
    /// Create a new `RewindStream` that will yield `leftover` before
    /// delegating to `inner`.
    pub fn new(leftover: impl Into<Bytes>, inner: S) -> Self {
        Self {
            leftover: leftover.into(),
            inner,
        }
    }

    /// Bytes not yet replayed.
    #[must_use]
    pub fn pending(&self) -> &[u8] { &self.leftover }

    /// Return the wrapped stream and any bytes not yet replayed.
    pub fn into_parts(self) -> (S, Bytes) { (self.inner, self.leftover) }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.leftover.has_remaining() {
            let to_copy = self.leftover.remaining().min(buf.remaining());
            buf.put_slice(&self.leftover[..to_copy]);
            self.leftover.advance(to_copy);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    #[tokio::test]
    async fn leftover_is_read_before_inner_stream() {
        let (client, mut server) = duplex(64);
        server.write_all(b" world").await.expect("write inner");
        drop(server);

        let mut stream = RewindStream::new(&b"hello"[..], client);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.expect("read all");
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn small_reads_drain_leftover_in_order() {
        let mut stream = RewindStream::new(vec![1_u8, 2, 3], tokio::io::empty());
        let mut two = [0_u8; 2];
        stream.read_exact(&mut two).await.expect("first read");
        assert_eq!(two, [1, 2]);
        assert_eq!(stream.pending(), &[3]);
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.expect("drain");
        assert_eq!(rest, vec![3]);
    }
}
