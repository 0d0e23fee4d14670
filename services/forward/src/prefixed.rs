//! Stream adapter that replays sniffed bytes.
//!
//! `PrefixedStream` yields a buffered prefix before reading from the inner
//! stream, so bytes consumed during protocol detection reach the next
//! reader exactly once and in order. Writes go straight to the inner
//! stream.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use hopline_chain::{Connection, Transport};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream that yields `prefix` before delegating to `inner`.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Wrap `inner` without a prefix.
    pub fn passthrough(inner: S) -> Self {
        Self::new(Bytes::new(), inner)
    }

    /// Prefix bytes not yet read.
    pub fn prefix_remaining(&self) -> usize {
        self.prefix.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: Connection> Connection for PrefixedStream<S> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn transport(&self) -> Transport {
        self.inner.transport()
    }

    fn destination(&self) -> Option<&str> {
        self.inner.destination()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefix_then_inner() {
        let (mut client, server) = duplex(1024);
        let mut prefixed = PrefixedStream::new(Bytes::from_static(b"GET / "), server);

        client.write_all(b"HTTP/1.1\r\n").await.unwrap();
        drop(client);

        let mut out = Vec::new();
        prefixed.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_small_reads_drain_prefix() {
        let (_client, server) = duplex(1024);
        let mut prefixed = PrefixedStream::new(Bytes::from_static(b"hello world"), server);

        let mut buf = [0u8; 5];
        prefixed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(prefixed.prefix_remaining(), 6);

        prefixed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b" worl");
        assert_eq!(prefixed.prefix_remaining(), 1);
    }

    #[tokio::test]
    async fn test_write_goes_to_inner() {
        let (mut client, server) = duplex(1024);
        let mut prefixed = PrefixedStream::new(Bytes::from_static(b"unused"), server);

        prefixed.write_all(b"reply").await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }
}
