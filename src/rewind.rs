//! Replay bytes which were read past the end of a proxy handshake.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug)]
pub(crate) struct Rewind<IO> {
    inner: IO,
    prefix: Option<Bytes>,
}

impl<IO> Rewind<IO> {
    pub(crate) fn new<B>(inner: IO, prefix: B) -> Self
    where
        B: Into<Bytes>,
    {
        let prefix: Bytes = prefix.into();
        Self {
            inner,
            prefix: (!prefix.is_empty()).then_some(prefix),
        }
    }
}

impl<IO> AsyncRead for Rewind<IO>
where
    IO: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            let n = std::cmp::min(prefix.len(), buf.remaining());
            buf.put_slice(&prefix[..n]);
            prefix.advance(n);

            if !prefix.is_empty() {
                self.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<IO> AsyncWrite for Rewind<IO>
where
    IO: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn replays_prefix_before_inner() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut rewind = Rewind::new(client, &b"early "[..]);

        server.write_all(b"late").await.unwrap();
        drop(server);

        let mut out = String::new();
        rewind.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "early late");
    }

    #[tokio::test]
    async fn small_reads_drain_prefix() {
        let (client, _server) = tokio::io::duplex(64);
        let mut rewind = Rewind::new(client, &b"abc"[..]);

        let mut buf = [0u8; 2];
        rewind.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");

        let mut buf = [0u8; 1];
        rewind.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"c");
        assert!(rewind.prefix.is_none());
    }
}
