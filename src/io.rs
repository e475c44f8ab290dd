//! Byte streams flowing between pipeline layers.
//!
//! Which layers are present on a connection is only known once a pipeline is
//! assembled, so every layer hands the next one a [`BoxedIo`].

#![allow(unsafe_code)]

use std::{
    io::Error,
    pin::Pin,
    task::{Context, Poll},
};

use hyper::rt::{Read, Write};
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream which can carry a pipeline.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A type-erased [`Io`] stream, as handed from one layer to the next.
pub type BoxedIo = Box<dyn Io>;

/// Present a Tokio stream to hyper's HTTP/1.1 framing.
#[derive(Debug)]
#[pin_project::pin_project]
pub struct TokioIo<T> {
    #[pin]
    inner: T,
}

impl<T> TokioIo<T> {
    /// Wrap a Tokio stream.
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// Unwrap the Tokio stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> Read for TokioIo<T>
where
    T: AsyncRead,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<Result<(), Error>> {
        // SAFETY: tokio's ReadBuf only writes initialized bytes into the cursor's
        // spare capacity, and we advance the cursor by exactly that amount.
        let n = unsafe {
            let mut tbuf = tokio::io::ReadBuf::uninit(buf.as_mut());
            match AsyncRead::poll_read(self.project().inner, cx, &mut tbuf) {
                Poll::Ready(Ok(())) => tbuf.filled().len(),
                other => return other,
            }
        };

        unsafe {
            buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<T> Write for TokioIo<T>
where
    T: AsyncWrite,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, Error>> {
        AsyncWrite::poll_write(self.project().inner, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        AsyncWrite::poll_flush(self.project().inner, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        AsyncWrite::poll_shutdown(self.project().inner, cx)
    }

    fn is_write_vectored(&self) -> bool {
        AsyncWrite::is_write_vectored(&self.inner)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<Result<usize, Error>> {
        AsyncWrite::poll_write_vectored(self.project().inner, cx, bufs)
    }
}
