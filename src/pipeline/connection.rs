//! A pipeline attached to a live socket.
//!
//! Each connection is driven by a single task which negotiates every layer and then
//! serves requests one at a time. Every event on a connection, including errors,
//! is handled on that task.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower::{Service, ServiceExt};
use tower_http::decompression::Decompression;
use tracing::Instrument;

use super::bridge::{ErrorRouter, HandshakeErrorBridge};
use super::Pipeline;
use crate::association::{Association, RequestHandle};
use crate::body::{self, Body};
use crate::io::{BoxedIo, TokioIo};
use crate::{BoxError, Error, HandshakeError};

/// A live connection built from a [`Pipeline`].
///
/// Dropping the connection, or calling [`Connection::close`], stops the driver and
/// fails any request still in flight with [`Error::Closed`].
pub struct Connection {
    association: Association,
    requests: mpsc::UnboundedSender<Request<Body>>,
    close: Option<oneshot::Sender<()>>,
    driver: JoinHandle<()>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("association", &self.association)
            .field("finished", &self.driver.is_finished())
            .finish()
    }
}

impl Connection {
    pub(super) fn spawn(pipeline: Pipeline, io: BoxedIo) -> Self {
        let association = Association::new();
        let (requests, incoming) = mpsc::unbounded_channel();
        let (close, closed) = oneshot::channel();

        let router = ErrorRouter::new(
            association.clone(),
            pipeline.diagnostics().clone(),
            pipeline.handler().clone(),
        );

        let span = tracing::debug_span!(
            "connection",
            host = %pipeline.host(),
            port = pipeline.port()
        );
        let driver = Driver {
            pipeline,
            association: association.clone(),
            incoming,
            router,
        };

        let driver = tokio::spawn(driver.run(io, closed).instrument(span));

        Self {
            association,
            requests,
            close: Some(close),
            driver,
        }
    }

    /// Send a request on this connection.
    ///
    /// The request is associated with the connection before anything is written, so
    /// that every error from here on, including TLS and proxy failures, reaches
    /// `handle`. Fails with [`Error::Busy`] while another request is in flight and
    /// with [`Error::Closed`] once the connection has failed.
    pub fn dispatch(&self, request: Request<Body>, handle: RequestHandle) -> Result<(), Error> {
        self.association.associate(handle)?;

        if self.requests.send(request).is_err() {
            // The driver exited. If it did not take the request with it, nobody has
            // told the request yet.
            if self.association.clear().is_some() {
                return Err(Error::Closed);
            }
        }

        Ok(())
    }

    /// Close the connection.
    ///
    /// A request in flight receives [`Error::Closed`]. Nothing is retried.
    pub fn close(&mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }

    /// The connection's request association.
    pub fn association(&self) -> &Association {
        &self.association
    }

    /// Has the connection driver exited?
    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }

    /// Wait for the connection driver to exit on its own.
    ///
    /// The connection is kept open while waiting; it ends when the peer closes it or
    /// a terminal error occurs.
    pub async fn join(self) {
        let Connection {
            association: _,
            requests,
            close,
            driver,
        } = self;

        if let Err(error) = driver.await {
            tracing::error!(%error, "connection driver panicked");
        }
        drop((requests, close));
    }
}

struct Driver {
    pipeline: Pipeline,
    association: Association,
    incoming: mpsc::UnboundedReceiver<Request<Body>>,
    router: ErrorRouter,
}

impl Driver {
    /// Serve until the connection fails or the close signal fires. The signal also
    /// fires when the [`Connection`] is dropped.
    async fn run(mut self, io: BoxedIo, closed: oneshot::Receiver<()>) {
        let result = tokio::select! {
            result = self.serve(io) => result,
            _ = closed => {
                tracing::debug!("connection closed by handle");
                Err(Error::Closed)
            }
        };

        if let Err(error) = result {
            self.router.terminal(error);
        }

        self.association.shutdown();
        tracing::trace!("connection driver finished");
    }

    async fn serve(&mut self, mut io: BoxedIo) -> Result<(), Error> {
        if let Some(tunnel) = self.pipeline.tunnel() {
            io = tunnel
                .negotiate(io, self.pipeline.host(), self.pipeline.port())
                .await?;
        }

        if let Some(tls) = self.pipeline.tls() {
            let bridge = HandshakeErrorBridge::new(
                self.association.clone(),
                self.pipeline.diagnostics().clone(),
                tls.host(),
            );

            let mut stream = tls.stream(io, Some(bridge.callback()));
            stream
                .finish_handshake()
                .instrument(tracing::debug_span!("tls", host = %tls.host()))
                .await
                .map_err(|error| HandshakeError::new(tls.host(), error))?;
            io = Box::new(stream);
        }

        let (sender, conn) = self
            .pipeline
            .framing()
            .builder()
            .handshake::<_, Body>(TokioIo::new(io))
            .await
            .map_err(Error::Protocol)?;
        tracing::trace!("http/1.1 framing ready");

        let mut exchange = if self.pipeline.decompression() {
            Exchange::Decompress(Decompression::new(Framed(sender)))
        } else {
            Exchange::Plain(Framed(sender))
        };
        let mut wire = Wire {
            conn: Some(Box::pin(conn)),
        };

        loop {
            let request = match wire.conn.as_mut() {
                Some(conn) => tokio::select! {
                    request = self.incoming.recv() => request,
                    result = conn => {
                        result.map_err(Error::Protocol)?;
                        tracing::debug!("peer closed the connection");
                        return Ok(());
                    }
                },
                None => return Ok(()),
            };

            let Some(request) = request else {
                tracing::debug!("connection handle dropped");
                return Ok(());
            };

            tracing::trace!(method = %request.method(), uri = %request.uri(), "sending request");
            let response = wire
                .alongside(exchange.send(request))
                .await?
                .map_err(Error::Protocol)?;

            let (parts, body) = response.into_parts();
            let collected = wire
                .alongside(body.collect())
                .await?
                .map_err(Error::Body)?;
            let response = Response::from_parts(parts, body::full(collected.to_bytes()));

            tracing::trace!(status = %response.status(), "response received");
            match self.pipeline.handler().on_response(response) {
                Ok(()) => self.association.complete(),
                Err(error) => self.router.reject(Error::Handler(error)),
            }
        }
    }
}

type Http1Connection = http1::Connection<TokioIo<BoxedIo>, Body>;

/// The HTTP/1.1 connection future, polled alongside whatever the driver awaits.
struct Wire {
    conn: Option<Pin<Box<Http1Connection>>>,
}

impl Wire {
    /// Drive `work` to completion while keeping the connection moving.
    ///
    /// A connection that finishes cleanly is dropped and `work` is awaited alone;
    /// one that fails ends `work` with a protocol error.
    async fn alongside<F>(&mut self, work: F) -> Result<F::Output, Error>
    where
        F: Future,
    {
        tokio::pin!(work);

        let finished = match self.conn.as_mut() {
            Some(conn) => tokio::select! {
                biased;
                output = &mut work => return Ok(output),
                result = conn => result,
            },
            None => return Ok(work.await),
        };

        self.conn = None;
        finished.map_err(Error::Protocol)?;
        Ok(work.await)
    }
}

/// hyper's request sender as a [`tower::Service`].
struct Framed(http1::SendRequest<Body>);

impl Service<Request<Body>> for Framed {
    type Response = Response<Incoming>;
    type Error = hyper::Error;
    type Future = BoxFuture<'static, Result<Response<Incoming>, hyper::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        Box::pin(self.0.send_request(request))
    }
}

/// The request path through the pipeline's HTTP layers.
enum Exchange {
    Plain(Framed),
    Decompress(Decompression<Framed>),
}

impl Exchange {
    async fn send(&mut self, request: Request<Body>) -> Result<Response<Body>, hyper::Error> {
        match self {
            Exchange::Plain(service) => {
                let response = ServiceExt::<Request<Body>>::ready(service)
                    .await?
                    .call(request)
                    .await?;
                Ok(response.map(|body| body.map_err(BoxError::from).boxed_unsync()))
            }
            Exchange::Decompress(service) => {
                let response = ServiceExt::<Request<Body>>::ready(service)
                    .await?
                    .call(request)
                    .await?;
                Ok(response.map(|body| body.boxed_unsync()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Connection: Send, Sync);
}
