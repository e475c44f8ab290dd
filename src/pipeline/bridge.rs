//! Routing of connection errors to the request which owns the connection.
//!
//! TLS failures surface inside the byte stream, long before hyper has a request to
//! fail. The [`HandshakeErrorBridge`] sits between the TLS layer and the connection's
//! [`Association`] so that those failures reach the request anyway.

use std::io;
use std::sync::Arc;

use crate::association::{Association, Delivery, DiagnosticSink};
use crate::error::HandshakeError;
use crate::pipeline::Handler;
use crate::tls::TlsErrorCallback;
use crate::Error;

/// Forwards TLS errors to the request currently associated with a connection.
///
/// Every error is reported to the diagnostic sink. If a request is associated, it
/// receives exactly one [`Event::Error`](crate::Event) and the association is cleared.
/// The bridge never closes the connection; the TLS layer's own failure does that.
#[derive(Clone)]
pub struct HandshakeErrorBridge {
    association: Association,
    diagnostics: Arc<dyn DiagnosticSink>,
    host: String,
}

impl std::fmt::Debug for HandshakeErrorBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeErrorBridge")
            .field("association", &self.association)
            .field("host", &self.host)
            .finish()
    }
}

impl HandshakeErrorBridge {
    /// Create a bridge for the TLS layer negotiating with `host`.
    pub fn new(
        association: Association,
        diagnostics: Arc<dyn DiagnosticSink>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            association,
            diagnostics,
            host: host.into(),
        }
    }

    /// Route one TLS error.
    pub fn forward(&self, error: io::Error) {
        let error = Error::Handshake(HandshakeError::new(self.host.clone(), error));
        self.diagnostics.report(&error);

        match self.association.fail(error) {
            Delivery::Request(id) => {
                tracing::debug!(request = id, host = %self.host, "tls error delivered to request");
            }
            Delivery::Unclaimed(_) => {
                tracing::trace!(host = %self.host, "tls error with no request in flight");
            }
            Delivery::AlreadyFailed(error) => {
                tracing::debug!(%error, "tls error after connection failure");
            }
        }
    }

    /// The bridge as a side channel for a [`TlsStream`](crate::tls::TlsStream).
    pub fn callback(self) -> TlsErrorCallback {
        Arc::new(move |error| self.forward(error))
    }
}

/// Delivers errors raised by the connection driver itself.
#[derive(Clone)]
pub(crate) struct ErrorRouter {
    association: Association,
    diagnostics: Arc<dyn DiagnosticSink>,
    handler: Arc<dyn Handler>,
}

impl ErrorRouter {
    pub(crate) fn new(
        association: Association,
        diagnostics: Arc<dyn DiagnosticSink>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            association,
            diagnostics,
            handler,
        }
    }

    /// Deliver an error which ends the connection.
    pub(crate) fn terminal(&self, error: Error) {
        if !self.association.is_failed() {
            self.handler.on_error(&error);
        }

        match self.association.fail(error) {
            Delivery::Request(id) => {
                tracing::debug!(request = id, "connection error delivered to request");
            }
            Delivery::Unclaimed(Error::Closed) => tracing::debug!("connection closed while idle"),
            Delivery::Unclaimed(error) => self.diagnostics.report(&error),
            Delivery::AlreadyFailed(error) => {
                tracing::debug!(%error, "connection already failed");
            }
        }
    }

    /// Fail the current request, leaving the connection usable.
    pub(crate) fn reject(&self, error: Error) {
        match self.association.reject(error) {
            Delivery::Request(id) => tracing::debug!(request = id, "request rejected"),
            Delivery::Unclaimed(error) | Delivery::AlreadyFailed(error) => {
                self.diagnostics.report(&error)
            }
        }
    }
}
