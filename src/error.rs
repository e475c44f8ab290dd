//! Error taxonomy for connection pipelines.
//!
//! Only [`ConfigurationError`] is returned synchronously (when a [`Proxy`](crate::Proxy)
//! is constructed). Everything else happens while a connection is running and is
//! delivered to the request which owns the connection as an [`Event::Error`](crate::Event).

use std::io;

use thiserror::Error;

use crate::BoxError;

/// Error returned when a proxy description is invalid.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// SOCKS4 has no password field, so a password is meaningless without a user id.
    #[error("socks4 proxy has a password but no username")]
    PasswordWithoutUsername,

    /// The proxy URI scheme does not name a supported proxy protocol.
    #[error("unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    /// The proxy URI is missing a host.
    #[error("proxy uri has no host")]
    MissingHost,

    /// The proxy URI could not be parsed.
    #[error("invalid proxy uri: {0}")]
    InvalidUri(#[from] url::ParseError),

    /// The username or password in the proxy URI is not UTF-8 once percent-decoded.
    #[error("proxy uri credentials are not valid utf-8")]
    InvalidUserinfo,
}

/// Error raised by the TLS layer, either during the handshake or on a later record.
#[derive(Debug, Error)]
#[error("tls with {host} failed")]
pub struct HandshakeError {
    host: String,
    #[source]
    source: io::Error,
}

impl HandshakeError {
    pub(crate) fn new(host: impl Into<String>, source: io::Error) -> Self {
        Self {
            host: host.into(),
            source,
        }
    }

    /// The server name the TLS layer was negotiating with.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The underlying I/O error reported by the TLS layer.
    pub fn io(&self) -> &io::Error {
        &self.source
    }
}

/// Error raised when a proxy tunnel could not be established.
#[derive(Debug, Error)]
#[error("tunnel through proxy {proxy} failed")]
pub struct TunnelError {
    proxy: String,
    #[source]
    kind: TunnelErrorKind,
}

impl TunnelError {
    pub(crate) fn new(proxy: impl Into<String>, kind: TunnelErrorKind) -> Self {
        Self {
            proxy: proxy.into(),
            kind,
        }
    }

    /// The `host:port` of the proxy which failed.
    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    /// What went wrong during negotiation.
    pub fn kind(&self) -> &TunnelErrorKind {
        &self.kind
    }
}

/// The reason a tunnel negotiation failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TunnelErrorKind {
    /// I/O error talking to the proxy.
    #[error(transparent)]
    Io(io::Error),

    /// The TLS session with an HTTPS proxy failed.
    #[error("tls to proxy: {0}")]
    Tls(#[source] io::Error),

    /// The proxy answered the CONNECT request with a non-success status.
    #[error("proxy responded with {0}")]
    Rejected(http::StatusCode),

    /// The SOCKS proxy refused the request or broke the protocol.
    #[error("socks: {0}")]
    Socks(#[source] tokio_socks::Error),

    /// The proxy rejected the supplied credentials.
    #[error("proxy rejected credentials")]
    AuthenticationFailed,

    /// None of the offered authentication methods were acceptable to the proxy.
    #[error("proxy offered no acceptable authentication method")]
    NoAcceptableAuthMethod,

    /// A credential cannot be encoded in the SOCKS5 sub-negotiation, which needs
    /// between 1 and 255 bytes for both the username and the password.
    #[error("socks5 credentials must be between 1 and 255 bytes")]
    InvalidCredentials,

    /// The target address cannot be expressed in this proxy protocol.
    #[error("target address is not supported by this proxy protocol")]
    UnsupportedAddress,

    /// The proxy's response to CONNECT is not valid HTTP/1.
    #[error("invalid CONNECT response: {0}")]
    InvalidResponse(#[source] httparse::Error),

    /// The proxy sent something which does not follow the protocol.
    #[error("malformed proxy response: {0}")]
    Malformed(&'static str),

    /// The proxy closed the connection before negotiation finished.
    #[error("proxy closed the connection during negotiation")]
    UnexpectedEof,
}

impl From<io::Error> for TunnelErrorKind {
    fn from(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            TunnelErrorKind::UnexpectedEof
        } else {
            TunnelErrorKind::Io(error)
        }
    }
}

/// Terminal error for a request or a connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid configuration.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The proxy tunnel could not be established.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// The TLS layer failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The peer violated HTTP/1.1 framing, or the HTTP connection failed.
    #[error("protocol: {0}")]
    Protocol(#[source] hyper::Error),

    /// The response body could not be read or decoded.
    #[error("response body: {0}")]
    Body(#[source] BoxError),

    /// The application handler refused a response.
    #[error("handler: {0}")]
    Handler(#[source] BoxError),

    /// The connection already has a request in flight.
    #[error("connection already has a request in flight")]
    Busy,

    /// The connection was closed before the request completed.
    #[error("connection closed")]
    Closed,
}
