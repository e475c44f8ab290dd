//! Pipeline assembly.
//!
//! A [`Pipeline`] is an ordered list of [`Layer`]s computed from a [`PipelineConfig`].
//! Assembly is pure: nothing touches the network and nothing can fail. Errors
//! only happen once the pipeline is attached to a socket with [`Pipeline::attach`],
//! and are then delivered to the request owning the [`Connection`].

use std::fmt;
use std::sync::Arc;

use http::Response;
use rustls::ClientConfig;

use crate::association::{DiagnosticSink, TracingSink};
use crate::body::Body;
use crate::io::Io;
use crate::proxy::{Proxy, ProxyEndpoint, TunnelLayer};
use crate::tls::{insecure_config, TlsLayer};
use crate::{BoxError, Error};

pub mod bridge;
mod connection;

pub use self::bridge::HandshakeErrorBridge;
pub use self::connection::Connection;

/// Default maximum size of a body chunk.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 8192;

/// Default maximum length of the response status line.
pub const DEFAULT_MAX_INITIAL_LINE_LENGTH: usize = 4096;

/// Default maximum size of the response headers.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8192;

/// Smallest read buffer the HTTP/1.1 codec accepts.
const MIN_READ_BUFFER: usize = 8192;

/// The terminal application handler of a pipeline.
///
/// Receives each fully read (and, if enabled, decompressed) response. Returning an
/// error fails the request which owns the connection with [`Error::Handler`]; the
/// connection itself stays usable.
pub trait Handler: Send + Sync + 'static {
    /// Handle a response.
    fn on_response(&self, response: Response<Body>) -> Result<(), BoxError>;

    /// Observe a terminal connection error, before it is delivered to the request.
    ///
    /// TLS errors routed through the [`HandshakeErrorBridge`] are not seen here.
    fn on_error(&self, error: &Error) {
        let _ = error;
    }
}

/// Create a [`Handler`] from a closure.
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(Response<Body>) -> Result<(), BoxError> + Send + Sync + 'static,
{
    HandlerFn { f }
}

/// A [`Handler`] implemented by a closure. See [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").finish()
    }
}

impl<F> Handler for HandlerFn<F>
where
    F: Fn(Response<Body>) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn on_response(&self, response: Response<Body>) -> Result<(), BoxError> {
        (self.f)(response)
    }
}

/// Accepts every response and drops it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl Handler for Discard {
    fn on_response(&self, _response: Response<Body>) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Configuration for assembling a [`Pipeline`].
#[derive(Clone)]
pub struct PipelineConfig {
    host: String,
    port: u16,
    proxy: Option<Proxy>,
    tls: bool,
    tls_config: Option<Arc<ClientConfig>>,
    max_chunk_size: usize,
    max_initial_line_length: usize,
    max_header_size: usize,
    decompression: bool,
    handler: Arc<dyn Handler>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("proxy", &self.proxy)
            .field("tls", &self.tls)
            .field("custom_tls_config", &self.tls_config.is_some())
            .field("max_chunk_size", &self.max_chunk_size)
            .field("max_initial_line_length", &self.max_initial_line_length)
            .field("max_header_size", &self.max_header_size)
            .field("decompression", &self.decompression)
            .finish()
    }
}

impl PipelineConfig {
    /// Configure a pipeline to the origin `host:port`.
    ///
    /// Defaults: no proxy, no TLS, no decompression, responses are discarded and
    /// unclaimed errors are logged.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            proxy: None,
            tls: false,
            tls_config: None,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_initial_line_length: DEFAULT_MAX_INITIAL_LINE_LENGTH,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            decompression: false,
            handler: Arc::new(Discard),
            diagnostics: Arc::new(TracingSink),
        }
    }

    /// Tunnel through a forward proxy.
    pub fn with_proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Negotiate TLS with the origin.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Use a custom TLS client configuration, for the origin and for HTTPS proxies.
    ///
    /// Without one, every TLS layer uses [`insecure_config`], which accepts any
    /// certificate.
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Maximum size of a body chunk.
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Maximum length of the response status line.
    pub fn with_max_initial_line_length(mut self, length: usize) -> Self {
        self.max_initial_line_length = length;
        self
    }

    /// Maximum size of the response headers.
    pub fn with_max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    /// Decode `gzip` and `deflate` response bodies.
    pub fn with_decompression(mut self, decompression: bool) -> Self {
        self.decompression = decompression;
        self
    }

    /// Set the terminal application handler.
    pub fn with_handler<H>(mut self, handler: H) -> Self
    where
        H: Handler,
    {
        self.handler = Arc::new(handler);
        self
    }

    /// Set the sink for errors which are not claimed by any request.
    pub fn with_diagnostics<D>(mut self, diagnostics: D) -> Self
    where
        D: DiagnosticSink,
    {
        self.diagnostics = Arc::new(diagnostics);
        self
    }

    /// The origin host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The origin port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The forward proxy, if any.
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }
}

/// HTTP/1.1 framing limits, applied to hyper's client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingLayer {
    max_initial_line_length: usize,
    max_header_size: usize,
    max_chunk_size: usize,
}

impl FramingLayer {
    /// Maximum length of the status line.
    pub fn max_initial_line_length(&self) -> usize {
        self.max_initial_line_length
    }

    /// Maximum size of the headers.
    pub fn max_header_size(&self) -> usize {
        self.max_header_size
    }

    /// Maximum size of a body chunk.
    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Size of the connection read buffer.
    ///
    /// The buffer must hold a complete response head and a full chunk, and hyper
    /// refuses anything smaller than 8 KiB.
    pub fn read_buffer_size(&self) -> usize {
        let head = self
            .max_initial_line_length
            .saturating_add(self.max_header_size);
        MIN_READ_BUFFER.max(head).max(self.max_chunk_size)
    }

    pub(crate) fn builder(&self) -> hyper::client::conn::http1::Builder {
        let mut builder = hyper::client::conn::http1::Builder::new();
        builder.max_buf_size(self.read_buffer_size());
        builder
    }
}

/// One stage of an assembled pipeline.
#[derive(Debug, Clone)]
pub enum Layer {
    /// TLS with the origin.
    Tls(TlsLayer),

    /// HTTP/1.1 request and response framing.
    Framing(FramingLayer),

    /// Response body decompression.
    Decompression,

    /// Proxy tunnel negotiation.
    Tunnel(TunnelLayer),

    /// The application handler.
    Application,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Tls(tls) => fmt::Display::fmt(tls, f),
            Layer::Framing(_) => f.write_str("http-framing"),
            Layer::Decompression => f.write_str("decompression"),
            Layer::Tunnel(tunnel) => fmt::Display::fmt(tunnel, f),
            Layer::Application => f.write_str("application-handler"),
        }
    }
}

/// One negotiation performed on the wire when a pipeline is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// TLS with an HTTPS proxy.
    ProxyTls(ProxyEndpoint),

    /// The proxy protocol exchange (`CONNECT` or SOCKS).
    ProxyExchange(String),

    /// TLS with the origin, rendered as the TLS layer.
    OriginTls(String),

    /// The first HTTP/1.1 exchange.
    Framing,
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handshake::ProxyTls(proxy) => write!(f, "proxy-tls({proxy})"),
            Handshake::ProxyExchange(exchange) => f.write_str(exchange),
            Handshake::OriginTls(tls) => f.write_str(tls),
            Handshake::Framing => f.write_str("http-framing"),
        }
    }
}

/// An assembled connection pipeline.
///
/// Cheap to clone; one pipeline may be attached to many sockets.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

struct Inner {
    host: String,
    port: u16,
    layers: Vec<Layer>,
    handler: Arc<dyn Handler>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "layers",
                &self
                    .inner
                    .layers
                    .iter()
                    .map(crate::DebugLiteral)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Pipeline {
    /// Assemble the layers described by `config`.
    ///
    /// Layers are installed in a fixed order: origin TLS (if enabled), HTTP framing,
    /// decompression (if enabled), proxy tunnel (if a proxy is configured), and
    /// finally the application handler.
    pub fn assemble(config: PipelineConfig) -> Self {
        let tls_config = config.tls_config.clone().unwrap_or_else(insecure_config);
        let mut layers = Vec::with_capacity(5);

        if config.tls {
            layers.push(Layer::Tls(TlsLayer::new(
                config.host.clone(),
                config.port,
                Some(tls_config.clone()),
            )));
        }

        layers.push(Layer::Framing(FramingLayer {
            max_initial_line_length: config.max_initial_line_length,
            max_header_size: config.max_header_size,
            max_chunk_size: config.max_chunk_size,
        }));

        if config.decompression {
            layers.push(Layer::Decompression);
        }

        if let Some(proxy) = &config.proxy {
            layers.push(Layer::Tunnel(TunnelLayer::for_proxy(proxy, tls_config)));
        }

        layers.push(Layer::Application);

        tracing::trace!(
            layers = ?layers.iter().map(crate::DebugLiteral).collect::<Vec<_>>(),
            "assembled pipeline"
        );

        Self {
            inner: Arc::new(Inner {
                host: config.host,
                port: config.port,
                layers,
                handler: config.handler,
                diagnostics: config.diagnostics,
            }),
        }
    }

    /// The installed layers, in installation order.
    pub fn layers(&self) -> &[Layer] {
        &self.inner.layers
    }

    /// The negotiations performed on the wire, in the order they happen.
    ///
    /// Everything facing the proxy completes before TLS with the origin starts.
    pub fn handshakes(&self) -> Vec<Handshake> {
        let mut handshakes = self
            .tunnel()
            .map(TunnelLayer::handshakes)
            .unwrap_or_default();

        if let Some(tls) = self.tls() {
            handshakes.push(Handshake::OriginTls(tls.to_string()));
        }

        handshakes.push(Handshake::Framing);
        handshakes
    }

    /// The origin host.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// The origin port.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Attach the pipeline to a socket connected to the proxy, or to the origin
    /// when no proxy is configured.
    ///
    /// Spawns the connection driver on the current tokio runtime.
    pub fn attach<IO>(&self, io: IO) -> Connection
    where
        IO: Io,
    {
        Connection::spawn(self.clone(), Box::new(io))
    }

    pub(crate) fn tls(&self) -> Option<&TlsLayer> {
        self.inner.layers.iter().find_map(|layer| match layer {
            Layer::Tls(tls) => Some(tls),
            _ => None,
        })
    }

    pub(crate) fn tunnel(&self) -> Option<&TunnelLayer> {
        self.inner.layers.iter().find_map(|layer| match layer {
            Layer::Tunnel(tunnel) => Some(tunnel),
            _ => None,
        })
    }

    pub(crate) fn framing(&self) -> FramingLayer {
        self.inner
            .layers
            .iter()
            .find_map(|layer| match layer {
                Layer::Framing(framing) => Some(*framing),
                _ => None,
            })
            .unwrap_or(FramingLayer {
                max_initial_line_length: DEFAULT_MAX_INITIAL_LINE_LENGTH,
                max_header_size: DEFAULT_MAX_HEADER_SIZE,
                max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            })
    }

    pub(crate) fn decompression(&self) -> bool {
        self.inner
            .layers
            .iter()
            .any(|layer| matches!(layer, Layer::Decompression))
    }

    pub(crate) fn handler(&self) -> &Arc<dyn Handler> {
        &self.inner.handler
    }

    pub(crate) fn diagnostics(&self) -> &Arc<dyn DiagnosticSink> {
        &self.inner.diagnostics
    }
}
