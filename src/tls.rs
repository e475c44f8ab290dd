//! The TLS layer.
//!
//! [`TlsStream`] performs a delayed handshake: it is driven either explicitly via
//! [`TlsStream::finish_handshake`] or by the first read or write. Errors raised by
//! the layer, during the handshake or on any later record, can be observed through a
//! side-channel [`TlsErrorCallback`], which is how the pipeline routes them to the
//! request owning the connection.
//!
//! # Default trust
//!
//! When no TLS configuration is supplied, [`insecure_config`] is used. It accepts
//! **any** server certificate. Connectivity is preferred over certificate validation
//! unless a configuration with real roots is provided; callers who need validation
//! must pass their own [`rustls::ClientConfig`].

use core::task::{Context, Poll};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::{fmt, io};

use futures_core::ready;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Side channel notified with the first error raised by a TLS layer.
pub type TlsErrorCallback = Arc<dyn Fn(io::Error) + Send + Sync>;

/// Certificate verifier which accepts every server certificate.
///
/// Handshake signatures are still checked, so the peer must hold the key for the
/// certificate it presents; only the chain of trust is skipped.
#[derive(Debug)]
struct TrustAll(Arc<CryptoProvider>);

impl ServerCertVerifier for TrustAll {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// The default client configuration: trusts every certificate, offers `http/1.1`.
pub fn insecure_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

    CONFIG
        .get_or_init(|| {
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let mut config = ClientConfig::builder_with_provider(provider.clone())
                .with_safe_default_protocol_versions()
                .expect("ring supports the default protocol versions")
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(TrustAll(provider)))
                .with_no_client_auth();

            config.alpn_protocols.push(b"http/1.1".to_vec());
            Arc::new(config)
        })
        .clone()
}

/// Negotiates TLS against a fixed `host:port`.
#[derive(Clone)]
pub struct TlsLayer {
    host: String,
    port: u16,
    config: Arc<ClientConfig>,
}

impl fmt::Debug for TlsLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsLayer")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl fmt::Display for TlsLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tls({})", crate::authority(&self.host, self.port))
    }
}

impl TlsLayer {
    /// Create a TLS layer, falling back to [`insecure_config`] when `config` is `None`.
    pub fn new(host: impl Into<String>, port: u16, config: Option<Arc<ClientConfig>>) -> Self {
        Self {
            host: host.into(),
            port,
            config: config.unwrap_or_else(insecure_config),
        }
    }

    /// The server name negotiated with.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port of the TLS peer.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The client configuration in use.
    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// Wrap `io` in a TLS stream without driving the handshake.
    pub fn stream<IO>(&self, io: IO, on_error: Option<TlsErrorCallback>) -> TlsStream<IO>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        TlsStream::new(io, &self.host, self.config.clone(), on_error)
    }

    /// Wrap `io` in a TLS stream and complete the handshake.
    #[tracing::instrument(name = "tls", skip_all, fields(host = %self.host))]
    pub async fn connect<IO>(
        &self,
        io: IO,
        on_error: Option<TlsErrorCallback>,
    ) -> io::Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = self.stream(io, on_error);
        stream.finish_handshake().await?;
        Ok(stream)
    }
}

enum State<IO> {
    Handshake(tokio_rustls::Connect<IO>),
    Streaming(tokio_rustls::client::TlsStream<IO>),
    Failed(Option<io::Error>),
}

impl<IO> fmt::Debug for State<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Handshake(_) => f.write_str("State::Handshake"),
            State::Streaming(_) => f.write_str("State::Streaming"),
            State::Failed(_) => f.write_str("State::Failed"),
        }
    }
}

/// A client TLS stream, generic over the underlying IO.
pub struct TlsStream<IO> {
    state: State<IO>,
    alpn: Option<Vec<u8>>,
    on_error: Option<TlsErrorCallback>,
}

impl<IO> fmt::Debug for TlsStream<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsStream")
            .field("state", &self.state)
            .field("forwarding", &self.on_error.is_some())
            .finish()
    }
}

impl<IO> TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a TLS stream negotiating with `domain`.
    ///
    /// An invalid server name does not fail here; it is reported as a handshake
    /// error when the stream is first driven.
    pub fn new(
        stream: IO,
        domain: &str,
        config: Arc<ClientConfig>,
        on_error: Option<TlsErrorCallback>,
    ) -> Self {
        let domain = domain.trim_start_matches('[').trim_end_matches(']');
        let state = match ServerName::try_from(domain.to_owned()) {
            Ok(name) => {
                State::Handshake(tokio_rustls::TlsConnector::from(config).connect(name, stream))
            }
            Err(error) => {
                State::Failed(Some(io::Error::new(io::ErrorKind::InvalidInput, error)))
            }
        };

        Self {
            state,
            alpn: None,
            on_error,
        }
    }

    /// Finish the TLS handshake.
    pub async fn finish_handshake(&mut self) -> io::Result<()> {
        futures_util::future::poll_fn(|cx| self.handshake(cx, |_, _| Poll::Ready(Ok(())))).await
    }

    /// Has the handshake completed?
    pub fn is_established(&self) -> bool {
        matches!(self.state, State::Streaming(_))
    }

    /// The ALPN protocol agreed during the handshake.
    pub fn alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    fn handshake<F, R>(&mut self, cx: &mut Context<'_>, action: F) -> Poll<io::Result<R>>
    where
        F: FnOnce(
            &mut tokio_rustls::client::TlsStream<IO>,
            &mut Context<'_>,
        ) -> Poll<io::Result<R>>,
    {
        let result = match self.state {
            State::Handshake(ref mut connect) => match ready!(Pin::new(connect).poll(cx)) {
                Ok(mut stream) => {
                    let (_, session) = stream.get_ref();
                    self.alpn = session.alpn_protocol().map(<[u8]>::to_vec);
                    tracing::debug!(
                        alpn = ?self.alpn.as_deref().map(String::from_utf8_lossy),
                        "tls handshake complete"
                    );

                    let result = action(&mut stream, cx);
                    self.state = State::Streaming(stream);
                    result
                }
                Err(error) => {
                    self.state = State::Failed(None);
                    Poll::Ready(Err(error))
                }
            },
            State::Streaming(ref mut stream) => action(stream, cx),
            State::Failed(ref mut error) => Poll::Ready(Err(error.take().unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "tls session failed")
            }))),
        };

        match result {
            Poll::Ready(Err(error)) => Poll::Ready(Err(self.forward(error))),
            other => other,
        }
    }

    /// Hand the error to the side channel, returning a stand-in for the caller.
    fn forward(&mut self, error: io::Error) -> io::Error {
        match self.on_error.take() {
            Some(callback) => {
                let surrogate = io::Error::new(error.kind(), error.to_string());
                callback(error);
                surrogate
            }
            None => error,
        }
    }
}

impl<IO> AsyncRead for TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.handshake(cx, |stream, cx| Pin::new(stream).poll_read(cx, buf))
    }
}

impl<IO> AsyncWrite for TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.handshake(cx, |stream, cx| Pin::new(stream).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = match this.state {
            State::Streaming(ref mut stream) => Pin::new(stream).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        };

        match result {
            Poll::Ready(Err(error)) => Poll::Ready(Err(this.forward(error))),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.state {
            State::Streaming(ref mut stream) => Pin::new(stream).poll_shutdown(cx),
            _ => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use static_assertions::assert_impl_all;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    assert_impl_all!(TlsStream<tokio::io::DuplexStream>: AsyncRead, AsyncWrite, Send, Unpin);
    assert_impl_all!(TlsLayer: Send, Sync, Clone);

    fn recording() -> (TlsErrorCallback, Arc<Mutex<Vec<io::Error>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let callback: TlsErrorCallback = Arc::new(move |error| sink.lock().unwrap().push(error));
        (callback, errors)
    }

    /// Reads the ClientHello and answers with something which is not TLS.
    async fn garbage_server(mut server: tokio::io::DuplexStream) {
        let mut buf = [0u8; 1024];
        let _ = server.read(&mut buf).await;
        let _ = server
            .write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\n\r\n")
            .await;
    }

    #[test]
    fn insecure_config_offers_http1() {
        let config = insecure_config();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert!(Arc::ptr_eq(&config, &insecure_config()));
    }

    #[test]
    fn layer_display() {
        let layer = TlsLayer::new("example.com", 443, None);
        assert_eq!(layer.to_string(), "tls(example.com:443)");
        assert!(Arc::ptr_eq(layer.config(), &insecure_config()));
    }

    #[tokio::test]
    async fn handshake_error_goes_to_callback_once() {
        let _ = tracing_subscriber::fmt::try_init();

        let (client, server) = tokio::io::duplex(4096);
        let server = tokio::spawn(garbage_server(server));

        let (callback, errors) = recording();
        let layer = TlsLayer::new("example.com", 443, None);
        let error = layer.connect(client, Some(callback)).await.unwrap_err();

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind(), error.kind());
        assert_eq!(errors[0].to_string(), error.to_string());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_error_without_callback_is_returned() {
        let (client, server) = tokio::io::duplex(4096);
        let server = tokio::spawn(garbage_server(server));

        let layer = TlsLayer::new("example.com", 443, None);
        let mut stream = layer.stream(client, None);
        assert!(stream.finish_handshake().await.is_err());
        assert!(!stream.is_established());

        // The session stays failed.
        let mut buf = [0u8; 8];
        let error = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_server_name_is_a_handshake_error() {
        let (client, _server) = tokio::io::duplex(64);
        let (callback, errors) = recording();

        let layer = TlsLayer::new("not a hostname", 443, None);
        let error = layer.connect(client, Some(callback)).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_transport_fails_handshake() {
        let (client, server) = tokio::io::duplex(4096);
        drop(server);

        let (callback, errors) = recording();
        let layer = TlsLayer::new("example.com", 443, None);
        assert!(layer.connect(client, Some(callback)).await.is_err());
        assert_eq!(errors.lock().unwrap().len(), 1);
    }
}
