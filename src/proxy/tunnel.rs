//! Tunnel layers: one negotiation per proxy protocol.
//!
//! [`TunnelLayer::for_proxy`] is the single place where a [`Proxy`] description is
//! turned into a negotiation. Each variant carries exactly the credentials its
//! protocol can present, so an anonymous proxy yields a variant with none.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use rustls::ClientConfig;

use super::{connect, socks, Proxy, ProxyEndpoint, ProxyProtocol};
use crate::io::BoxedIo;
use crate::tls::TlsLayer;
use crate::{Handshake, TunnelError, TunnelErrorKind};

/// Username and password presented to a proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: Arc<str>,
    password: Arc<str>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Create credentials.
    pub fn new(username: impl Into<Arc<str>>, password: impl Into<Arc<str>>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// `Proxy-Authorization` value for HTTP basic authentication.
    pub(crate) fn basic(&self) -> String {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password));
        format!("Basic {token}")
    }
}

/// The negotiation performed with a proxy before any origin traffic flows.
#[derive(Clone)]
pub enum TunnelLayer {
    /// HTTP `CONNECT` over plain TCP.
    HttpConnect {
        /// Proxy location.
        proxy: ProxyEndpoint,
        /// Basic credentials, if the proxy is not anonymous.
        credentials: Option<Credentials>,
    },

    /// TLS to the proxy, then HTTP `CONNECT` inside that session.
    HttpsConnect {
        /// Proxy location.
        proxy: ProxyEndpoint,
        /// Basic credentials, if the proxy is not anonymous.
        credentials: Option<Credentials>,
        /// Client configuration for the TLS session with the proxy.
        tls: Arc<ClientConfig>,
    },

    /// SOCKS4 `CONNECT`.
    Socks4 {
        /// Proxy location.
        proxy: ProxyEndpoint,
        /// User id, if the proxy is not anonymous.
        user_id: Option<Arc<str>>,
    },

    /// SOCKS5 `CONNECT`.
    Socks5 {
        /// Proxy location.
        proxy: ProxyEndpoint,
        /// Username/password authentication, if the proxy is not anonymous.
        credentials: Option<Credentials>,
    },
}

impl fmt::Debug for TunnelLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TunnelLayer")
            .field(&crate::DebugLiteral(self))
            .finish()
    }
}

impl fmt::Display for TunnelLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelLayer::HttpConnect { proxy, credentials } => {
                write!(f, "connect({proxy}, {})", http_auth(credentials))
            }
            TunnelLayer::HttpsConnect {
                proxy, credentials, ..
            } => write!(
                f,
                "tls({proxy})+connect({proxy}, {})",
                http_auth(credentials)
            ),
            TunnelLayer::Socks4 { proxy, user_id } => {
                let auth = if user_id.is_some() { "user-id" } else { "no-user-id" };
                write!(f, "socks4({proxy}, {auth})")
            }
            TunnelLayer::Socks5 { proxy, credentials } => {
                let auth = if credentials.is_some() {
                    "username-password"
                } else {
                    "no-auth"
                };
                write!(f, "socks5({proxy}, {auth})")
            }
        }
    }
}

fn http_auth(credentials: &Option<Credentials>) -> &'static str {
    if credentials.is_some() {
        "basic-auth"
    } else {
        "no-auth"
    }
}

impl TunnelLayer {
    /// Select the negotiation for `proxy`.
    ///
    /// `tls` is only used by HTTPS proxies, for the session with the proxy itself.
    pub fn for_proxy(proxy: &Proxy, tls: Arc<ClientConfig>) -> Self {
        let endpoint = proxy.endpoint().clone();
        let credentials = (!proxy.is_anonymous()).then(|| {
            Credentials::new(
                proxy.username().unwrap_or_default(),
                proxy.password().unwrap_or_default(),
            )
        });

        match proxy.protocol() {
            ProxyProtocol::Http => TunnelLayer::HttpConnect {
                proxy: endpoint,
                credentials,
            },
            ProxyProtocol::Https => TunnelLayer::HttpsConnect {
                proxy: endpoint,
                credentials,
                tls,
            },
            ProxyProtocol::Socks4 => TunnelLayer::Socks4 {
                proxy: endpoint,
                user_id: credentials.map(|credentials| credentials.username),
            },
            ProxyProtocol::Socks5 => TunnelLayer::Socks5 {
                proxy: endpoint,
                credentials,
            },
        }
    }

    /// The proxy this layer negotiates with.
    pub fn proxy(&self) -> &ProxyEndpoint {
        match self {
            TunnelLayer::HttpConnect { proxy, .. }
            | TunnelLayer::HttpsConnect { proxy, .. }
            | TunnelLayer::Socks4 { proxy, .. }
            | TunnelLayer::Socks5 { proxy, .. } => proxy,
        }
    }

    /// Does this layer present any credential to the proxy?
    pub fn presents_credentials(&self) -> bool {
        match self {
            TunnelLayer::HttpConnect { credentials, .. }
            | TunnelLayer::HttpsConnect { credentials, .. }
            | TunnelLayer::Socks5 { credentials, .. } => credentials.is_some(),
            TunnelLayer::Socks4 { user_id, .. } => user_id.is_some(),
        }
    }

    /// The wire negotiations this layer performs, in order.
    pub fn handshakes(&self) -> Vec<Handshake> {
        let exchange = match self {
            TunnelLayer::HttpsConnect {
                proxy, credentials, ..
            } => {
                let connect = format!("connect({proxy}, {})", http_auth(credentials));
                return vec![
                    Handshake::ProxyTls(proxy.clone()),
                    Handshake::ProxyExchange(connect),
                ];
            }
            other => other.to_string(),
        };
        vec![Handshake::ProxyExchange(exchange)]
    }

    /// Negotiate a tunnel to `host:port` over `io`, which must be connected to the proxy.
    ///
    /// On success the returned stream relays bytes to the origin unchanged.
    #[tracing::instrument(name = "tunnel", skip_all, fields(proxy = %self.proxy()))]
    pub async fn negotiate(
        &self,
        io: BoxedIo,
        host: &str,
        port: u16,
    ) -> Result<BoxedIo, TunnelError> {
        let result = match self {
            TunnelLayer::HttpConnect { credentials, .. } => {
                connect::connect(io, host, port, credentials.as_ref())
                    .await
                    .map(|io| Box::new(io) as BoxedIo)
            }
            TunnelLayer::HttpsConnect {
                proxy,
                credentials,
                tls,
            } => {
                let layer = TlsLayer::new(proxy.host(), proxy.port(), Some(tls.clone()));
                match layer.connect(io, None).await {
                    Ok(stream) => connect::connect(stream, host, port, credentials.as_ref())
                        .await
                        .map(|io| Box::new(io) as BoxedIo),
                    Err(error) => Err(TunnelErrorKind::Tls(error)),
                }
            }
            TunnelLayer::Socks4 { user_id, .. } => {
                socks::socks4(io, host, port, user_id.as_deref()).await
            }
            TunnelLayer::Socks5 { credentials, .. } => {
                socks::socks5(io, host, port, credentials.as_ref()).await
            }
        };

        match result {
            Ok(io) => {
                tracing::debug!("tunnel established");
                Ok(io)
            }
            Err(kind) => Err(TunnelError::new(self.proxy().to_string(), kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::tls::insecure_config;

    fn layer(protocol: ProxyProtocol, anonymous: bool) -> TunnelLayer {
        let proxy = if anonymous {
            Proxy::anonymous(protocol, "proxy", 8080)
        } else {
            Proxy::with_credentials(protocol, "proxy", 8080, "user", "pass").unwrap()
        };
        TunnelLayer::for_proxy(&proxy, insecure_config())
    }

    #[test]
    fn protocol_and_anonymity_select_negotiation() {
        let cases = [
            (ProxyProtocol::Http, true, "connect(proxy:8080, no-auth)"),
            (ProxyProtocol::Http, false, "connect(proxy:8080, basic-auth)"),
            (
                ProxyProtocol::Https,
                true,
                "tls(proxy:8080)+connect(proxy:8080, no-auth)",
            ),
            (
                ProxyProtocol::Https,
                false,
                "tls(proxy:8080)+connect(proxy:8080, basic-auth)",
            ),
            (ProxyProtocol::Socks4, true, "socks4(proxy:8080, no-user-id)"),
            (ProxyProtocol::Socks4, false, "socks4(proxy:8080, user-id)"),
            (ProxyProtocol::Socks5, true, "socks5(proxy:8080, no-auth)"),
            (
                ProxyProtocol::Socks5,
                false,
                "socks5(proxy:8080, username-password)",
            ),
        ];

        for (protocol, anonymous, expected) in cases {
            let layer = layer(protocol, anonymous);
            assert_eq!(layer.to_string(), expected, "{protocol} anonymous={anonymous}");
            assert_eq!(layer.presents_credentials(), !anonymous, "{protocol}");
        }
    }

    #[test]
    fn credentials_carried_per_protocol() {
        match layer(ProxyProtocol::Http, false) {
            TunnelLayer::HttpConnect {
                credentials: Some(credentials),
                ..
            } => {
                assert_eq!(credentials.username(), "user");
                assert_eq!(credentials.password(), "pass");
            }
            other => panic!("unexpected layer {other}"),
        }

        match layer(ProxyProtocol::Socks4, false) {
            TunnelLayer::Socks4 {
                user_id: Some(user_id),
                ..
            } => assert_eq!(&*user_id, "user"),
            other => panic!("unexpected layer {other}"),
        }

        match layer(ProxyProtocol::Socks5, false) {
            TunnelLayer::Socks5 {
                credentials: Some(credentials),
                ..
            } => assert_eq!(credentials.password(), "pass"),
            other => panic!("unexpected layer {other}"),
        }
    }

    #[test]
    fn anonymous_proxy_with_password_presents_nothing() {
        for protocol in [
            ProxyProtocol::Http,
            ProxyProtocol::Https,
            ProxyProtocol::Socks5,
        ] {
            let proxy = Proxy::new(protocol, "proxy", 8080, Some(""), Some("secret")).unwrap();
            let layer = TunnelLayer::for_proxy(&proxy, insecure_config());
            assert!(!layer.presents_credentials(), "{protocol}");
        }
    }

    #[test]
    fn https_proxy_negotiates_tls_first() {
        let layer = layer(ProxyProtocol::Https, true);
        assert_eq!(
            layer.handshakes(),
            vec![
                Handshake::ProxyTls(ProxyEndpoint::new("proxy", 8080)),
                Handshake::ProxyExchange("connect(proxy:8080, no-auth)".into()),
            ]
        );
    }

    #[test]
    fn basic_authorization() {
        let credentials = Credentials::new("user", "pass");
        assert_eq!(credentials.basic(), "Basic dXNlcjpwYXNz");
        assert!(!format!("{credentials:?}").contains("pass\""));
    }
}
