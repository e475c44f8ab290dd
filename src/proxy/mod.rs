//! Forward proxy descriptions and the tunnel layers which negotiate through them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use url::{Host, Url};

use crate::ConfigurationError;

mod connect;
mod socks;
pub mod tunnel;

pub use self::tunnel::{Credentials, TunnelLayer};

/// The protocol spoken to a forward proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyProtocol {
    /// HTTP `CONNECT` over plain TCP.
    Http,

    /// HTTP `CONNECT` over a TLS session with the proxy.
    Https,

    /// SOCKS4, with the SOCKS4a extension for hostnames.
    Socks4,

    /// SOCKS5.
    Socks5,
}

impl ProxyProtocol {
    /// The port used when a proxy URI omits one.
    pub fn default_port(&self) -> u16 {
        match self {
            ProxyProtocol::Http => 80,
            ProxyProtocol::Https => 443,
            ProxyProtocol::Socks4 | ProxyProtocol::Socks5 => 1080,
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5",
        })
    }
}

impl FromStr for ProxyProtocol {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyProtocol::Http),
            "https" => Ok(ProxyProtocol::Https),
            "socks4" | "socks4a" => Ok(ProxyProtocol::Socks4),
            "socks5" | "socks5h" => Ok(ProxyProtocol::Socks5),
            _ => Err(ConfigurationError::UnsupportedScheme(s.to_owned())),
        }
    }
}

/// Network location of a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    host: Arc<str>,
    port: u16,
}

impl ProxyEndpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<Arc<str>>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Proxy host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Proxy port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::authority(&self.host, self.port))
    }
}

/// An immutable description of a forward proxy.
///
/// A proxy is anonymous when it has no username (or an empty one). Anonymous proxies
/// never present credentials to the tunnel layer, even when a password was given.
/// Clones are cheap, so one description can be shared by every connection using it.
#[derive(Clone, PartialEq, Eq)]
pub struct Proxy {
    protocol: ProxyProtocol,
    endpoint: ProxyEndpoint,
    username: Option<Arc<str>>,
    password: Option<Arc<str>>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("protocol", &self.protocol)
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Proxy {
    /// Describe a proxy.
    ///
    /// Fails with [`ConfigurationError::PasswordWithoutUsername`] for a SOCKS4 proxy
    /// given a password but no username, since SOCKS4 only carries a user id.
    pub fn new(
        protocol: ProxyProtocol,
        host: impl Into<Arc<str>>,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, ConfigurationError> {
        let has_username = username.is_some_and(|name| !name.is_empty());
        if protocol == ProxyProtocol::Socks4 && password.is_some() && !has_username {
            return Err(ConfigurationError::PasswordWithoutUsername);
        }

        Ok(Self {
            protocol,
            endpoint: ProxyEndpoint::new(host, port),
            username: username.map(Arc::from),
            password: password.map(Arc::from),
        })
    }

    /// Describe a proxy which needs no credentials.
    pub fn anonymous(protocol: ProxyProtocol, host: impl Into<Arc<str>>, port: u16) -> Self {
        Self {
            protocol,
            endpoint: ProxyEndpoint::new(host, port),
            username: None,
            password: None,
        }
    }

    /// Describe a proxy which authenticates with a username and password.
    pub fn with_credentials(
        protocol: ProxyProtocol,
        host: impl Into<Arc<str>>,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<Self, ConfigurationError> {
        Self::new(protocol, host, port, Some(username), Some(password))
    }

    /// Parse `scheme://[user[:password]@]host[:port]`.
    ///
    /// The username and password are percent-decoded, so reserved characters such as
    /// `@` and `:` can be given as `%40` and `%3A`.
    pub fn from_uri(uri: &str) -> Result<Self, ConfigurationError> {
        let url = Url::parse(uri).map_err(|error| match error {
            url::ParseError::EmptyHost => ConfigurationError::MissingHost,
            error => ConfigurationError::InvalidUri(error),
        })?;
        let protocol: ProxyProtocol = url.scheme().parse()?;

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_owned(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(ConfigurationError::MissingHost),
        };
        let port = url.port().unwrap_or_else(|| protocol.default_port());

        let username = percent_decode(url.username())?;
        let password = url.password().map(percent_decode).transpose()?;
        let username = (!username.is_empty()).then_some(username);

        Self::new(
            protocol,
            host,
            port,
            username.as_deref(),
            password.as_deref(),
        )
    }

    /// The proxy protocol.
    pub fn protocol(&self) -> ProxyProtocol {
        self.protocol
    }

    /// The proxy host.
    pub fn host(&self) -> &str {
        self.endpoint.host()
    }

    /// The proxy port.
    pub fn port(&self) -> u16 {
        self.endpoint.port()
    }

    /// The proxy network location.
    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    /// The username, if one was given.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// The password, if one was given.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// True when no (non-empty) username was given.
    pub fn is_anonymous(&self) -> bool {
        self.username.as_deref().map_or(true, str::is_empty)
    }
}

impl FromStr for Proxy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_uri(s)
    }
}

fn percent_decode(component: &str) -> Result<String, ConfigurationError> {
    urlencoding::decode(component)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| ConfigurationError::InvalidUserinfo)
}
