//! SOCKS4/4a and SOCKS5 `CONNECT` negotiation over an already connected socket.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};

use super::Credentials;
use crate::TunnelErrorKind;

/// Split `host` into the form sent to the proxy and its IP address, if it is one.
fn target(host: &str) -> Result<(&str, Option<IpAddr>), TunnelErrorKind> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(TunnelErrorKind::UnsupportedAddress);
    }
    Ok((host, host.parse().ok()))
}

fn socks_error(error: tokio_socks::Error) -> TunnelErrorKind {
    match error {
        tokio_socks::Error::Io(error) => error.into(),
        tokio_socks::Error::NoAcceptableAuthMethods => TunnelErrorKind::NoAcceptableAuthMethod,
        tokio_socks::Error::PasswordAuthFailure(_) => TunnelErrorKind::AuthenticationFailed,
        tokio_socks::Error::InvalidAuthValues(_) => TunnelErrorKind::InvalidCredentials,
        error => TunnelErrorKind::Socks(error),
    }
}

/// Open a SOCKS4 tunnel to `host:port`.
///
/// Hostnames are sent with the SOCKS4a extension and resolved by the proxy.
/// IPv6 targets cannot be expressed in SOCKS4.
pub(super) async fn socks4<IO>(
    io: IO,
    host: &str,
    port: u16,
    user_id: Option<&str>,
) -> Result<IO, TunnelErrorKind>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (host, address) = target(host)?;
    if matches!(address, Some(IpAddr::V6(_))) {
        return Err(TunnelErrorKind::UnsupportedAddress);
    }

    tracing::trace!(socks4a = address.is_none(), "sending socks4 connect");
    let stream = match user_id {
        Some(user_id) => {
            Socks4Stream::connect_with_userid_and_socket(io, (host, port), user_id).await
        }
        None => Socks4Stream::connect_with_socket(io, (host, port)).await,
    }
    .map_err(socks_error)?;

    Ok(stream.into_inner())
}

/// Open a SOCKS5 tunnel to `host:port`.
///
/// With credentials, both "no authentication" and "username/password" are offered
/// and the proxy chooses. Without, only "no authentication" is offered.
pub(super) async fn socks5<IO>(
    io: IO,
    host: &str,
    port: u16,
    credentials: Option<&Credentials>,
) -> Result<IO, TunnelErrorKind>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    // RFC 1929 length fields are one byte and may not be zero.
    if let Some(credentials) = credentials {
        let valid = |field: &str| (1..=255).contains(&field.len());
        if !valid(credentials.username()) || !valid(credentials.password()) {
            return Err(TunnelErrorKind::InvalidCredentials);
        }
    }

    let (host, address) = target(host)?;
    if address.is_none() && host.len() > 255 {
        return Err(TunnelErrorKind::UnsupportedAddress);
    }

    tracing::trace!(auth = credentials.is_some(), "sending socks5 connect");
    let stream = match credentials {
        Some(credentials) => {
            Socks5Stream::connect_with_password_and_socket(
                io,
                (host, port),
                credentials.username(),
                credentials.password(),
            )
            .await
        }
        None => Socks5Stream::connect_with_socket(io, (host, port)).await,
    }
    .map_err(socks_error)?;

    Ok(stream.into_inner())
}
