//! HTTP `CONNECT` tunnels.

use bytes::{Buf, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Credentials;
use crate::rewind::Rewind;
use crate::TunnelErrorKind;

/// Upper bound on the size of the proxy's response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;
const MAX_RESPONSE_HEADERS: usize = 64;

/// Ask the proxy on `io` to open a tunnel to `host:port`.
///
/// Bytes the proxy sends after its response head belong to the tunnel and are
/// replayed by the returned stream.
pub(super) async fn connect<IO>(
    mut io: IO,
    host: &str,
    port: u16,
    credentials: Option<&Credentials>,
) -> Result<Rewind<IO>, TunnelErrorKind>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let authority = crate::authority(host, port);
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(credentials) = credentials {
        request.push_str("Proxy-Authorization: ");
        request.push_str(&credentials.basic());
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    tracing::trace!(%authority, "sending CONNECT");
    io.write_all(request.as_bytes()).await?;
    io.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let (end, code) = loop {
        if io.read_buf(&mut buf).await? == 0 {
            return Err(TunnelErrorKind::UnexpectedEof);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf).map_err(TunnelErrorKind::InvalidResponse)? {
            httparse::Status::Complete(end) => break (end, response.code),
            httparse::Status::Partial if buf.len() >= MAX_RESPONSE_HEAD => {
                return Err(TunnelErrorKind::Malformed("response head too large"));
            }
            httparse::Status::Partial => {}
        }
    };

    if end > MAX_RESPONSE_HEAD {
        return Err(TunnelErrorKind::Malformed("response head too large"));
    }

    let status = code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(TunnelErrorKind::Malformed("invalid status code"))?;
    if !status.is_success() {
        return Err(TunnelErrorKind::Rejected(status));
    }

    buf.advance(end);
    tracing::trace!(%status, extra = buf.len(), "CONNECT accepted");
    Ok(Rewind::new(io, buf.freeze()))
}
