//! HTTP reverse proxy keyed on the Host header.
//!
//! Only the request head is parsed; after routing (and an optional Host
//! rewrite) the connection degrades to a bidirectional byte splice, which
//! carries WebSocket upgrades and chunked bodies without special handling.

use crate::table::{RouteTable, VhostError};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace};

const MAX_HEADERS: usize = 100;

const NOT_FOUND_RESPONSE: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone)]
pub struct HttpProxyConfig {
    /// Deadline for receiving a complete request head.
    pub request_timeout: Duration,
    /// Upper bound on the request head.
    pub max_header_size: usize,
}

impl Default for HttpProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_header_size: 64 * 1024,
        }
    }
}

/// Serve one inbound HTTP connection: route the first request by Host and
/// path, forward the (possibly rewritten) head, then splice bytes until
/// either side closes.
pub async fn handle_http_connection<S>(
    table: &RouteTable,
    mut conn: S,
    config: &HttpProxyConfig,
) -> Result<(), VhostError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let buf = read_request_head(&mut conn, config).await?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req
        .parse(&buf)
        .map_err(|e| VhostError::InvalidRequest(e.to_string()))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(VhostError::InvalidRequest(
                "incomplete request head".to_string(),
            ))
        }
    };

    let host = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(normalize_host)
        .ok_or_else(|| VhostError::InvalidRequest("missing Host header".to_string()))?;
    let path = req.path.unwrap_or("/").to_string();

    let matched = match table.lookup(&host, &path) {
        Some(m) => m,
        None => {
            debug!("no vhost route for host {} path {}", host, path);
            let _ = conn.write_all(NOT_FOUND_RESPONSE).await;
            return Err(VhostError::NoRoute(host));
        }
    };

    trace!("routing http request for {}{} to {}", host, path, matched.name);
    let mut backend = matched.target.open().await?;

    let head = if let Some(rewrite) = matched.rewrite_host.as_deref() {
        rewrite_host_header(&buf[..head_len], rewrite)
    } else {
        buf[..head_len].to_vec()
    };
    backend.write_all(&head).await?;
    if buf.len() > head_len {
        backend.write_all(&buf[head_len..]).await?;
    }
    backend.flush().await?;

    let (up, down) = tokio::io::copy_bidirectional(&mut conn, &mut backend).await?;
    trace!("http splice for {} done ({} up, {} down)", host, up, down);
    Ok(())
}

async fn read_request_head<S>(conn: &mut S, config: &HttpProxyConfig) -> Result<BytesMut, VhostError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let deadline = Instant::now() + config.request_timeout;

    loop {
        if find_head_end(&buf).is_some() {
            return Ok(buf);
        }
        if buf.len() > config.max_header_size {
            return Err(VhostError::InvalidRequest(
                "request head too large".to_string(),
            ));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(VhostError::Timeout);
        }
        match tokio::time::timeout(remaining, conn.read_buf(&mut buf)).await {
            Ok(Ok(0)) => {
                return Err(VhostError::InvalidRequest(
                    "connection closed before request head".to_string(),
                ))
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(VhostError::Timeout),
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Strip an optional `:port` suffix and lowercase the host.
fn normalize_host(host: &str) -> String {
    host.split(':').next().unwrap_or(host).trim().to_ascii_lowercase()
}

/// Replace the Host header value in a raw request head, leaving every other
/// byte untouched.
fn rewrite_host_header(head: &[u8], new_host: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(head.len() + new_host.len());
    let mut rest = head;

    while let Some(pos) = rest.windows(2).position(|w| w == b"\r\n") {
        let line = &rest[..pos];
        if line
            .iter()
            .position(|&b| b == b':')
            .map(|c| line[..c].eq_ignore_ascii_case(b"host"))
            .unwrap_or(false)
        {
            out.extend_from_slice(b"Host: ");
            out.extend_from_slice(new_host.as_bytes());
        } else {
            out.extend_from_slice(line);
        }
        out.extend_from_slice(b"\r\n");
        rest = &rest[pos + 2..];
    }
    out.extend_from_slice(rest);
    out
}
