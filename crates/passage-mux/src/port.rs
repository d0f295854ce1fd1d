//! Port multiplexer: fans one TCP listener out into protocol-typed
//! sub-listeners by sniffing the first bytes of each connection.

use crate::sniff::SNIFF_LEN;
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long to wait for sniffable bytes before falling through to the
/// default listener.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on each sub-listener's accept queue. Overflow closes the conn.
pub const ACCEPT_BACKLOG: usize = 64;

/// A stream with sniffed bytes stitched back onto the front.
pub struct SniffedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> SniffedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Bytes consumed by sniffing that the next reader will see first.
    pub fn sniffed(&self) -> &[u8] {
        &self.prefix
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Connection handed out by a [`SubListener`].
pub type MuxedConn = SniffedStream<TcpStream>;

/// Accept side of one protocol match.
pub struct SubListener {
    name: &'static str,
    rx: mpsc::Receiver<(MuxedConn, SocketAddr)>,
}

impl SubListener {
    /// Next matched connection, or `None` once the muxer has stopped.
    pub async fn accept(&mut self) -> Option<(MuxedConn, SocketAddr)> {
        self.rx.recv().await
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

struct Matcher {
    name: &'static str,
    matches: fn(&[u8]) -> bool,
    tx: mpsc::Sender<(MuxedConn, SocketAddr)>,
}

/// Sniffing demultiplexer over one TCP listener.
///
/// Matchers claim connections in registration order; anything unmatched,
/// unreadable, or slow to send its first bytes goes to the default listener.
pub struct PortMux {
    matchers: Vec<Matcher>,
    default_tx: mpsc::Sender<(MuxedConn, SocketAddr)>,
    default_rx: Option<SubListener>,
    sniff_timeout: Duration,
}

impl PortMux {
    pub fn new() -> Self {
        let (default_tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        Self {
            matchers: Vec::new(),
            default_tx,
            default_rx: Some(SubListener { name: "default", rx }),
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
        }
    }

    pub fn with_sniff_timeout(mut self, timeout: Duration) -> Self {
        self.sniff_timeout = timeout;
        self
    }

    /// Register a matcher. Earlier registrations win on overlapping matches.
    pub fn listen(&mut self, name: &'static str, matches: fn(&[u8]) -> bool) -> SubListener {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        self.matchers.push(Matcher { name, matches, tx });
        SubListener { name, rx }
    }

    /// The fall-through listener for unmatched traffic.
    pub fn default_listener(&mut self) -> SubListener {
        self.default_rx.take().expect("default listener already taken")
    }

    /// Accept loop. Runs until the TCP listener fails.
    pub async fn serve(self, listener: TcpListener) {
        let matchers = std::sync::Arc::new(self.matchers);
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("port mux listener closed: {}", e);
                    return;
                }
            };

            let matchers = matchers.clone();
            let default_tx = self.default_tx.clone();
            let sniff_timeout = self.sniff_timeout;
            tokio::spawn(async move {
                route_connection(stream, peer_addr, &matchers, default_tx, sniff_timeout).await;
            });
        }
    }
}

impl Default for PortMux {
    fn default() -> Self {
        Self::new()
    }
}

async fn route_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    matchers: &[Matcher],
    default_tx: mpsc::Sender<(MuxedConn, SocketAddr)>,
    sniff_timeout: Duration,
) {
    let prefix = sniff_prefix(&mut stream, sniff_timeout).await;
    let conn = SniffedStream::new(prefix.freeze(), stream);

    let (name, tx) = match matchers.iter().find(|m| (m.matches)(conn.sniffed())) {
        Some(m) => (m.name, &m.tx),
        None => ("default", &default_tx),
    };

    debug!("connection from {} routed to {} listener", peer_addr, name);
    if tx.try_send((conn, peer_addr)).is_err() {
        warn!(
            "{} accept queue full, dropping connection from {}",
            name, peer_addr
        );
    }
}

/// Read up to [`SNIFF_LEN`] bytes without losing them; stops at EOF, error,
/// or the sniff deadline. Whatever was gathered is what matchers see.
async fn sniff_prefix(stream: &mut TcpStream, timeout: Duration) -> BytesMut {
    let mut buf = BytesMut::with_capacity(SNIFF_LEN);
    let deadline = Instant::now() + timeout;

    while buf.len() < SNIFF_LEN {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, stream.read_buf(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }

    buf
}
