//! Stream multiplexer: carries many logical streams over a single
//! client-server connection.
//!
//! The server is the passive side: it accepts streams opened by the client
//! and hands each out as a fresh bidirectional connection. Flow control is
//! credit-based per stream; the session is kept alive with periodic pings
//! and torn down after prolonged silence.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf,
    WriteHalf,
};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const FRAME_HEADER_SIZE: usize = 12;
const PROTO_VERSION: u8 = 0;

const TYPE_DATA: u8 = 0x0;
const TYPE_WINDOW_UPDATE: u8 = 0x1;
const TYPE_PING: u8 = 0x2;
const TYPE_GO_AWAY: u8 = 0x3;

const FLAG_SYN: u16 = 0x1;
const FLAG_ACK: u16 = 0x2;
const FLAG_FIN: u16 = 0x4;
const FLAG_RST: u16 = 0x8;

/// Hard cap on a single data frame, independent of stream windows.
const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Interval between keep-alive pings.
    pub keepalive_interval: Duration,
    /// Per-stream receive window granted to the peer.
    pub initial_window: u32,
    /// Bound on streams accepted but not yet picked up.
    pub accept_backlog: usize,
    /// Largest data frame the outbound pump will emit.
    pub max_payload: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            initial_window: 256 * 1024,
            accept_backlog: 64,
            max_payload: 16 * 1024,
        }
    }
}

impl MuxConfig {
    /// Silence beyond this closes the whole session.
    fn silence_timeout(&self) -> Duration {
        self.keepalive_interval * 3
    }
}

#[derive(Debug)]
struct Frame {
    typ: u8,
    flags: u16,
    stream_id: u32,
    /// Payload length for data frames; credit delta for window updates;
    /// opaque value for pings.
    length: u32,
    payload: Bytes,
}

impl Frame {
    fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            typ: TYPE_DATA,
            flags: 0,
            stream_id,
            length: payload.len() as u32,
            payload,
        }
    }

    fn data_fin(stream_id: u32) -> Self {
        Self {
            typ: TYPE_DATA,
            flags: FLAG_FIN,
            stream_id,
            length: 0,
            payload: Bytes::new(),
        }
    }

    fn rst(stream_id: u32) -> Self {
        Self {
            typ: TYPE_DATA,
            flags: FLAG_RST,
            stream_id,
            length: 0,
            payload: Bytes::new(),
        }
    }

    fn window_update(stream_id: u32, flags: u16, delta: u32) -> Self {
        Self {
            typ: TYPE_WINDOW_UPDATE,
            flags,
            stream_id,
            length: delta,
            payload: Bytes::new(),
        }
    }

    fn ping(flags: u16, value: u32) -> Self {
        Self {
            typ: TYPE_PING,
            flags,
            stream_id: 0,
            length: value,
            payload: Bytes::new(),
        }
    }

    fn go_away() -> Self {
        Self {
            typ: TYPE_GO_AWAY,
            flags: 0,
            stream_id: 0,
            length: 0,
            payload: Bytes::new(),
        }
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(PROTO_VERSION);
        buf.put_u8(self.typ);
        buf.put_u16(self.flags);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.length);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

async fn read_frame<R>(reader: &mut R) -> Result<Frame, MuxError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    if header[0] != PROTO_VERSION {
        return Err(MuxError::Protocol(format!(
            "unsupported frame version {}",
            header[0]
        )));
    }

    let typ = header[1];
    let flags = u16::from_be_bytes([header[2], header[3]]);
    let stream_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let length = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

    let payload = if typ == TYPE_DATA && length > 0 {
        if length as usize > MAX_FRAME_PAYLOAD {
            return Err(MuxError::Protocol(format!(
                "data frame of {} bytes exceeds cap",
                length
            )));
        }
        let mut body = vec![0u8; length as usize];
        reader.read_exact(&mut body).await?;
        Bytes::from(body)
    } else {
        Bytes::new()
    };

    Ok(Frame {
        typ,
        flags,
        stream_id,
        length,
        payload,
    })
}

/// One accepted logical stream. Reads and writes like any other connection.
pub struct MuxStream {
    stream_id: u32,
    io: DuplexStream,
}

impl MuxStream {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

struct StreamEntry {
    to_app: WriteHalf<DuplexStream>,
    send_window: Arc<Semaphore>,
}

/// Server half of a multiplexed session.
pub struct MuxSession {
    accept_rx: mpsc::Receiver<MuxStream>,
    shutdown: Arc<Notify>,
}

impl MuxSession {
    /// Wrap `conn` as the passive side of a mux session.
    pub fn server<S>(conn: S, config: MuxConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(64);
        let shutdown = Arc::new(Notify::new());
        let last_recv = Arc::new(Mutex::new(Instant::now()));

        let (read_half, write_half) = tokio::io::split(conn);

        tokio::spawn(write_loop(write_half, frame_rx));
        tokio::spawn(read_loop(
            read_half,
            accept_tx,
            frame_tx.clone(),
            shutdown.clone(),
            last_recv.clone(),
            config.clone(),
        ));
        tokio::spawn(keepalive_loop(
            frame_tx,
            shutdown.clone(),
            last_recv,
            config,
        ));

        Self {
            accept_rx,
            shutdown,
        }
    }

    /// Next stream opened by the client, or `None` once the session is dead.
    pub async fn accept(&mut self) -> Option<MuxStream> {
        self.accept_rx.recv().await
    }

    /// Tear the whole session down. Individual stream closes never do this.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }
}

async fn write_loop<W>(mut writer: WriteHalf<W>, mut frame_rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Send + 'static,
{
    while let Some(frame) = frame_rx.recv().await {
        if writer.write_all(&frame.encode()).await.is_err() {
            return;
        }
        if writer.flush().await.is_err() {
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_loop<R>(
    mut reader: ReadHalf<R>,
    accept_tx: mpsc::Sender<MuxStream>,
    frame_tx: mpsc::Sender<Frame>,
    shutdown: Arc<Notify>,
    last_recv: Arc<Mutex<Instant>>,
    config: MuxConfig,
) where
    R: AsyncRead + Send + 'static,
{
    let mut streams: HashMap<u32, StreamEntry> = HashMap::new();
    let (cleanup_tx, mut cleanup_rx) = mpsc::unbounded_channel::<u32>();

    loop {
        // Drop state for streams whose pumps have finished. Doing this
        // outside the select keeps frame reads cancellation-safe.
        while let Ok(id) = cleanup_rx.try_recv() {
            streams.remove(&id);
        }

        let frame = tokio::select! {
            frame = read_frame(&mut reader) => match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("mux session read ended: {}", e);
                    break;
                }
            },
            _ = shutdown.notified() => break,
        };

        *last_recv.lock().unwrap() = Instant::now();

        match frame.typ {
            TYPE_DATA | TYPE_WINDOW_UPDATE => {
                if frame.flags & FLAG_SYN != 0 && !streams.contains_key(&frame.stream_id) {
                    open_stream(
                        frame.stream_id,
                        &mut streams,
                        &accept_tx,
                        &frame_tx,
                        &cleanup_tx,
                        &config,
                    )
                    .await;
                }

                if frame.flags & FLAG_RST != 0 {
                    streams.remove(&frame.stream_id);
                    continue;
                }

                if frame.typ == TYPE_WINDOW_UPDATE {
                    if let Some(entry) = streams.get(&frame.stream_id) {
                        entry.send_window.add_permits(frame.length as usize);
                    }
                    continue;
                }

                let fin = frame.flags & FLAG_FIN != 0;
                let mut reset = false;
                match streams.get_mut(&frame.stream_id) {
                    Some(entry) => {
                        if !frame.payload.is_empty() {
                            let len = frame.payload.len() as u32;
                            if entry.to_app.write_all(&frame.payload).await.is_err() {
                                reset = true;
                            } else {
                                // Data entered the stream buffer, hand credit back.
                                let _ = frame_tx
                                    .send(Frame::window_update(frame.stream_id, 0, len))
                                    .await;
                            }
                        }
                        if fin && !reset {
                            let _ = entry.to_app.shutdown().await;
                        }
                    }
                    None => {
                        if !frame.payload.is_empty() {
                            trace!("data for unknown stream {}", frame.stream_id);
                            let _ = frame_tx.send(Frame::rst(frame.stream_id)).await;
                        }
                    }
                }
                if reset {
                    streams.remove(&frame.stream_id);
                    let _ = frame_tx.send(Frame::rst(frame.stream_id)).await;
                }
            }
            TYPE_PING => {
                if frame.flags & FLAG_SYN != 0 {
                    let _ = frame_tx.send(Frame::ping(FLAG_ACK, frame.length)).await;
                }
            }
            TYPE_GO_AWAY => {
                debug!("mux session closed by peer");
                break;
            }
            other => {
                warn!("unknown mux frame type {:#04x}, closing session", other);
                break;
            }
        }
    }
}

async fn open_stream(
    stream_id: u32,
    streams: &mut HashMap<u32, StreamEntry>,
    accept_tx: &mpsc::Sender<MuxStream>,
    frame_tx: &mpsc::Sender<Frame>,
    cleanup_tx: &mpsc::UnboundedSender<u32>,
    config: &MuxConfig,
) {
    let (session_io, app_io) = tokio::io::duplex(config.initial_window as usize);
    let (session_read, session_write) = tokio::io::split(session_io);

    let stream = MuxStream {
        stream_id,
        io: app_io,
    };
    if accept_tx.try_send(stream).is_err() {
        warn!(
            "mux accept backlog full, resetting stream {}",
            stream_id
        );
        let _ = frame_tx.send(Frame::rst(stream_id)).await;
        return;
    }

    let send_window = Arc::new(Semaphore::new(config.initial_window as usize));
    streams.insert(
        stream_id,
        StreamEntry {
            to_app: session_write,
            send_window: send_window.clone(),
        },
    );

    tokio::spawn(outbound_pump(
        stream_id,
        session_read,
        frame_tx.clone(),
        send_window,
        cleanup_tx.clone(),
        config.max_payload,
    ));

    let _ = frame_tx
        .send(Frame::window_update(stream_id, FLAG_ACK, 0))
        .await;
    debug!("accepted mux stream {}", stream_id);
}

/// Moves bytes the application writes into data frames, spending send-window
/// credit as it goes.
async fn outbound_pump(
    stream_id: u32,
    mut session_read: ReadHalf<DuplexStream>,
    frame_tx: mpsc::Sender<Frame>,
    send_window: Arc<Semaphore>,
    cleanup_tx: mpsc::UnboundedSender<u32>,
    max_payload: usize,
) {
    let mut buf = vec![0u8; max_payload];
    loop {
        let n = match session_read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        match send_window.acquire_many(n as u32).await {
            Ok(permit) => permit.forget(),
            Err(_) => break,
        }

        let payload = Bytes::copy_from_slice(&buf[..n]);
        if frame_tx.send(Frame::data(stream_id, payload)).await.is_err() {
            break;
        }
    }

    let _ = frame_tx.send(Frame::data_fin(stream_id)).await;
    let _ = cleanup_tx.send(stream_id);
}

async fn keepalive_loop(
    frame_tx: mpsc::Sender<Frame>,
    shutdown: Arc<Notify>,
    last_recv: Arc<Mutex<Instant>>,
    config: MuxConfig,
) {
    let mut ping_value: u32 = 0;
    loop {
        tokio::time::sleep(config.keepalive_interval).await;

        let silent_for = last_recv.lock().unwrap().elapsed();
        if silent_for > config.silence_timeout() {
            warn!(
                "mux session silent for {:?}, closing",
                silent_for
            );
            let _ = frame_tx.send(Frame::go_away()).await;
            shutdown.notify_one();
            return;
        }

        ping_value = ping_value.wrapping_add(1);
        if frame_tx.send(Frame::ping(FLAG_SYN, ping_value)).await.is_err() {
            return;
        }
    }
}
