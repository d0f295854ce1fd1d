//! Framed codec for control-channel messages.
//!
//! Frame layout: `[1 byte type tag][8 byte big-endian body length][JSON body]`.

use crate::msg::*;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size: type tag + body length.
pub const HEADER_SIZE: usize = 9;

/// Default upper bound on a single frame body.
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown message type {0:#04x}")]
    UnknownMessage(u8),

    #[error("frame body of {0} bytes exceeds limit of {1}")]
    FrameTooLarge(u64, usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn serialize_body(msg: &Message) -> Result<Vec<u8>, serde_json::Error> {
    match msg {
        Message::Login(m) => serde_json::to_vec(m),
        Message::LoginResp(m) => serde_json::to_vec(m),
        Message::NewProxy(m) => serde_json::to_vec(m),
        Message::NewProxyResp(m) => serde_json::to_vec(m),
        Message::CloseProxy(m) => serde_json::to_vec(m),
        Message::NewWorkConn(m) => serde_json::to_vec(m),
        Message::ReqWorkConn(m) => serde_json::to_vec(m),
        Message::NewVisitorConn(m) => serde_json::to_vec(m),
        Message::NewVisitorConnResp(m) => serde_json::to_vec(m),
        Message::Ping(m) => serde_json::to_vec(m),
        Message::Pong(m) => serde_json::to_vec(m),
        Message::UdpPacket(m) => serde_json::to_vec(m),
    }
}

fn deserialize_body(tag: u8, body: &[u8]) -> Result<Message, CodecError> {
    let msg = match tag {
        b'o' => Message::Login(serde_json::from_slice(body)?),
        b'1' => Message::LoginResp(serde_json::from_slice(body)?),
        b'p' => Message::NewProxy(serde_json::from_slice(body)?),
        b'2' => Message::NewProxyResp(serde_json::from_slice(body)?),
        b'c' => Message::CloseProxy(serde_json::from_slice(body)?),
        b'w' => Message::NewWorkConn(serde_json::from_slice(body)?),
        b'r' => Message::ReqWorkConn(serde_json::from_slice(body)?),
        b'v' => Message::NewVisitorConn(serde_json::from_slice(body)?),
        b'3' => Message::NewVisitorConnResp(serde_json::from_slice(body)?),
        b'h' => Message::Ping(serde_json::from_slice(body)?),
        b'4' => Message::Pong(serde_json::from_slice(body)?),
        b'u' => Message::UdpPacket(serde_json::from_slice(body)?),
        other => return Err(CodecError::UnknownMessage(other)),
    };
    Ok(msg)
}

/// Encode a message into a complete frame.
pub fn encode(msg: &Message) -> Result<Bytes, CodecError> {
    let body = serialize_body(msg)?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_u8(msg.type_byte());
    buf.put_u64(body.len() as u64);
    buf.extend_from_slice(&body);

    Ok(buf.freeze())
}

/// Decode one message from the front of `buf`, if a complete frame is present.
///
/// Returns `Ok(None)` when more data is needed. Consumes exactly one frame
/// on success and nothing on `Ok(None)`.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
    decode_with_limit(buf, DEFAULT_MAX_BODY_SIZE)
}

pub fn decode_with_limit(
    buf: &mut BytesMut,
    max_body: usize,
) -> Result<Option<Message>, CodecError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let tag = buf[0];
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&buf[1..9]);
    let len = u64::from_be_bytes(len_bytes);

    if len > max_body as u64 {
        return Err(CodecError::FrameTooLarge(len, max_body));
    }

    let len = len as usize;
    if buf.len() < HEADER_SIZE + len {
        return Ok(None);
    }

    let _ = buf.split_to(HEADER_SIZE);
    let body = buf.split_to(len);

    deserialize_body(tag, &body).map(Some)
}

/// Read exactly one framed message from a stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    read_message_with_limit(reader, DEFAULT_MAX_BODY_SIZE).await
}

/// Read one framed message, bounding the body length. Never reads past the
/// declared frame length.
pub async fn read_message_with_limit<R>(
    reader: &mut R,
    max_body: usize,
) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let tag = header[0];
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[1..9]);
    let len = u64::from_be_bytes(len_bytes);

    if len > max_body as u64 {
        return Err(CodecError::FrameTooLarge(len, max_body));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    deserialize_body(tag, &body)
}

/// Write one framed message to a stream and flush it.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
