//! Wire protocol framing and payload types.
//!
//! Every message on the wire is a fixed 12-byte header followed by a JSON
//! payload:
//!
//! ```text
//! offset 0  u32 magic           (constant 0x12345678)
//! offset 4  u32 message_type    (1=REQUEST, 2=RESPONSE, 4=CLOSE)
//! offset 8  u32 payload_length  (bytes of UTF-8 JSON that follow)
//! ```
//!
//! All header integers are big-endian. Payload lengths outside (0, 1 MiB]
//! are rejected before any payload byte is read.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic constant opening every frame header.
pub const MAGIC: u32 = 0x1234_5678;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 12;

/// Maximum accepted payload length.
pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024;

/// Frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Client request carrying a [`RequestPayload`].
    Request,
    /// Server response carrying a [`ResponsePayload`].
    Response,
    /// Client asks for the connection to be closed.
    Close,
}

impl MsgType {
    /// Wire value of this tag.
    pub fn as_u32(self) -> u32 {
        match self {
            MsgType::Request => 1,
            MsgType::Response => 2,
            MsgType::Close => 4,
        }
    }

    /// Decode a wire value, if it names a known tag.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(MsgType::Request),
            2 => Some(MsgType::Response),
            4 => Some(MsgType::Close),
            _ => None,
        }
    }
}

/// Errors produced while reading or validating frames.
///
/// Everything except `ConnectionClosed` is fatal to the connection it
/// occurred on; no error here is fatal to the process.
#[derive(Debug)]
pub enum FrameError {
    /// Peer closed the stream cleanly between frames.
    ConnectionClosed,
    /// Stream ended inside a header.
    TruncatedHeader { got: usize },
    /// Header magic did not match [`MAGIC`].
    ProtocolMismatch { found: u32 },
    /// Declared payload length outside (0, 1 MiB].
    InvalidLength(u32),
    /// Stream ended inside a payload.
    TruncatedPayload { expected: usize, got: usize },
    /// Type value the receiver cannot act on.
    UnsupportedType(u32),
    /// Underlying socket error.
    Io(std::io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::ConnectionClosed => write!(f, "connection closed by peer"),
            FrameError::TruncatedHeader { got } => {
                write!(f, "stream ended inside header ({} of {} bytes)", got, HEADER_LEN)
            }
            FrameError::ProtocolMismatch { found } => {
                write!(f, "bad magic {:#010x} (expected {:#010x})", found, MAGIC)
            }
            FrameError::InvalidLength(len) => {
                write!(f, "payload length {} outside (0, {}]", len, MAX_PAYLOAD_LEN)
            }
            FrameError::TruncatedPayload { expected, got } => {
                write!(f, "stream ended inside payload ({} of {} bytes)", got, expected)
            }
            FrameError::UnsupportedType(value) => {
                write!(f, "unsupported message type {}", value)
            }
            FrameError::Io(e) => write!(f, "socket error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Decoded and validated frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: MsgType,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Parse a raw 12-byte header.
    ///
    /// Validation order mirrors the read path: magic first, then payload
    /// bounds, then the type tag.
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let mut buf = &raw[..];
        let magic = buf.get_u32();
        let raw_type = buf.get_u32();
        let payload_len = buf.get_u32();

        if magic != MAGIC {
            return Err(FrameError::ProtocolMismatch { found: magic });
        }
        if payload_len == 0 || payload_len > MAX_PAYLOAD_LEN {
            return Err(FrameError::InvalidLength(payload_len));
        }
        let msg_type =
            MsgType::from_u32(raw_type).ok_or(FrameError::UnsupportedType(raw_type))?;

        Ok(FrameHeader {
            msg_type,
            payload_len,
        })
    }
}

/// Read one frame, returning its header and payload bytes.
///
/// A clean end-of-stream before any header byte maps to
/// [`FrameError::ConnectionClosed`]; end-of-stream anywhere else inside the
/// frame maps to the matching truncation error. An oversized declared length
/// fails before any payload byte is read.
pub async fn read_frame<R>(reader: &mut R) -> Result<(FrameHeader, Vec<u8>), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut raw[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                FrameError::ConnectionClosed
            } else {
                FrameError::TruncatedHeader { got: filled }
            });
        }
        filled += n;
    }

    let header = FrameHeader::parse(&raw)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    let mut filled = 0;
    while filled < payload.len() {
        let n = reader.read(&mut payload[filled..]).await?;
        if n == 0 {
            return Err(FrameError::TruncatedPayload {
                expected: payload.len(),
                got: filled,
            });
        }
        filled += n;
    }

    Ok((header, payload))
}

/// Encode a header plus payload into a single buffer.
pub fn encode_frame(msg_type: MsgType, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(MAGIC);
    buf.put_u32(msg_type.as_u32());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf
}

/// Write one frame to `writer`.
pub async fn write_frame<W>(
    writer: &mut W,
    msg_type: MsgType,
    payload: &[u8],
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg_type, payload);
    writer.write_all(&frame).await?;
    Ok(())
}

/// Message identifier that clients may send as either a string or an
/// integer. Normalized to its string form at the metrics boundary via
/// `Display`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Text(String),
    Numeric(i64),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Text(s) => f.write_str(s),
            MessageId::Numeric(n) => write!(f, "{}", n),
        }
    }
}

/// Client request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub client_id: String,
    pub message_id: MessageId,
    /// Client send time, seconds since the unix epoch.
    pub timestamp: f64,
    /// Opaque benchmark data.
    pub data: String,
}

/// Server response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub status: String,
    pub server_id: String,
    /// Server-side processing duration in seconds.
    pub processing_time: f64,
    pub response_message: String,
}
