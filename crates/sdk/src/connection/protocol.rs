//! Broker TCP protocol (`V2`): commands, frames and their codecs.
//!
//! Client commands are newline-terminated text lines; `IDENTIFY` is followed
//! by a big-endian `u32` length and a JSON body. Broker frames are
//! `[size: u32][frame type: i32][data]`, where `size` counts the type field.
//!
//! [`FrameCodec`] is the client side (encodes [`Command`], decodes [`Frame`]).
//! [`CommandCodec`] is the broker side, used by the in-process mock broker.

use std::{fmt, time::Duration};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::ensure;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolSnafu, Result, SdkError};

/// Protocol magic sent once after connecting.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Response body of a broker heartbeat.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Response acknowledging `CLS`.
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// Generic success response.
pub const OK: &[u8] = b"OK";

/// Length of a message id in bytes.
pub const MESSAGE_ID_LEN: usize = 16;

const FRAME_TYPE_RESPONSE: i32 = 0;
const FRAME_TYPE_ERROR: i32 = 1;
const FRAME_TYPE_MESSAGE: i32 = 2;

/// Timestamp + attempts + id.
const MESSAGE_HEADER_LEN: usize = 8 + 2 + MESSAGE_ID_LEN;

/// Largest frame accepted from a broker (4 MiB).
const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Opaque 16-byte message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    /// Wraps raw id bytes.
    #[must_use]
    pub fn new(bytes: [u8; MESSAGE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw id bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }

    fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; MESSAGE_ID_LEN] = slice.try_into().map_err(|_| {
            ProtocolSnafu { message: format!("message id must be {MESSAGE_ID_LEN} bytes") }.build()
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Broker ids are ASCII hex.
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Client-to-broker command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `IDENTIFY` with a JSON body.
    Identify(Bytes),
    /// `SUB topic channel`.
    Subscribe {
        /// Topic name.
        topic: String,
        /// Channel name.
        channel: String,
    },
    /// `RDY n`.
    Ready(i64),
    /// `FIN id`.
    Finish(MessageId),
    /// `REQ id delay_ms`.
    Requeue {
        /// Message to requeue.
        id: MessageId,
        /// Delay before redelivery.
        delay: Duration,
    },
    /// `TOUCH id`.
    Touch(MessageId),
    /// `NOP`.
    Nop,
    /// `CLS`.
    Close,
}

impl Command {
    /// Returns the command verb.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify(_) => "IDENTIFY",
            Self::Subscribe { .. } => "SUB",
            Self::Ready(_) => "RDY",
            Self::Finish(_) => "FIN",
            Self::Requeue { .. } => "REQ",
            Self::Touch(_) => "TOUCH",
            Self::Nop => "NOP",
            Self::Close => "CLS",
        }
    }

    fn encode_into(&self, dst: &mut BytesMut) {
        match self {
            Self::Identify(body) => {
                dst.reserve(9 + 4 + body.len());
                dst.put_slice(b"IDENTIFY\n");
                dst.put_u32(u32::try_from(body.len()).unwrap_or(u32::MAX));
                dst.put_slice(body);
            },
            Self::Subscribe { topic, channel } => {
                dst.put_slice(format!("SUB {topic} {channel}\n").as_bytes());
            },
            Self::Ready(count) => dst.put_slice(format!("RDY {count}\n").as_bytes()),
            Self::Finish(id) => put_id_line(dst, b"FIN ", id, b"\n"),
            Self::Requeue { id, delay } => {
                let suffix = format!(" {}\n", delay.as_millis());
                put_id_line(dst, b"REQ ", id, suffix.as_bytes());
            },
            Self::Touch(id) => put_id_line(dst, b"TOUCH ", id, b"\n"),
            Self::Nop => dst.put_slice(b"NOP\n"),
            Self::Close => dst.put_slice(b"CLS\n"),
        }
    }
}

fn put_id_line(dst: &mut BytesMut, prefix: &[u8], id: &MessageId, suffix: &[u8]) {
    dst.reserve(prefix.len() + MESSAGE_ID_LEN + suffix.len());
    dst.put_slice(prefix);
    dst.put_slice(id.as_bytes());
    dst.put_slice(suffix);
}

/// A message as delivered on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Broker timestamp in nanoseconds since the epoch.
    pub timestamp: i64,
    /// Delivery attempt, starting at 1.
    pub attempts: u16,
    /// Message id.
    pub id: MessageId,
    /// Payload.
    pub body: Bytes,
}

impl RawMessage {
    fn decode(mut data: Bytes) -> Result<Self> {
        ensure!(
            data.len() >= MESSAGE_HEADER_LEN,
            ProtocolSnafu { message: format!("message frame too short: {} bytes", data.len()) }
        );
        let timestamp = data.get_i64();
        let attempts = data.get_u16();
        let id = MessageId::from_slice(&data.split_to(MESSAGE_ID_LEN))?;
        Ok(Self { timestamp, attempts, id, body: data })
    }
}

/// Broker-to-client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Response such as `OK`, `_heartbeat_`, `CLOSE_WAIT` or IDENTIFY JSON.
    Response(Bytes),
    /// Error such as `E_INVALID`.
    Error(Bytes),
    /// Delivered message.
    Message(RawMessage),
}

impl Frame {
    /// Returns true for the heartbeat response.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Response(body) if body.as_ref() == HEARTBEAT)
    }
}

/// Client-side codec.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self { max_frame_size: DEFAULT_MAX_FRAME_SIZE }
    }
}

impl FrameCodec {
    /// Creates a codec rejecting frames larger than `max_frame_size`.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = SdkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut size_bytes = [0u8; 4];
        size_bytes.copy_from_slice(&src[..4]);
        let size = u32::from_be_bytes(size_bytes) as usize;

        ensure!(
            (4..=self.max_frame_size).contains(&size),
            ProtocolSnafu { message: format!("invalid frame size {size}") }
        );

        if src.len() < 4 + size {
            src.reserve(4 + size - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut data = src.split_to(size).freeze();
        let frame_type = data.get_i32();

        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Some(Frame::Response(data))),
            FRAME_TYPE_ERROR => Ok(Some(Frame::Error(data))),
            FRAME_TYPE_MESSAGE => Ok(Some(Frame::Message(RawMessage::decode(data)?))),
            other => ProtocolSnafu { message: format!("unknown frame type {other}") }.fail(),
        }
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = SdkError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<()> {
        command.encode_into(dst);
        Ok(())
    }
}

/// Broker-side codec: decodes [`Command`], encodes [`Frame`].
///
/// The protocol magic is not part of the command stream and must be
/// consumed before framing.
#[derive(Debug, Clone, Default)]
pub struct CommandCodec;

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = SdkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>> {
        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };

        if &src[..newline] == b"IDENTIFY" {
            let header = newline + 1;
            if src.len() < header + 4 {
                return Ok(None);
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&src[header..header + 4]);
            let len = u32::from_be_bytes(len_bytes) as usize;
            if src.len() < header + 4 + len {
                return Ok(None);
            }
            src.advance(header + 4);
            return Ok(Some(Command::Identify(src.split_to(len).freeze())));
        }

        let line = src.split_to(newline + 1).freeze();
        let line = &line[..newline];
        parse_command_line(line).map(Some)
    }
}

fn parse_command_line(line: &[u8]) -> Result<Command> {
    let mut parts = line.splitn(3, |b| *b == b' ');
    let verb = parts.next().unwrap_or_default();
    let first = parts.next();
    let second = parts.next();

    let text = |field: Option<&[u8]>, what: &str| -> Result<String> {
        let field = field.ok_or_else(|| {
            ProtocolSnafu { message: format!("missing {what} in command") }.build()
        })?;
        String::from_utf8(field.to_vec())
            .map_err(|_| ProtocolSnafu { message: format!("{what} is not UTF-8") }.build())
    };

    match verb {
        b"SUB" => Ok(Command::Subscribe {
            topic: text(first, "topic")?,
            channel: text(second, "channel")?,
        }),
        b"RDY" => {
            let count = text(first, "count")?.parse().map_err(|e| {
                ProtocolSnafu { message: format!("invalid RDY count: {e}") }.build()
            })?;
            Ok(Command::Ready(count))
        },
        b"FIN" => Ok(Command::Finish(id_field(first)?)),
        b"TOUCH" => Ok(Command::Touch(id_field(first)?)),
        b"REQ" => {
            let millis: u64 = text(second, "timeout")?.parse().map_err(|e| {
                ProtocolSnafu { message: format!("invalid REQ timeout: {e}") }.build()
            })?;
            Ok(Command::Requeue { id: id_field(first)?, delay: Duration::from_millis(millis) })
        },
        b"NOP" => Ok(Command::Nop),
        b"CLS" => Ok(Command::Close),
        other => ProtocolSnafu {
            message: format!("unknown command {}", String::from_utf8_lossy(other)),
        }
        .fail(),
    }
}

fn id_field(field: Option<&[u8]>) -> Result<MessageId> {
    let field = field.ok_or_else(|| ProtocolSnafu { message: "missing message id" }.build())?;
    MessageId::from_slice(field)
}

impl Encoder<Frame> for CommandCodec {
    type Error = SdkError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let (frame_type, payload_len) = match &frame {
            Frame::Response(body) => (FRAME_TYPE_RESPONSE, body.len()),
            Frame::Error(body) => (FRAME_TYPE_ERROR, body.len()),
            Frame::Message(msg) => (FRAME_TYPE_MESSAGE, MESSAGE_HEADER_LEN + msg.body.len()),
        };
        let size = u32::try_from(4 + payload_len)
            .map_err(|_| ProtocolSnafu { message: "frame too large" }.build())?;

        dst.reserve(8 + payload_len);
        dst.put_u32(size);
        dst.put_i32(frame_type);
        match frame {
            Frame::Response(body) | Frame::Error(body) => dst.put_slice(&body),
            Frame::Message(msg) => {
                dst.put_i64(msg.timestamp);
                dst.put_u16(msg.attempts);
                dst.put_slice(msg.id.as_bytes());
                dst.put_slice(&msg.body);
            },
        }
        Ok(())
    }
}
