//! Tessera wire format: stream frames and pipe control messages.
//!
//! Every length is a big-endian u64. A frame carries one encoded bundle:
//!
//! ```text
//! u64 encoding_name_len | encoding_name | u64 payload_len | payload
//! ```
//!
//! The subprocess pipe prefixes each message with a one-byte control kind:
//!
//! ```text
//! 0x01 STOP
//! 0x02 EXCEPTION  u64 body_len | cdr{summary: string, trace_lines: [string]}
//! 0x03 PARCEL     frame
//! ```
//!
//! Receivers accumulate bytes until `has_full_*` reports a complete message,
//! then decode exactly one and leave the remainder buffered. Lengths are
//! bounded so that a corrupt prefix fails fast instead of stalling the
//! connection while it waits for gigabytes that will never arrive.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::cdr;
use crate::codec::{DecodeError, Schema};

/// Upper bound on the encoding name.
pub const MAX_ENCODING_NAME: u64 = 64;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_PAYLOAD: u64 = 256 * 1024 * 1024;

/// Upper bound on an EXCEPTION body.
pub const MAX_EXCEPTION_BODY: u64 = 1024 * 1024;

// ── Frames ────────────────────────────────────────────────────────────────────

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub encoding: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(encoding: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            encoding: encoding.into(),
            payload: payload.into(),
        }
    }
}

pub fn encode_frame(encoding: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + encoding.len() + payload.len());
    out.put_u64(encoding.len() as u64);
    out.put_slice(encoding.as_bytes());
    out.put_u64(payload.len() as u64);
    out.put_slice(payload);
    out
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let bytes: [u8; 8] = buf.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Total length of the frame at the start of `buf`, once the headers are in.
///
/// `Ok(None)` means more bytes are needed to know. An error means the
/// header is corrupt and the stream cannot be resynchronized.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    let Some(name_len) = read_u64(buf, 0) else {
        return Ok(None);
    };
    if name_len > MAX_ENCODING_NAME {
        return Err(FrameError::EncodingNameTooLong(name_len));
    }
    let payload_at = 8 + name_len as usize;
    let Some(payload_len) = read_u64(buf, payload_at) else {
        return Ok(None);
    };
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload_len));
    }
    Ok(Some(payload_at + 8 + payload_len as usize))
}

/// True once `decode_frame` would make progress: a complete frame is
/// buffered, or the header is already known to be corrupt.
pub fn has_full_frame(buf: &[u8]) -> bool {
    match frame_len(buf) {
        Ok(Some(total)) => buf.len() >= total,
        Ok(None) => false,
        Err(_) => true,
    }
}

/// Split exactly one frame off the front of `buf`.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    let total = match frame_len(buf)? {
        Some(total) if buf.len() >= total => total,
        _ => return Ok(None),
    };
    let mut frame = buf.split_to(total);
    let name_len = frame.get_u64() as usize;
    let name = frame.split_to(name_len);
    let encoding = String::from_utf8(name.to_vec()).map_err(|_| FrameError::InvalidEncodingName)?;
    frame.advance(8);
    Ok(Some(Frame {
        encoding,
        payload: frame.freeze(),
    }))
}

// ── Control messages ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlKind {
    Stop = 1,
    Exception = 2,
    Parcel = 3,
}

impl TryFrom<u8> for ControlKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Stop),
            2 => Ok(Self::Exception),
            3 => Ok(Self::Parcel),
            other => Err(FrameError::UnknownControl(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Graceful shutdown request.
    Stop,
    /// The child hit a failure it could not handle.
    Exception {
        summary: String,
        trace_lines: Vec<String>,
    },
    Parcel(Frame),
}

impl ControlMessage {
    pub fn kind(&self) -> ControlKind {
        match self {
            Self::Stop => ControlKind::Stop,
            Self::Exception { .. } => ControlKind::Exception,
            Self::Parcel(_) => ControlKind::Parcel,
        }
    }
}

fn exception_schema() -> Schema {
    Schema::record([
        ("summary", Schema::String),
        ("trace_lines", Schema::list(Schema::String)),
    ])
}

pub fn encode_control(message: &ControlMessage) -> Vec<u8> {
    let mut out = vec![message.kind() as u8];
    match message {
        ControlMessage::Stop => {}
        ControlMessage::Exception {
            summary,
            trace_lines,
        } => {
            let mut body = cdr::Encoder::new();
            body.str(summary);
            body.u64(trace_lines.len() as u64);
            for line in trace_lines {
                body.str(line);
            }
            let body = body.finish();
            out.put_u64(body.len() as u64);
            out.extend_from_slice(&body);
        }
        ControlMessage::Parcel(frame) => {
            out.extend_from_slice(&encode_frame(&frame.encoding, &frame.payload));
        }
    }
    out
}

fn control_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    let Some(&kind) = buf.first() else {
        return Ok(None);
    };
    match ControlKind::try_from(kind)? {
        ControlKind::Stop => Ok(Some(1)),
        ControlKind::Exception => {
            let Some(body_len) = read_u64(buf, 1) else {
                return Ok(None);
            };
            if body_len > MAX_EXCEPTION_BODY {
                return Err(FrameError::PayloadTooLarge(body_len));
            }
            Ok(Some(9 + body_len as usize))
        }
        ControlKind::Parcel => Ok(frame_len(&buf[1..])?.map(|n| n + 1)),
    }
}

pub fn has_full_control(buf: &[u8]) -> bool {
    match control_len(buf) {
        Ok(Some(total)) => buf.len() >= total,
        Ok(None) => false,
        Err(_) => true,
    }
}

/// Split exactly one control message off the front of `buf`.
pub fn decode_control(buf: &mut BytesMut) -> Result<Option<ControlMessage>, FrameError> {
    let total = match control_len(buf)? {
        Some(total) if buf.len() >= total => total,
        _ => return Ok(None),
    };
    let mut message = buf.split_to(total);
    let kind = ControlKind::try_from(message.get_u8())?;
    Ok(Some(match kind {
        ControlKind::Stop => ControlMessage::Stop,
        ControlKind::Exception => {
            message.advance(8);
            let value = cdr::decode(&exception_schema(), &message).map_err(FrameError::Exception)?;
            let mut f = value.into_fields("exception").map_err(FrameError::Exception)?;
            ControlMessage::Exception {
                summary: f.string("summary").map_err(FrameError::Exception)?,
                trace_lines: f.strings("trace_lines").map_err(FrameError::Exception)?,
            }
        }
        ControlKind::Parcel => match decode_frame(&mut message)? {
            Some(frame) => ControlMessage::Parcel(frame),
            None => return Err(FrameError::Truncated),
        },
    }))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("encoding name length {0} exceeds {MAX_ENCODING_NAME}")]
    EncodingNameTooLong(u64),

    #[error("payload length {0} exceeds bound")]
    PayloadTooLarge(u64),

    #[error("encoding name is not utf-8")]
    InvalidEncodingName,

    #[error("unknown control kind: 0x{0:02x}")]
    UnknownControl(u8),

    #[error("truncated message")]
    Truncated,

    #[error("malformed exception body: {0}")]
    Exception(DecodeError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
