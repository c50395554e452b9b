//! Versioned binary frame header.
//!
//! Layout, in order: version byte (non-zero; a leading zero byte marks an
//! in-band handshake frame instead), transcoding name (short ASCII), the
//! compressed flag, token (short ASCII), frame-type byte, RPC signature
//! (short ASCII, empty when absent), advisory timeout in whole seconds,
//! then the type-dependent tail: Response and MessageSyncAck carry
//! completed/error flags plus an error message, and Disconnect carries an
//! error message. A little-endian u32 payload offset, counted from the
//! start of the frame, closes the header. New fields are append-only
//! behind version checks so old decoders keep working.

use bytes::{Buf, BufMut};

use crate::error::{CrosstalkError, Result};

/// Current header version. Must never be zero.
pub const HEADER_VERSION: u8 = 1;

/// Reserved first byte distinguishing handshake frames from protocol frames.
pub const HANDSHAKE_MARKER: u8 = 0;

/// Wire-level frame classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Expects exactly one `Response`.
    Request = 0,
    /// Answers a `Request` or a `ContinuousRequest` frame.
    Response = 1,
    /// Expects an open-ended sequence of `Response` frames.
    ContinuousRequest = 2,
    /// One-way message, no acknowledgment.
    Message = 3,
    /// One-way message demanding a `MessageSyncAck`.
    MessageSync = 4,
    /// Acknowledgment of a `MessageSync`.
    MessageSyncAck = 5,
    /// Liveness probe.
    KeepAliveRequest = 6,
    /// Liveness probe answer.
    KeepAliveResponse = 7,
    /// Graceful-close notification.
    Disconnect = 8,
}

impl FrameType {
    /// Wire byte for this frame type.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parse a wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::ContinuousRequest),
            3 => Some(Self::Message),
            4 => Some(Self::MessageSync),
            5 => Some(Self::MessageSyncAck),
            6 => Some(Self::KeepAliveRequest),
            7 => Some(Self::KeepAliveResponse),
            8 => Some(Self::Disconnect),
            _ => None,
        }
    }

    /// True for the tail variant carrying completed/error flags.
    pub fn carries_completion(self) -> bool {
        matches!(self, Self::Response | Self::MessageSyncAck)
    }

    /// Keep-alive frames never carry a payload.
    pub fn has_payload(self) -> bool {
        !matches!(self, Self::KeepAliveRequest | Self::KeepAliveResponse)
    }
}

/// Decoded header fields, produced before the payload is touched.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Header version the peer encoded with.
    pub version: u8,
    /// Payload codec name.
    pub transcoding: String,
    /// Payload was compressed after (optional) encryption.
    pub compressed: bool,
    /// Correlation token.
    pub token: String,
    /// Frame classification.
    pub frame_type: FrameType,
    /// RPC member signature, when the frame belongs to a service call.
    pub rpc_signature: Option<String>,
    /// Advisory timeout in whole seconds (0 = unspecified).
    pub timeout_secs: u8,
    /// Terminal-frame flag (Response/MessageSyncAck tail).
    pub completed: bool,
    /// Error flag (Response/MessageSyncAck tail).
    pub has_error: bool,
    /// Error text (Response/MessageSyncAck/Disconnect tail).
    pub error_message: Option<String>,
    /// Offset of the payload from the start of the frame.
    pub payload_offset: usize,
}

/// Fields needed to encode a header; the caller owns the payload pipeline.
#[derive(Debug, Clone)]
pub struct HeaderFields<'a> {
    /// Payload codec name.
    pub transcoding: &'a str,
    /// Payload will be compressed.
    pub compressed: bool,
    /// Correlation token.
    pub token: &'a str,
    /// Frame classification.
    pub frame_type: FrameType,
    /// RPC member signature.
    pub rpc_signature: Option<&'a str>,
    /// Advisory timeout in whole seconds.
    pub timeout_secs: u8,
    /// Terminal-frame flag.
    pub completed: bool,
    /// Error flag.
    pub has_error: bool,
    /// Error text.
    pub error_message: Option<&'a str>,
}

/// Encode a header into `buf`, patching in the payload offset.
pub fn encode(fields: &HeaderFields<'_>, buf: &mut Vec<u8>) -> Result<()> {
    buf.put_u8(HEADER_VERSION);
    put_short_str(buf, fields.transcoding)?;
    buf.put_u8(u8::from(fields.compressed));
    put_short_str(buf, fields.token)?;
    buf.put_u8(fields.frame_type.as_byte());
    put_short_str(buf, fields.rpc_signature.unwrap_or(""))?;
    buf.put_u8(fields.timeout_secs);

    if fields.frame_type.carries_completion() {
        buf.put_u8(u8::from(fields.completed));
        buf.put_u8(u8::from(fields.has_error));
        put_str16(buf, fields.error_message.unwrap_or(""))?;
    } else if fields.frame_type == FrameType::Disconnect {
        put_str16(buf, fields.error_message.unwrap_or(""))?;
    }

    // Payload starts right after the offset marker itself.
    let offset = buf.len() + 4;
    buf.put_u32_le(offset as u32);
    Ok(())
}

/// Decode a header from the front of `data`.
///
/// Failures past the token field carry the token so the pending entry can
/// still be failed with the decode cause.
pub fn decode(data: &[u8]) -> Result<FrameHeader> {
    let mut buf = data;
    let version = take_u8(&mut buf, None, "version")?;
    if version == HANDSHAKE_MARKER {
        return Err(decode_err(None, "handshake frame routed to header decoder"));
    }
    if version > HEADER_VERSION {
        return Err(decode_err(
            None,
            format!("unsupported header version {version}"),
        ));
    }

    let transcoding = take_short_str(&mut buf, None, "transcoding name")?;
    let compressed = take_u8(&mut buf, None, "compressed flag")? != 0;
    let token = take_short_str(&mut buf, None, "token")?;
    let recovered = || Some(token.clone());

    let type_byte = take_u8(&mut buf, recovered(), "frame type")?;
    let frame_type = FrameType::from_byte(type_byte)
        .ok_or_else(|| decode_err(recovered(), format!("unknown frame type {type_byte}")))?;
    let rpc_signature = {
        let raw = take_short_str(&mut buf, recovered(), "rpc signature")?;
        if raw.is_empty() { None } else { Some(raw) }
    };
    let timeout_secs = take_u8(&mut buf, recovered(), "timeout")?;

    let mut completed = false;
    let mut has_error = false;
    let mut error_message = None;
    if frame_type.carries_completion() {
        completed = take_u8(&mut buf, recovered(), "completed flag")? != 0;
        has_error = take_u8(&mut buf, recovered(), "error flag")? != 0;
        let text = take_str16(&mut buf, recovered(), "error message")?;
        if !text.is_empty() {
            error_message = Some(text);
        }
    } else if frame_type == FrameType::Disconnect {
        let text = take_str16(&mut buf, recovered(), "error message")?;
        if !text.is_empty() {
            error_message = Some(text);
        }
    }

    if buf.remaining() < 4 {
        return Err(decode_err(recovered(), "truncated payload offset"));
    }
    let payload_offset = buf.get_u32_le() as usize;
    if payload_offset > data.len() {
        return Err(decode_err(
            recovered(),
            format!("payload offset {payload_offset} beyond frame length {}", data.len()),
        ));
    }

    Ok(FrameHeader {
        version,
        transcoding,
        compressed,
        token,
        frame_type,
        rpc_signature,
        timeout_secs,
        completed,
        has_error,
        error_message,
        payload_offset,
    })
}

fn decode_err(token: Option<String>, reason: impl Into<String>) -> CrosstalkError {
    CrosstalkError::Decode {
        token,
        reason: reason.into(),
    }
}

fn put_short_str(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    if !value.is_ascii() {
        return Err(decode_err(None, format!("non-ASCII short string: {value:?}")));
    }
    if value.len() > u8::MAX as usize {
        return Err(decode_err(None, format!("short string too long: {} bytes", value.len())));
    }
    buf.put_u8(value.len() as u8);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn put_str16(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    if value.len() > u16::MAX as usize {
        return Err(decode_err(None, format!("string too long: {} bytes", value.len())));
    }
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn take_u8(buf: &mut &[u8], token: Option<String>, what: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(decode_err(token, format!("truncated header at {what}")));
    }
    Ok(buf.get_u8())
}

fn take_short_str(buf: &mut &[u8], token: Option<String>, what: &str) -> Result<String> {
    let len = take_u8(buf, token.clone(), what)? as usize;
    if buf.remaining() < len {
        return Err(decode_err(token, format!("truncated header at {what}")));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| decode_err(None, format!("invalid UTF-8 in {what}")))
}

pub(crate) fn take_str16(buf: &mut &[u8], token: Option<String>, what: &str) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(decode_err(token, format!("truncated header at {what}")));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(decode_err(token, format!("truncated header at {what}")));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| decode_err(token, format!("invalid UTF-8 in {what}")))
}
