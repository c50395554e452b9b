//! Envelope model and the frame codec pipeline.
//!
//! A frame on the wire is a versioned binary header ([`header`]) followed
//! by an opaque payload produced by a [`PayloadCodec`]. On the way out the
//! payload is encrypted (once the handshake has enabled [`ChannelSecurity`])
//! and then compressed; the inbound pipeline reverses both before handing
//! the payload to the codec named in the header. Codecs are resolved
//! through an explicit [`CodecRegistry`] owned by the session, never
//! through process-wide state.

pub mod compress;
pub mod header;
pub mod json;
pub mod secure;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

pub use compress::{Compressor, GzipCompressor};
pub use header::{FrameHeader, FrameType, HANDSHAKE_MARKER, HEADER_VERSION};
pub use json::JsonCodec;
pub use secure::ChannelSecurity;

use crate::error::{CrosstalkError, Result};

/// Serializes and deserializes the opaque payload portion of a frame.
pub trait PayloadCodec: Send + Sync {
    /// Transcoding name carried in the header.
    fn name(&self) -> &'static str;
    /// Serialize a payload value.
    fn to_bytes(&self, payload: &Value) -> Result<Vec<u8>>;
    /// Deserialize a payload value.
    fn from_bytes(&self, data: &[u8]) -> Result<Value>;
}

/// Payload codecs keyed by transcoding name.
///
/// Constructed once and injected into each session; inbound frames are
/// decoded with whatever codec their header names, so a session can accept
/// transcodings it does not itself send.
pub struct CodecRegistry {
    codecs: HashMap<&'static str, Arc<dyn PayloadCodec>>,
}

impl CodecRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry with the built-in JSON codec.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonCodec));
        registry
    }

    /// Register a codec under its transcoding name, replacing any previous
    /// codec with the same name.
    pub fn register(&mut self, codec: Arc<dyn PayloadCodec>) {
        self.codecs.insert(codec.name(), codec);
    }

    /// Look up a codec by transcoding name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn PayloadCodec>> {
        self.codecs.get(name).cloned()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.codecs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// An envelope about to be encoded and written.
#[derive(Debug, Clone)]
pub struct OutgoingFrame {
    /// Correlation token.
    pub token: String,
    /// Frame classification.
    pub frame_type: FrameType,
    /// Terminal-frame flag (continuous streams end on `completed = true`).
    pub completed: bool,
    /// Error flag.
    pub has_error: bool,
    /// Error text carried with the error flag (or a Disconnect reason).
    pub error_message: Option<String>,
    /// RPC member signature, when the frame belongs to a service call.
    pub rpc_signature: Option<String>,
    /// Advisory timeout in whole seconds (0 = unspecified).
    pub timeout_secs: u8,
    /// Opaque payload.
    pub payload: Value,
}

impl OutgoingFrame {
    fn bare(token: String, frame_type: FrameType, payload: Value) -> Self {
        Self {
            token,
            frame_type,
            completed: false,
            has_error: false,
            error_message: None,
            rpc_signature: None,
            timeout_secs: 0,
            payload,
        }
    }

    /// A request expecting exactly one response.
    pub fn request(token: String, payload: Value) -> Self {
        Self::bare(token, FrameType::Request, payload)
    }

    /// A request expecting an open-ended response stream.
    pub fn continuous_request(token: String, payload: Value) -> Self {
        Self::bare(token, FrameType::ContinuousRequest, payload)
    }

    /// A one-way message; `require_ack` upgrades it to MessageSync.
    pub fn message(token: String, payload: Value, require_ack: bool) -> Self {
        let frame_type = if require_ack {
            FrameType::MessageSync
        } else {
            FrameType::Message
        };
        Self::bare(token, frame_type, payload)
    }

    /// A response to a request or continuous request.
    pub fn response(token: String, payload: Value, completed: bool) -> Self {
        Self {
            completed,
            ..Self::bare(token, FrameType::Response, payload)
        }
    }

    /// An error response; always terminal.
    pub fn error_response(token: String, message: String) -> Self {
        Self {
            completed: true,
            has_error: true,
            error_message: Some(message),
            ..Self::bare(token, FrameType::Response, Value::Null)
        }
    }

    /// Acknowledgment of a MessageSync, optionally carrying a handler error.
    pub fn ack(token: String, error: Option<String>) -> Self {
        Self {
            completed: true,
            has_error: error.is_some(),
            error_message: error,
            ..Self::bare(token, FrameType::MessageSyncAck, Value::Null)
        }
    }

    /// A keep-alive probe.
    pub fn keep_alive_request(token: String) -> Self {
        Self::bare(token, FrameType::KeepAliveRequest, Value::Null)
    }

    /// A keep-alive answer.
    pub fn keep_alive_response(token: String) -> Self {
        Self::bare(token, FrameType::KeepAliveResponse, Value::Null)
    }

    /// A graceful-close notification.
    pub fn disconnect(token: String, reason: Option<String>) -> Self {
        Self {
            error_message: reason,
            ..Self::bare(token, FrameType::Disconnect, Value::Null)
        }
    }

    /// Attach an RPC member signature.
    pub fn with_rpc_signature(mut self, signature: String) -> Self {
        self.rpc_signature = Some(signature);
        self
    }
}

/// A decoded inbound envelope.
#[derive(Debug, Clone)]
pub struct IncomingFrame {
    /// Correlation token.
    pub token: String,
    /// Frame classification.
    pub frame_type: FrameType,
    /// Terminal-frame flag.
    pub completed: bool,
    /// Error flag.
    pub has_error: bool,
    /// Error text.
    pub error_message: Option<String>,
    /// Transcoding name the peer encoded with.
    pub transcoding: String,
    /// RPC member signature.
    pub rpc_signature: Option<String>,
    /// Advisory timeout in whole seconds.
    pub timeout_secs: u8,
    /// Opaque payload.
    pub payload: Value,
}

/// The full encode/decode pipeline for one session.
pub struct FrameCodec {
    payload_codec: Arc<dyn PayloadCodec>,
    registry: Arc<CodecRegistry>,
    compressor: Arc<dyn Compressor>,
    compress_outgoing: bool,
    security: Arc<ChannelSecurity>,
}

impl FrameCodec {
    /// Pipeline with the registry's JSON codec and compression disabled for
    /// outbound frames (inbound compressed frames are always accepted).
    pub fn new(registry: Arc<CodecRegistry>, security: Arc<ChannelSecurity>) -> Result<Self> {
        let payload_codec = registry
            .get("json")
            .ok_or(CrosstalkError::ConfigurationMissing("json payload codec"))?;
        Ok(Self {
            payload_codec,
            registry,
            compressor: Arc::new(GzipCompressor),
            compress_outgoing: false,
            security,
        })
    }

    /// Use a different payload codec for outbound frames.
    pub fn with_payload_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.payload_codec = codec;
        self
    }

    /// Compress outbound payloads.
    pub fn with_compression(mut self) -> Self {
        self.compress_outgoing = true;
        self
    }

    /// Shared channel encryption state.
    pub fn security(&self) -> &Arc<ChannelSecurity> {
        &self.security
    }

    /// Encode a frame: header, then encrypt-then-compress payload.
    pub fn encode(&self, frame: &OutgoingFrame) -> Result<Vec<u8>> {
        let has_payload = frame.frame_type.has_payload();
        let compressed = self.compress_outgoing && has_payload;

        let mut buf = Vec::with_capacity(64);
        header::encode(
            &header::HeaderFields {
                transcoding: self.payload_codec.name(),
                compressed,
                token: &frame.token,
                frame_type: frame.frame_type,
                rpc_signature: frame.rpc_signature.as_deref(),
                timeout_secs: frame.timeout_secs,
                completed: frame.completed,
                has_error: frame.has_error,
                error_message: frame.error_message.as_deref(),
            },
            &mut buf,
        )?;

        if has_payload {
            let raw = self.payload_codec.to_bytes(&frame.payload)?;
            let sealed = self.security.encrypt(&raw)?;
            let body = if compressed {
                self.compressor.compress(&sealed)?
            } else {
                sealed
            };
            buf.extend_from_slice(&body);
        }
        Ok(buf)
    }

    /// Decode a frame: header, then decompress-then-decrypt payload.
    ///
    /// Once the header's token is known, every later failure is reported
    /// with it so the caller can fail the matching pending entry.
    pub fn decode(&self, data: &[u8]) -> Result<IncomingFrame> {
        let head = header::decode(data)?;
        let token = head.token.clone();

        let payload = if head.frame_type.has_payload() && head.payload_offset < data.len() {
            let body = &data[head.payload_offset..];
            let sealed = if head.compressed {
                self.compressor
                    .decompress(body)
                    .map_err(|err| attach_token(err, &token))?
            } else {
                body.to_vec()
            };
            let raw = self
                .security
                .decrypt(&sealed)
                .map_err(|err| attach_token(err, &token))?;
            let codec = self.registry.get(&head.transcoding).ok_or_else(|| {
                CrosstalkError::Decode {
                    token: Some(token.clone()),
                    reason: format!("no codec registered for transcoding {:?}", head.transcoding),
                }
            })?;
            codec
                .from_bytes(&raw)
                .map_err(|err| attach_token(err, &token))?
        } else {
            Value::Null
        };

        Ok(IncomingFrame {
            token: head.token,
            frame_type: head.frame_type,
            completed: head.completed,
            has_error: head.has_error,
            error_message: head.error_message,
            transcoding: head.transcoding,
            rpc_signature: head.rpc_signature,
            timeout_secs: head.timeout_secs,
            payload,
        })
    }
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("payload_codec", &self.payload_codec.name())
            .field("compress_outgoing", &self.compress_outgoing)
            .field("security", &self.security)
            .finish()
    }
}

fn attach_token(err: CrosstalkError, token: &str) -> CrosstalkError {
    match err {
        CrosstalkError::Decode { reason, .. } => CrosstalkError::Decode {
            token: Some(token.to_string()),
            reason,
        },
        other => CrosstalkError::Decode {
            token: Some(token.to_string()),
            reason: other.to_string(),
        },
    }
}
