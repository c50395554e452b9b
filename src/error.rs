//! Crosstalk error types.
//!
//! One enum covers the whole engine: validation before connect/send,
//! delivery failures (timeout, cancellation, remote error frames), codec
//! failures, and the non-recoverable causes that fail a session (adapter
//! death, keep-alive exhaustion, a peer disconnect notification).
//!
//! Local recoverable errors (a single handler failing, a decode failure
//! with a known token) are converted into error frames back to the sender
//! and never interrupt the worker loops; everything else converges on
//! `Session::fail`.

use thiserror::Error;

use crate::session::SessionState;

/// Crosstalk engine errors.
#[derive(Error, Debug)]
pub enum CrosstalkError {
    /// A required collaborator was not configured before use.
    #[error("Missing configuration: {0}")]
    ConfigurationMissing(&'static str),

    /// Operation requires a connected session.
    #[error("Session is not connected (state: {0})")]
    NotConnected(SessionState),

    /// The session is in the wrong state for the requested transition.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// An acknowledgment, response, or continuous frame did not arrive in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The peer returned an error frame.
    #[error("Remote error: {0}")]
    Remote(String),

    /// A frame could not be decoded.
    #[error("Decode error: {reason}")]
    Decode {
        /// Token recovered from the partial header, when the failure
        /// happened past the token field.
        token: Option<String>,
        /// What went wrong.
        reason: String,
    },

    /// The underlying adapter failed.
    #[error("Adapter failure: {0}")]
    Adapter(String),

    /// The encryption handshake could not be completed.
    #[error("Handshake failure: {0}")]
    Handshake(String),

    /// Keep-alive retries were exhausted with no response from the peer.
    #[error("Keep-alive retries exhausted")]
    KeepAliveExhausted,

    /// The remote side closed the connection.
    #[error("Connection closed by remote peer: {reason}", reason = .0.as_deref().unwrap_or("no reason given"))]
    ConnectionClosed(Option<String>),

    /// The session disconnected while the operation was pending.
    #[error("Session disconnected")]
    Disconnected,

    /// No service registered under the requested name.
    #[error("Service not registered: {0}")]
    ServiceNotFound(String),

    /// The service exists but has no such member.
    #[error("Unknown service member: {0}")]
    MemberNotFound(String),

    /// Cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for crosstalk operations
pub type Result<T> = std::result::Result<T, CrosstalkError>;

impl From<base64::DecodeError> for CrosstalkError {
    fn from(err: base64::DecodeError) -> Self {
        CrosstalkError::Crypto(format!("Base64 decode error: {err}"))
    }
}

impl CrosstalkError {
    /// Clone-ish helper for fan-out: pending entries are failed in batches
    /// with one cause, and error types carrying sources do not implement
    /// `Clone`.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::ConfigurationMissing(what) => Self::ConfigurationMissing(what),
            Self::NotConnected(state) => Self::NotConnected(*state),
            Self::InvalidState(what) => Self::InvalidState(what.clone()),
            Self::Timeout(what) => Self::Timeout(what.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::Remote(msg) => Self::Remote(msg.clone()),
            Self::Decode { token, reason } => Self::Decode {
                token: token.clone(),
                reason: reason.clone(),
            },
            Self::Adapter(msg) => Self::Adapter(msg.clone()),
            Self::Handshake(msg) => Self::Handshake(msg.clone()),
            Self::KeepAliveExhausted => Self::KeepAliveExhausted,
            Self::ConnectionClosed(reason) => Self::ConnectionClosed(reason.clone()),
            Self::Disconnected => Self::Disconnected,
            Self::ServiceNotFound(name) => Self::ServiceNotFound(name.clone()),
            Self::MemberNotFound(name) => Self::MemberNotFound(name.clone()),
            Self::Crypto(msg) => Self::Crypto(msg.clone()),
            Self::Json(err) => Self::Decode {
                token: None,
                reason: err.to_string(),
            },
            Self::Io(err) => Self::Adapter(err.to_string()),
        }
    }
}
