//! Send-family and session configuration.
//!
//! Every outbound operation carries a config describing its priority lane,
//! deadline, acknowledgment expectations, and optional cancellation token.
//! Defaults mirror the engine-wide settings in [`defaults`].

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Engine-wide default values.
pub mod defaults {
    use std::time::Duration;

    /// Default deadline for requests and acknowledged messages.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Grace period granted to an in-flight handshake during disconnect.
    pub const DISCONNECT_HANDSHAKE_GRACE: Duration = Duration::from_secs(5);

    /// Bound on how long the push worker waits for handshake completion
    /// before giving up on the first outgoing frame.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Outgoing dispatch priority lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Jumps ahead of standard traffic when its lane is ready.
    High,
    /// The lane used by all application traffic unless overridden.
    #[default]
    Standard,
    /// Background traffic (keep-alive probes use this lane).
    Low,
}

/// How much of an outbound/inbound frame is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    /// No per-frame logging.
    #[default]
    None,
    /// Log the frame type and token.
    Title,
    /// Log type, token, and the payload itself.
    TitleAndContent,
}

/// When the receiver acknowledges a sync message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckBehavior {
    /// Acknowledge on arrival, before handlers run.
    #[default]
    Default,
    /// Run handlers first; a failing handler is reported in the ACK and
    /// surfaces as a remote error at the sender.
    ReportErrors,
}

/// Configuration for a one-way message.
#[derive(Debug, Clone)]
pub struct MessageConfig {
    /// Dispatch lane.
    pub priority: Priority,
    /// Deadline for the acknowledgment when `require_ack` is set.
    pub timeout: Duration,
    /// Demand a delivery acknowledgment from the peer.
    pub require_ack: bool,
    /// Per-frame log verbosity.
    pub logging_mode: LoggingMode,
    /// Cooperative cancellation for the pending acknowledgment.
    pub cancellation: Option<CancellationToken>,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            priority: Priority::Standard,
            timeout: defaults::REQUEST_TIMEOUT,
            require_ack: false,
            logging_mode: LoggingMode::None,
            cancellation: None,
        }
    }
}

impl MessageConfig {
    /// Require an acknowledgment frame before the send resolves.
    pub fn with_ack(mut self) -> Self {
        self.require_ack = true;
        self
    }

    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the acknowledgment deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Configuration for a request expecting exactly one response.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Dispatch lane.
    pub priority: Priority,
    /// Deadline for the response.
    pub timeout: Duration,
    /// Per-frame log verbosity.
    pub logging_mode: LoggingMode,
    /// Cooperative cancellation for the pending response.
    pub cancellation: Option<CancellationToken>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            priority: Priority::Standard,
            timeout: defaults::REQUEST_TIMEOUT,
            logging_mode: LoggingMode::None,
            cancellation: None,
        }
    }
}

impl RequestConfig {
    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the response deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Configuration for a continuous request (open-ended response stream).
#[derive(Debug, Clone)]
pub struct ContinuousRequestConfig {
    /// Dispatch lane.
    pub priority: Priority,
    /// Deadline for the first response frame. `None` tolerates an
    /// arbitrarily late first response (event subscriptions use this).
    pub timeout: Option<Duration>,
    /// Inactivity window after the first response; if no further frame
    /// arrives within it the stream fails with a timeout. `None` keeps the
    /// stream open indefinitely.
    pub continuous_timeout: Option<Duration>,
    /// Per-frame log verbosity.
    pub logging_mode: LoggingMode,
    /// Cooperative cancellation for the open stream.
    pub cancellation: Option<CancellationToken>,
}

impl Default for ContinuousRequestConfig {
    fn default() -> Self {
        Self {
            priority: Priority::Standard,
            timeout: Some(defaults::REQUEST_TIMEOUT),
            continuous_timeout: None,
            logging_mode: LoggingMode::None,
            cancellation: None,
        }
    }
}

impl ContinuousRequestConfig {
    /// Set the first-response deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Drop the first-response deadline entirely.
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Set the inactivity window enforced after the first response.
    pub fn with_continuous_timeout(mut self, timeout: Duration) -> Self {
        self.continuous_timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Configuration for an outgoing response frame.
#[derive(Debug, Clone, Default)]
pub struct ResponseConfig {
    /// Dispatch lane.
    pub priority: Priority,
    /// Per-frame log verbosity.
    pub logging_mode: LoggingMode,
}

/// Keep-alive monitor configuration.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Run the monitor while connected.
    pub enabled: bool,
    /// Answer inbound keep-alive probes automatically.
    pub auto_respond: bool,
    /// Pause before the first probe after connecting.
    pub delay: Duration,
    /// Pause between probes.
    pub interval: Duration,
    /// Per-probe deadline; doubles as the rescue window for unrelated
    /// inbound traffic.
    pub timeout: Duration,
    /// Consecutive unanswered probes tolerated before escalation.
    pub retries: u32,
    /// Fail the whole session when retries are exhausted.
    pub fail_session_on_timeout: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_respond: true,
            delay: Duration::from_secs(2),
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(2),
            retries: 4,
            fail_session_on_timeout: true,
        }
    }
}

/// Channel encryption configuration.
#[derive(Debug, Clone, Default)]
pub struct CryptoConfig {
    /// Negotiate a symmetric key during connect and encrypt payloads.
    pub enabled: bool,
}

impl CryptoConfig {
    /// Enable channel encryption.
    pub fn enabled() -> Self {
        Self { enabled: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_config_defaults() {
        let config = MessageConfig::default();
        assert!(!config.require_ack);
        assert_eq!(config.priority, Priority::Standard);
        assert_eq!(config.timeout, defaults::REQUEST_TIMEOUT);
    }

    #[test]
    fn test_message_config_builders() {
        let config = MessageConfig::default()
            .with_ack()
            .with_priority(Priority::High)
            .with_timeout(Duration::from_millis(250));
        assert!(config.require_ack);
        assert_eq!(config.priority, Priority::High);
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_keep_alive_defaults() {
        let config = KeepAliveConfig::default();
        assert!(!config.enabled);
        assert!(config.auto_respond);
        assert_eq!(config.retries, 4);
        assert!(config.fail_session_on_timeout);
    }
}
