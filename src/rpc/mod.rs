//! Service call layer.
//!
//! Services are registered explicitly through a [`ServiceDescriptor`]: each
//! callable member is named and wired by hand, so dispatch is a plain map
//! lookup with no runtime type discovery. Calls travel as ordinary frames
//! carrying an [`RpcSignature`] in the header; the peer resolves the
//! signature against its registered services and answers with a response,
//! an error response, or (for event subscriptions) an open response stream.

pub mod client;
pub mod service;

use std::fmt;
use std::str::FromStr;

pub use client::ServiceClient;
pub use service::{EventEmitter, RegisteredService, ServiceDescriptor};

use serde_json::Value;

use crate::codec::{FrameType, IncomingFrame};
use crate::config::ResponseConfig;
use crate::error::{CrosstalkError, Result};
use crate::session::Session;

/// How a service is instantiated for incoming calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreationPolicy {
    /// One instance, created lazily on the first call and reused.
    #[default]
    Singleton,
    /// A fresh instance per call.
    Transient,
}

/// Which facet of a service a signature addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcKind {
    /// A callable method (request/response) or notification (message).
    Method,
    /// A readable/writable property.
    Property,
    /// A subscribable event stream.
    Event,
}

impl fmt::Display for RpcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Method => "Method",
            Self::Property => "Property",
            Self::Event => "Event",
        };
        f.write_str(name)
    }
}

impl FromStr for RpcKind {
    type Err = CrosstalkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Method" => Ok(Self::Method),
            "Property" => Ok(Self::Property),
            "Event" => Ok(Self::Event),
            other => Err(CrosstalkError::Decode {
                token: None,
                reason: format!("unknown rpc kind {other:?}"),
            }),
        }
    }
}

/// Wire form of a service member address: `Kind:Service.Member`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcSignature {
    /// Member facet.
    pub kind: RpcKind,
    /// Registered service name.
    pub service: String,
    /// Member name within the service.
    pub member: String,
}

impl RpcSignature {
    /// Address a member of a service.
    pub fn new(kind: RpcKind, service: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            kind,
            service: service.into(),
            member: member.into(),
        }
    }
}

impl fmt::Display for RpcSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.kind, self.service, self.member)
    }
}

impl FromStr for RpcSignature {
    type Err = CrosstalkError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || CrosstalkError::Decode {
            token: None,
            reason: format!("malformed rpc signature {s:?}"),
        };
        let (kind, rest) = s.split_once(':').ok_or_else(malformed)?;
        // The member is the last dot-separated segment; service names may
        // themselves contain dots.
        let (service, member) = rest.rsplit_once('.').ok_or_else(malformed)?;
        if service.is_empty() || member.is_empty() {
            return Err(malformed());
        }
        Ok(Self {
            kind: kind.parse()?,
            service: service.to_string(),
            member: member.to_string(),
        })
    }
}

/// Route an inbound request frame carrying a signature. Every failure is
/// answered with an error response so the caller fails fast instead of
/// timing out.
pub(crate) async fn dispatch_request(session: &Session, raw_signature: &str, frame: IncomingFrame) {
    let token = frame.token.clone();
    let signature = match raw_signature.parse::<RpcSignature>() {
        Ok(signature) => signature,
        Err(err) => {
            tracing::warn!(signature = raw_signature, error = %err, "Rejecting rpc request");
            let _ = session.send_error_response(&token, err.to_string(), ResponseConfig::default());
            return;
        }
    };
    let Some(service) = session.service(&signature.service) else {
        let err = CrosstalkError::ServiceNotFound(signature.service);
        let _ = session.send_error_response(&token, err.to_string(), ResponseConfig::default());
        return;
    };

    if frame.frame_type == FrameType::ContinuousRequest {
        service::spawn_event_forwarder(session, &service, &signature, token);
        return;
    }

    match service.invoke(&signature, frame.payload).await {
        Ok(value) => {
            if let Err(err) =
                session.send_response_value(&token, value, true, ResponseConfig::default())
            {
                tracing::warn!(token, error = %err, "Failed to queue rpc response");
            }
        }
        Err(err) => {
            let _ = session.send_error_response(&token, err.to_string(), ResponseConfig::default());
        }
    }
}

/// Route an inbound message frame carrying a signature. The returned error
/// feeds the acknowledgment when the session reports handler errors.
pub(crate) async fn dispatch_notification(
    session: &Session,
    raw_signature: &str,
    payload: Value,
) -> Result<()> {
    let signature: RpcSignature = raw_signature.parse()?;
    let service = session
        .service(&signature.service)
        .ok_or_else(|| CrosstalkError::ServiceNotFound(signature.service.clone()))?;
    service.notify(&signature, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_display() {
        let signature = RpcSignature::new(RpcKind::Method, "Calculator", "Add");
        assert_eq!(signature.to_string(), "Method:Calculator.Add");
    }

    #[test]
    fn test_signature_roundtrip() {
        for raw in [
            "Method:Calculator.Add",
            "Property:Thermostat.Target",
            "Event:Feed.Updated",
        ] {
            let parsed: RpcSignature = raw.parse().unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
    }

    #[test]
    fn test_dotted_service_names() {
        let parsed: RpcSignature = "Method:acme.billing.Invoices.Create".parse().unwrap();
        assert_eq!(parsed.service, "acme.billing.Invoices");
        assert_eq!(parsed.member, "Create");
    }

    #[test]
    fn test_malformed_signatures_rejected() {
        for raw in ["", "Method:", "NoKind.Member", "Method:NoMember", "Bogus:A.B"] {
            assert!(raw.parse::<RpcSignature>().is_err(), "accepted {raw:?}");
        }
    }
}
