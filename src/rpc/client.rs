//! Typed client proxy for a remote service.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{RpcKind, RpcSignature};
use crate::config::{defaults, ContinuousRequestConfig, MessageConfig, Priority, RequestConfig};
use crate::error::Result;
use crate::session::{ContinuousResponses, Session};

/// Proxy for calling one service registered on the peer.
///
/// Thin and stateless: it only formats signatures and delegates to the
/// session's send family, so clones are cheap and a client can outlive
/// reconnects of its session.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    session: Session,
    service: String,
    timeout: Duration,
    priority: Priority,
    notify_with_ack: bool,
}

impl ServiceClient {
    /// Client for the named remote service.
    pub fn new(session: &Session, service: impl Into<String>) -> Self {
        Self {
            session: session.clone(),
            service: service.into(),
            timeout: defaults::REQUEST_TIMEOUT,
            priority: Priority::Standard,
            notify_with_ack: true,
        }
    }

    /// Deadline applied to calls and acknowledged notifications.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Dispatch lane for this client's frames.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether notifications demand a delivery acknowledgment (on by
    /// default, so a missing service surfaces as a remote error).
    pub fn with_notification_ack(mut self, ack: bool) -> Self {
        self.notify_with_ack = ack;
        self
    }

    fn signature(&self, kind: RpcKind, member: &str) -> String {
        RpcSignature::new(kind, self.service.clone(), member).to_string()
    }

    fn request_config(&self) -> RequestConfig {
        RequestConfig::default()
            .with_timeout(self.timeout)
            .with_priority(self.priority)
    }

    /// Call a method and await its result.
    pub async fn call<Arg, Ret>(&self, method: &str, arg: &Arg) -> Result<Ret>
    where
        Arg: Serialize,
        Ret: DeserializeOwned,
    {
        let value = self
            .session
            .send_request_internal(
                serde_json::to_value(arg)?,
                Some(self.signature(RpcKind::Method, method)),
                self.request_config(),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a one-way notification to a method.
    pub async fn notify<Arg: Serialize>(&self, method: &str, arg: &Arg) -> Result<()> {
        let mut config = MessageConfig::default()
            .with_priority(self.priority)
            .with_timeout(self.timeout);
        if self.notify_with_ack {
            config = config.with_ack();
        }
        self.session
            .send_message_internal(
                serde_json::to_value(arg)?,
                Some(self.signature(RpcKind::Method, method)),
                config,
            )
            .await
    }

    /// Read a remote property.
    pub async fn get_property<Ret: DeserializeOwned>(&self, property: &str) -> Result<Ret> {
        let value = self
            .session
            .send_request_internal(
                Value::Null,
                Some(self.signature(RpcKind::Property, property)),
                self.request_config(),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Write a remote property; resolves when the peer confirms.
    pub async fn set_property<Arg: Serialize>(&self, property: &str, value: &Arg) -> Result<()> {
        self.session
            .send_request_internal(
                serde_json::to_value(value)?,
                Some(self.signature(RpcKind::Property, property)),
                self.request_config(),
            )
            .await?;
        Ok(())
    }

    /// Subscribe to a remote event. The stream stays open until the
    /// service is withdrawn, the subscription is cancelled, or the session
    /// ends; there is no first-response deadline because an event may
    /// legitimately take arbitrarily long to fire.
    pub async fn subscribe(&self, event: &str) -> Result<ContinuousResponses> {
        let config = ContinuousRequestConfig::default().without_timeout();
        self.session
            .send_continuous_internal(
                Value::Null,
                Some(self.signature(RpcKind::Event, event)),
                ContinuousRequestConfig {
                    priority: self.priority,
                    ..config
                },
            )
            .await
    }
}
