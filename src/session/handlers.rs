//! Typed message and request handlers.
//!
//! Dispatch is by an explicit wire name: payloads implement [`Payload`]
//! with a stable `TYPE_NAME`, and the session wraps them on the wire as
//! `{"@type": <name>, "body": <payload>}`. Handlers are stored type-erased
//! behind async callbacks taking the raw body; the typed registration
//! functions on the session do the (de)serialization at the edge.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// A message or request body with a stable wire name.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    /// Name carried in the `@type` field; must match on both peers.
    const TYPE_NAME: &'static str;
}

/// Handle for deregistering a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

/// Which frames a handler matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerKind {
    /// Message and MessageSync frames; never produces a response.
    Message,
    /// Request frames; observes without responding.
    RequestObserver,
    /// Request frames; its result is sent back as the Response.
    RequestResponder,
    /// ContinuousRequest frames; streams responses itself using the token.
    ContinuousResponder,
}

/// Erased handler callback: receives the frame token and the unwrapped
/// body, returns an optional response payload (responders only).
pub(crate) type HandlerCallback =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync>;

pub(crate) struct HandlerEntry {
    pub(crate) id: HandlerId,
    pub(crate) type_name: &'static str,
    pub(crate) kind: HandlerKind,
    pub(crate) callback: HandlerCallback,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Wrap a typed payload for the wire.
pub(crate) fn wrap_payload<P: Payload>(payload: &P) -> Result<Value> {
    Ok(serde_json::json!({
        "@type": P::TYPE_NAME,
        "body": serde_json::to_value(payload)?,
    }))
}

/// Split a wire payload into its type name and body. Unwrapped payloads
/// (RPC argument frames, foreign senders) come back with no type name.
pub(crate) fn unwrap_payload(payload: Value) -> (Option<String>, Value) {
    match payload {
        Value::Object(mut map) if map.contains_key("@type") && map.contains_key("body") => {
            let type_name = map
                .remove("@type")
                .and_then(|value| value.as_str().map(str::to_string));
            let body = map.remove("body").unwrap_or(Value::Null);
            (type_name, body)
        }
        other => (None, other),
    }
}
