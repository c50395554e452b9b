//! Transport adapter contract.
//!
//! An adapter turns some byte-stream transport into "one opaque frame per
//! event". The session never sees transport framing: length prefixes,
//! datagram boundaries, and reconnection mechanics are the adapter's
//! business. Events fan out over a broadcast channel so any number of
//! subscribers observe every frame and state change.

pub mod in_memory;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

pub use in_memory::InMemoryAdapter;

use crate::error::Result;

/// Lifecycle state shared by adapters (mirrors the session's own states).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComponentState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Connected and exchanging frames.
    Connected,
    /// Dead with a captured cause; see [`Adapter::failure`].
    Failed,
    /// Terminal.
    Disposed,
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Events an adapter broadcasts to its subscribers.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// One logical inbound frame.
    Data(Bytes),
    /// The adapter transitioned between states.
    StateChanged(ComponentState, ComponentState),
}

/// A connected byte-frame channel.
///
/// `connect`/`disconnect` are idempotent. `write` must only be called by
/// one writer at a time per the session's concurrency model (the push
/// worker, or the handshake path between application frames).
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Open the underlying channel.
    async fn connect(&self) -> Result<()>;

    /// Close the underlying channel. The adapter object stays reusable.
    async fn disconnect(&self) -> Result<()>;

    /// Write one logical frame.
    async fn write(&self, data: Bytes) -> Result<()>;

    /// Current lifecycle state.
    fn state(&self) -> ComponentState;

    /// Cause of the `Failed` state, when in it.
    fn failure(&self) -> Option<String>;

    /// Subscribe to data and state events. Every subscriber receives every
    /// event from the moment of subscription.
    fn events(&self) -> broadcast::Receiver<AdapterEvent>;
}
