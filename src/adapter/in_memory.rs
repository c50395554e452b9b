//! In-process adapter pair.
//!
//! Two adapters joined back to back: whatever one side writes arrives as a
//! data event on the other. Used for loopback wiring and as the test
//! harness for full-session scenarios. An unannounced disconnect on one
//! side fails the other, matching how a torn-down socket behaves.

use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use super::{Adapter, AdapterEvent, ComponentState};
use crate::error::{CrosstalkError, Result};

/// Event channel capacity per side. A lagging subscriber loses frames,
/// which surfaces as a decode/timeout failure, same as any lossy channel.
const CHANNEL_CAPACITY: usize = 1024;

struct Shared {
    state: Mutex<ComponentState>,
    failure: Mutex<Option<String>>,
    events: broadcast::Sender<AdapterEvent>,
}

impl Shared {
    fn new() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(ComponentState::Disconnected),
            failure: Mutex::new(None),
            events,
        }
    }

    fn state(&self) -> ComponentState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_state(&self, new: ComponentState) {
        let old = {
            let mut guard = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::replace(&mut *guard, new)
        };
        if old != new {
            let _ = self.events.send(AdapterEvent::StateChanged(old, new));
        }
    }

    fn fail(&self, reason: String) {
        *self
            .failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(reason);
        self.set_state(ComponentState::Failed);
    }
}

/// One end of an in-process adapter pair.
pub struct InMemoryAdapter {
    local: Arc<Shared>,
    peer: OnceLock<Arc<Shared>>,
}

impl InMemoryAdapter {
    /// Create a connected-back-to-back pair.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let left_shared = Arc::new(Shared::new());
        let right_shared = Arc::new(Shared::new());

        let left = Arc::new(Self {
            local: Arc::clone(&left_shared),
            peer: OnceLock::new(),
        });
        let right = Arc::new(Self {
            local: right_shared,
            peer: OnceLock::new(),
        });
        let _ = left.peer.set(Arc::clone(&right.local));
        let _ = right.peer.set(left_shared);
        (left, right)
    }

    fn peer(&self) -> Result<&Arc<Shared>> {
        self.peer
            .get()
            .ok_or_else(|| CrosstalkError::Adapter("in-memory adapter has no peer".to_string()))
    }
}

#[async_trait]
impl Adapter for InMemoryAdapter {
    async fn connect(&self) -> Result<()> {
        match self.local.state() {
            ComponentState::Disposed => {
                Err(CrosstalkError::Adapter("adapter is disposed".to_string()))
            }
            ComponentState::Connected => Ok(()),
            _ => {
                *self
                    .local
                    .failure
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
                self.local.set_state(ComponentState::Connected);
                Ok(())
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        if self.local.state() != ComponentState::Connected {
            return Ok(());
        }
        self.local.set_state(ComponentState::Disconnected);

        // The peer sees the channel die, not a graceful goodbye; graceful
        // close is the session's job via its Disconnect frame.
        let peer = self.peer()?;
        if peer.state() == ComponentState::Connected {
            peer.fail("remote adapter disconnected".to_string());
        }
        Ok(())
    }

    async fn write(&self, data: Bytes) -> Result<()> {
        if self.local.state() != ComponentState::Connected {
            return Err(CrosstalkError::Adapter(format!(
                "cannot write while {}",
                self.local.state()
            )));
        }
        let peer = self.peer()?;
        if peer.state() != ComponentState::Connected {
            return Err(CrosstalkError::Adapter("peer adapter is not connected".to_string()));
        }
        // A send error only means no subscriber yet; the frame is lost the
        // same way a datagram to a silent peer is.
        let _ = peer.events.send(AdapterEvent::Data(data));
        Ok(())
    }

    fn state(&self) -> ComponentState {
        self.local.state()
    }

    fn failure(&self) -> Option<String> {
        self.local
            .failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.local.events.subscribe()
    }
}

impl std::fmt::Debug for InMemoryAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryAdapter")
            .field("state", &self.local.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_reaches_peer() {
        let (left, right) = InMemoryAdapter::pair();
        left.connect().await.unwrap();
        right.connect().await.unwrap();

        let mut events = right.events();
        left.write(Bytes::from_static(b"hello")).await.unwrap();

        match events.recv().await.unwrap() {
            AdapterEvent::Data(data) => assert_eq!(&data[..], b"hello"),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let (left, right) = InMemoryAdapter::pair();
        assert!(left.write(Bytes::from_static(b"x")).await.is_err());

        left.connect().await.unwrap();
        // Peer still down.
        assert!(left.write(Bytes::from_static(b"x")).await.is_err());

        right.connect().await.unwrap();
        assert!(left.write(Bytes::from_static(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_fails_peer() {
        let (left, right) = InMemoryAdapter::pair();
        left.connect().await.unwrap();
        right.connect().await.unwrap();

        let mut events = right.events();
        left.disconnect().await.unwrap();

        assert_eq!(left.state(), ComponentState::Disconnected);
        assert_eq!(right.state(), ComponentState::Failed);
        assert!(right.failure().is_some());
        match events.recv().await.unwrap() {
            AdapterEvent::StateChanged(ComponentState::Connected, ComponentState::Failed) => {}
            other => panic!("expected state change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_event() {
        let (left, right) = InMemoryAdapter::pair();
        left.connect().await.unwrap();
        right.connect().await.unwrap();

        let mut first = right.events();
        let mut second = right.events();
        left.write(Bytes::from_static(b"fanout")).await.unwrap();

        for events in [&mut first, &mut second] {
            match events.recv().await.unwrap() {
                AdapterEvent::Data(data) => assert_eq!(&data[..], b"fanout"),
                other => panic!("expected data, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let (left, right) = InMemoryAdapter::pair();
        left.connect().await.unwrap();
        right.connect().await.unwrap();
        left.disconnect().await.unwrap();

        left.connect().await.unwrap();
        right.connect().await.unwrap();
        assert_eq!(left.state(), ComponentState::Connected);
        assert_eq!(right.state(), ComponentState::Connected);
        assert!(left.write(Bytes::from_static(b"again")).await.is_ok());
    }
}
