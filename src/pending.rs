//! Pending correlation table.
//!
//! Every outbound unit that expects something back lives here, keyed by
//! its token, until a matching acknowledgment/response arrives, its
//! timeout or cancellation monitor fires, or the session fails and aborts
//! the whole table. Removal is once-only: resolution happens by taking the
//! entry out of the map, so a late duplicate (a response racing a timeout)
//! finds nothing and is dropped.
//!
//! Continuous entries stay in the table across response frames; they leave
//! on a `completed` frame, an error frame, inactivity, or abort.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{CrosstalkError, Result};

enum Entry {
    Message {
        tx: oneshot::Sender<Result<()>>,
    },
    Request {
        tx: oneshot::Sender<Result<Value>>,
    },
    Continuous {
        tx: mpsc::UnboundedSender<Result<Value>>,
        first_response_seen: bool,
        last_response: Instant,
    },
}

/// Snapshot of a continuous entry's liveness, for the inactivity monitor.
#[derive(Debug, Clone, Copy)]
pub struct ContinuousStatus {
    /// At least one response frame has arrived.
    pub first_response_seen: bool,
    /// Arrival time of the most recent response frame (registration time
    /// before the first one).
    pub last_response: Instant,
}

/// Concurrent token-keyed table of in-flight outbound units.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, Entry>>,
}

impl PendingTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Track an acknowledged message. The receiver resolves on ACK,
    /// timeout, cancellation, or abort.
    pub fn register_message(&self, token: &str) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(token.to_string(), Entry::Message { tx });
        rx
    }

    /// Track a request. The receiver resolves with the response payload.
    pub fn register_request(&self, token: &str) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(token.to_string(), Entry::Request { tx });
        rx
    }

    /// Track a continuous request. The receiver yields every response
    /// frame's payload and closes after a terminal frame or failure.
    pub fn register_continuous(&self, token: &str) -> mpsc::UnboundedReceiver<Result<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(
            token.to_string(),
            Entry::Continuous {
                tx,
                first_response_seen: false,
                last_response: Instant::now(),
            },
        );
        rx
    }

    /// Resolve an acknowledged message from a MessageSyncAck frame.
    /// Returns false when no entry matches (late or unknown token).
    pub fn resolve_ack(&self, token: &str, error: Option<String>) -> bool {
        let removed = { self.lock().remove(token) };
        match removed {
            Some(Entry::Message { tx }) => {
                let outcome = match error {
                    Some(message) => Err(CrosstalkError::Remote(message)),
                    None => Ok(()),
                };
                let _ = tx.send(outcome);
                true
            }
            Some(other) => {
                // Wrong-kind ACK; put it back untouched.
                self.lock().insert(token.to_string(), other);
                false
            }
            None => false,
        }
    }

    /// Resolve a request-shaped entry (plain request or keep-alive probe).
    pub fn resolve_request(&self, token: &str, outcome: Result<Value>) -> bool {
        let removed = { self.lock().remove(token) };
        match removed {
            Some(Entry::Request { tx }) => {
                let _ = tx.send(outcome);
                true
            }
            Some(other) => {
                self.lock().insert(token.to_string(), other);
                false
            }
            None => false,
        }
    }

    /// Route a Response frame to its entry: one-shot resolution for plain
    /// requests; emit/advance/terminate for continuous entries.
    pub fn resolve_response(
        &self,
        token: &str,
        payload: Value,
        completed: bool,
        error: Option<String>,
    ) -> bool {
        let mut entries = self.lock();
        match entries.remove(token) {
            Some(Entry::Request { tx }) => {
                drop(entries);
                let outcome = match error {
                    Some(message) => Err(CrosstalkError::Remote(message)),
                    None => Ok(payload),
                };
                let _ = tx.send(outcome);
                true
            }
            Some(Entry::Continuous {
                tx,
                first_response_seen: _,
                last_response: _,
            }) => {
                if let Some(message) = error {
                    drop(entries);
                    let _ = tx.send(Err(CrosstalkError::Remote(message)));
                    // Entry stays removed; the stream closes when tx drops.
                    return true;
                }
                let _ = tx.send(Ok(payload));
                if !completed {
                    // Still live: reinsert with refreshed liveness.
                    entries.insert(
                        token.to_string(),
                        Entry::Continuous {
                            tx,
                            first_response_seen: true,
                            last_response: Instant::now(),
                        },
                    );
                }
                true
            }
            Some(other) => {
                entries.insert(token.to_string(), other);
                false
            }
            None => false,
        }
    }

    /// Fail one entry with `cause`. Returns false when already resolved.
    pub fn fail(&self, token: &str, cause: CrosstalkError) -> bool {
        let removed = { self.lock().remove(token) };
        match removed {
            Some(entry) => {
                fail_entry(entry, cause);
                true
            }
            None => false,
        }
    }

    /// Fail every live entry with (duplicates of) one cause. Used on
    /// session failure and disconnect.
    pub fn fail_all(&self, cause: &CrosstalkError) -> usize {
        let drained: Vec<Entry> = {
            let mut entries = self.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            fail_entry(entry, cause.duplicate());
        }
        count
    }

    /// Liveness snapshot of a continuous entry.
    pub fn continuous_status(&self, token: &str) -> Option<ContinuousStatus> {
        match self.lock().get(token) {
            Some(Entry::Continuous {
                first_response_seen,
                last_response,
                ..
            }) => Some(ContinuousStatus {
                first_response_seen: *first_response_seen,
                last_response: *last_response,
            }),
            _ => None,
        }
    }

    /// True while the token is still tracked.
    pub fn contains(&self, token: &str) -> bool {
        self.lock().contains_key(token)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn fail_entry(entry: Entry, cause: CrosstalkError) {
    match entry {
        Entry::Message { tx } => {
            let _ = tx.send(Err(cause));
        }
        Entry::Request { tx } => {
            let _ = tx.send(Err(cause));
        }
        Entry::Continuous { tx, .. } => {
            let _ = tx.send(Err(cause));
        }
    }
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_request_resolution() {
        let table = PendingTable::new();
        let rx = table.register_request("r1");

        assert!(table.resolve_response("r1", json!({"sum": 42}), true, None));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"sum": 42}));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_double_resolution_is_noop() {
        let table = PendingTable::new();
        let _rx = table.register_request("r1");

        assert!(table.resolve_response("r1", json!(1), true, None));
        assert!(!table.resolve_response("r1", json!(2), true, None));
    }

    #[tokio::test]
    async fn test_error_frame_becomes_remote_error() {
        let table = PendingTable::new();
        let rx = table.register_request("r1");

        table.resolve_response("r1", Value::Null, true, Some("boom".to_string()));
        match rx.await.unwrap() {
            Err(CrosstalkError::Remote(message)) => assert_eq!(message, "boom"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ack_resolution() {
        let table = PendingTable::new();
        let rx = table.register_message("m1");

        assert!(table.resolve_ack("m1", None));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_ack_with_error() {
        let table = PendingTable::new();
        let rx = table.register_message("m1");

        table.resolve_ack("m1", Some("handler failed".to_string()));
        match rx.await.unwrap() {
            Err(CrosstalkError::Remote(message)) => assert_eq!(message, "handler failed"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_kind_resolution_leaves_entry() {
        let table = PendingTable::new();
        let _rx = table.register_request("r1");

        assert!(!table.resolve_ack("r1", None));
        assert!(table.contains("r1"));
    }

    #[tokio::test]
    async fn test_continuous_stream_until_completed() {
        let table = PendingTable::new();
        let mut rx = table.register_continuous("c1");

        table.resolve_response("c1", json!(1), false, None);
        table.resolve_response("c1", json!(2), false, None);
        table.resolve_response("c1", json!(3), true, None);

        assert_eq!(rx.recv().await.unwrap().unwrap(), json!(1));
        assert_eq!(rx.recv().await.unwrap().unwrap(), json!(2));
        assert_eq!(rx.recv().await.unwrap().unwrap(), json!(3));
        // Channel closed after the terminal frame.
        assert!(rx.recv().await.is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_continuous_liveness_advances() {
        let table = PendingTable::new();
        let _rx = table.register_continuous("c1");

        let before = table.continuous_status("c1").unwrap();
        assert!(!before.first_response_seen);

        std::thread::sleep(std::time::Duration::from_millis(5));
        table.resolve_response("c1", json!(1), false, None);

        let after = table.continuous_status("c1").unwrap();
        assert!(after.first_response_seen);
        assert!(after.last_response > before.last_response);
    }

    #[tokio::test]
    async fn test_continuous_error_terminates() {
        let table = PendingTable::new();
        let mut rx = table.register_continuous("c1");

        table.resolve_response("c1", json!(1), false, None);
        table.resolve_response("c1", Value::Null, false, Some("stream died".to_string()));

        assert!(rx.recv().await.unwrap().is_ok());
        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.is_none());
        assert!(!table.contains("c1"));
    }

    #[tokio::test]
    async fn test_fail_all_aborts_everything() {
        let table = PendingTable::new();
        let message_rx = table.register_message("m1");
        let request_rx = table.register_request("r1");
        let mut continuous_rx = table.register_continuous("c1");

        assert_eq!(table.fail_all(&CrosstalkError::Disconnected), 3);
        assert!(matches!(
            message_rx.await.unwrap(),
            Err(CrosstalkError::Disconnected)
        ));
        assert!(matches!(
            request_rx.await.unwrap(),
            Err(CrosstalkError::Disconnected)
        ));
        assert!(matches!(
            continuous_rx.recv().await.unwrap(),
            Err(CrosstalkError::Disconnected)
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_fail_after_resolution_is_noop() {
        let table = PendingTable::new();
        let _rx = table.register_request("r1");
        table.resolve_response("r1", json!(1), true, None);
        assert!(!table.fail("r1", CrosstalkError::Timeout("late".to_string())));
    }
}
