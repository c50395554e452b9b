//! Session observers.
//!
//! Multicast semantics: every registered listener receives every event,
//! synchronously, in registration order. Connection-loss listeners get a
//! separate channel because they can veto the automatic session failure.

use std::sync::{Arc, Mutex};

use super::SessionState;
use crate::error::CrosstalkError;

/// Things a session tells its observers about.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session transitioned between lifecycle states.
    StateChanged {
        /// Previous state.
        from: SessionState,
        /// New state.
        to: SessionState,
    },
    /// An outbound frame was written to the adapter.
    MessageSent {
        /// Token of the written frame.
        token: String,
    },
    /// An outbound message could not be written or encoded.
    MessageFailed {
        /// Token of the failed frame.
        token: String,
        /// Failure description.
        error: String,
    },
    /// An outbound request could not be written or encoded.
    RequestFailed {
        /// Token of the failed frame.
        token: String,
        /// Failure description.
        error: String,
    },
    /// An outbound response could not be written or encoded. Responses are
    /// fire-and-forget; this event is their only failure surface.
    ResponseFailed {
        /// Token of the failed frame.
        token: String,
        /// Failure description.
        error: String,
    },
    /// Keep-alive retries were exhausted.
    KeepAliveFailed,
    /// The peer announced a graceful disconnect.
    Disconnected {
        /// Reason carried in the Disconnect frame, if any.
        reason: Option<String>,
    },
}

/// Mutable verdict passed to connection-loss listeners.
#[derive(Debug)]
pub struct ConnectionLossDecision {
    fail_session: bool,
}

impl ConnectionLossDecision {
    /// Keep the session alive despite the loss signal.
    pub fn retain(&mut self) {
        self.fail_session = false;
    }

    /// Let the session fail (the default).
    pub fn fail(&mut self) {
        self.fail_session = true;
    }

    /// Current verdict.
    pub fn will_fail(&self) -> bool {
        self.fail_session
    }
}

type EventListener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;
type LossListener = Arc<dyn Fn(&CrosstalkError, &mut ConnectionLossDecision) + Send + Sync>;

/// Listener registry for one session.
#[derive(Default)]
pub(crate) struct EventHub {
    listeners: Mutex<Vec<EventListener>>,
    loss_listeners: Mutex<Vec<LossListener>>,
}

impl EventHub {
    pub(crate) fn subscribe(&self, listener: EventListener) {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(listener);
    }

    pub(crate) fn subscribe_loss(&self, listener: LossListener) {
        self.loss_listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(listener);
    }

    pub(crate) fn emit(&self, event: &SessionEvent) {
        let listeners = {
            self.listeners
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        };
        for listener in listeners {
            listener(event);
        }
    }

    /// Run the loss listeners; returns whether the session should fail.
    pub(crate) fn decide_loss(&self, cause: &CrosstalkError) -> bool {
        let listeners = {
            self.loss_listeners
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        };
        let mut decision = ConnectionLossDecision { fail_session: true };
        for listener in listeners {
            listener(cause, &mut decision);
        }
        decision.fail_session
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub").finish_non_exhaustive()
    }
}
