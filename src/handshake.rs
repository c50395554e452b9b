//! In-band encryption handshake.
//!
//! Handshake frames travel on the same channel as protocol frames and are
//! marked by a leading zero byte (protocol frames always start with a
//! non-zero header version). The exchange derives one symmetric channel
//! password:
//!
//! 1. Both sides send a Request carrying a random per-connection client id,
//!    their public key, and whether they require encryption.
//! 2. The side with the larger client id generates the password, seals it
//!    under the peer's public key, and sends it in a Response.
//! 3. The smaller side opens the password and confirms with Complete; both
//!    sides are then `Completed`.
//!
//! If neither side requires encryption the same dance runs without a
//! password and completes immediately on Complete. The negotiator is a
//! plain state machine: it never touches the adapter, it returns
//! [`HandshakeAction`]s for the session to execute, which keeps it
//! independently testable and keeps adapter writes on one code path.

use std::sync::Arc;

use bytes::{Buf, BufMut};
use rand::Rng;
use tokio::sync::watch;
use uuid::Uuid;

use crate::codec::header::{put_str16, take_str16, HANDSHAKE_MARKER};
use crate::crypto::{CryptoProvider, KeyPair};
use crate::error::{CrosstalkError, Result};

/// Negotiator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Armed but no frame exchanged yet.
    #[default]
    Idle,
    /// Frames in flight.
    Negotiating,
    /// Exchange finished; terminal until the next [`HandshakeNegotiator::reset`].
    Completed,
}

/// What the session must do after feeding the negotiator.
#[derive(Debug)]
pub enum HandshakeAction {
    /// Write these bytes to the adapter before any queued protocol frame.
    Write(Vec<u8>),
    /// The symmetric channel password is known; enable payload encryption.
    PasswordAvailable(String),
    /// The exchange is complete.
    Completed,
}

/// Handshake frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeKind {
    Request = 1,
    Response = 2,
    Complete = 3,
}

impl HandshakeKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Complete),
            _ => None,
        }
    }
}

/// One handshake frame on the wire.
#[derive(Debug)]
struct HandshakeFrame {
    kind: HandshakeKind,
    client_id: u32,
    require_encryption: bool,
    public_key: String,
    /// Sealed password (Response only).
    password: String,
}

impl HandshakeFrame {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(16 + self.public_key.len() + self.password.len());
        buf.put_u8(HANDSHAKE_MARKER);
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.client_id);
        buf.put_u8(u8::from(self.require_encryption));
        put_str16(&mut buf, &self.public_key)?;
        put_str16(&mut buf, &self.password)?;
        Ok(buf)
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.remaining() < 7 || buf.get_u8() != HANDSHAKE_MARKER {
            return Err(CrosstalkError::Handshake("malformed handshake frame".to_string()));
        }
        let kind = HandshakeKind::from_byte(buf.get_u8())
            .ok_or_else(|| CrosstalkError::Handshake("unknown handshake frame kind".to_string()))?;
        let client_id = buf.get_u32_le();
        let require_encryption = buf.get_u8() != 0;
        let public_key = take_str16(&mut buf, None, "handshake public key")
            .map_err(|err| CrosstalkError::Handshake(err.to_string()))?;
        let password = take_str16(&mut buf, None, "handshake password")
            .map_err(|err| CrosstalkError::Handshake(err.to_string()))?;
        Ok(Self {
            kind,
            client_id,
            require_encryption,
            public_key,
            password,
        })
    }
}

/// The handshake state machine for one session.
pub struct HandshakeNegotiator {
    state: HandshakeState,
    require_encryption: bool,
    provider: Option<Arc<dyn CryptoProvider>>,
    keys: Option<KeyPair>,
    client_id: u32,
    sent_request: bool,
    peer_requires_encryption: bool,
    completed_tx: watch::Sender<bool>,
    completed_rx: watch::Receiver<bool>,
}

impl HandshakeNegotiator {
    /// An un-armed negotiator; [`HandshakeNegotiator::reset`] before use.
    pub fn new() -> Self {
        let (completed_tx, completed_rx) = watch::channel(false);
        Self {
            state: HandshakeState::Idle,
            require_encryption: false,
            provider: None,
            keys: None,
            client_id: 0,
            sent_request: false,
            peer_requires_encryption: false,
            completed_tx,
            completed_rx,
        }
    }

    /// Re-arm for a new connection attempt: fresh client id, fresh keys.
    pub fn reset(
        &mut self,
        require_encryption: bool,
        provider: Arc<dyn CryptoProvider>,
    ) -> Result<()> {
        self.keys = Some(provider.create_keys()?);
        self.client_id = rand::thread_rng().gen();
        self.require_encryption = require_encryption;
        self.peer_requires_encryption = false;
        self.provider = Some(provider);
        self.sent_request = false;
        self.state = HandshakeState::Idle;
        let _ = self.completed_tx.send(false);
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Watch flipping to `true` when the exchange completes; used by the
    /// push worker to bound its wait before the first encrypted frame.
    pub fn completed_watch(&self) -> watch::Receiver<bool> {
        self.completed_rx.clone()
    }

    /// Start the exchange. No-op unless Idle.
    pub fn begin(&mut self) -> Result<Vec<HandshakeAction>> {
        if self.state != HandshakeState::Idle {
            return Ok(Vec::new());
        }
        self.state = HandshakeState::Negotiating;
        self.sent_request = true;
        Ok(vec![HandshakeAction::Write(self.request_frame()?.encode()?)])
    }

    /// Feed one inbound handshake frame.
    pub fn handle_frame(&mut self, data: &[u8]) -> Result<Vec<HandshakeAction>> {
        if self.keys.is_none() {
            return Err(CrosstalkError::Handshake("negotiator was not reset".to_string()));
        }
        if self.state == HandshakeState::Completed {
            return Ok(Vec::new());
        }

        let frame = HandshakeFrame::decode(data)?;
        match frame.kind {
            HandshakeKind::Request => self.on_request(&frame),
            HandshakeKind::Response => self.on_response(&frame),
            HandshakeKind::Complete => {
                self.complete();
                Ok(vec![HandshakeAction::Completed])
            }
        }
    }

    fn on_request(&mut self, frame: &HandshakeFrame) -> Result<Vec<HandshakeAction>> {
        let mut actions = Vec::new();
        self.peer_requires_encryption = frame.require_encryption;

        // Answer a cold Request with our own before taking a role, so both
        // sides hold both public keys and client ids.
        if !self.sent_request {
            self.state = HandshakeState::Negotiating;
            self.sent_request = true;
            actions.push(HandshakeAction::Write(self.request_frame()?.encode()?));
        }

        // Equal ids cannot break symmetry; force a fresh attempt.
        if frame.client_id == self.client_id {
            return Err(CrosstalkError::Handshake(
                "client id collision; reset and retry".to_string(),
            ));
        }

        // The larger client id supplies the password (when anyone needs one).
        if self.client_id > frame.client_id {
            let encryption_needed = self.require_encryption || frame.require_encryption;
            let sealed = if encryption_needed {
                let password = Uuid::new_v4().simple().to_string();
                let provider = self.provider()?;
                let sealed = provider.encrypt(&password, &frame.public_key)?;
                actions.push(HandshakeAction::PasswordAvailable(password));
                sealed
            } else {
                String::new()
            };

            actions.push(HandshakeAction::Write(
                HandshakeFrame {
                    kind: HandshakeKind::Response,
                    client_id: self.client_id,
                    require_encryption: self.require_encryption,
                    public_key: String::new(),
                    password: sealed,
                }
                .encode()?,
            ));
        }
        Ok(actions)
    }

    fn on_response(&mut self, frame: &HandshakeFrame) -> Result<Vec<HandshakeAction>> {
        let mut actions = Vec::new();

        if !frame.password.is_empty() {
            let private = self
                .keys
                .as_ref()
                .map(|keys| keys.private.clone())
                .ok_or_else(|| CrosstalkError::Handshake("no local key pair".to_string()))?;
            let password = self.provider()?.decrypt(&frame.password, &private)?;
            actions.push(HandshakeAction::PasswordAvailable(password));
        }

        actions.push(HandshakeAction::Write(
            HandshakeFrame {
                kind: HandshakeKind::Complete,
                client_id: self.client_id,
                require_encryption: self.require_encryption,
                public_key: String::new(),
                password: String::new(),
            }
            .encode()?,
        ));
        self.complete();
        actions.push(HandshakeAction::Completed);
        Ok(actions)
    }

    fn complete(&mut self) {
        self.state = HandshakeState::Completed;
        let _ = self.completed_tx.send(true);
    }

    fn request_frame(&self) -> Result<HandshakeFrame> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| CrosstalkError::Handshake("negotiator was not reset".to_string()))?;
        Ok(HandshakeFrame {
            kind: HandshakeKind::Request,
            client_id: self.client_id,
            require_encryption: self.require_encryption,
            public_key: keys.public.clone(),
            password: String::new(),
        })
    }

    fn provider(&self) -> Result<&Arc<dyn CryptoProvider>> {
        self.provider
            .as_ref()
            .ok_or_else(|| CrosstalkError::Handshake("negotiator was not reset".to_string()))
    }
}

impl Default for HandshakeNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandshakeNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeNegotiator")
            .field("state", &self.state)
            .field("client_id", &self.client_id)
            .field("require_encryption", &self.require_encryption)
            .finish()
    }
}

/// True when a raw inbound buffer is a handshake frame.
pub fn is_handshake_frame(data: &[u8]) -> bool {
    data.first() == Some(&HANDSHAKE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::X25519Provider;

    fn armed(require_encryption: bool) -> HandshakeNegotiator {
        let mut negotiator = HandshakeNegotiator::new();
        negotiator
            .reset(require_encryption, Arc::new(X25519Provider))
            .unwrap();
        negotiator
    }

    /// Drives two negotiators to completion, returning the password each
    /// side observed.
    fn run_exchange(
        a: &mut HandshakeNegotiator,
        b: &mut HandshakeNegotiator,
    ) -> (Option<String>, Option<String>) {
        let mut password_a = None;
        let mut password_b = None;
        // (destination is `a`, frame bytes)
        let mut wire: Vec<(bool, Vec<u8>)> = Vec::new();

        for action in a.begin().unwrap() {
            match action {
                HandshakeAction::Write(bytes) => wire.push((false, bytes)),
                HandshakeAction::PasswordAvailable(pw) => password_a = Some(pw),
                HandshakeAction::Completed => {}
            }
        }

        let mut hops = 0;
        while let Some((to_a, bytes)) = wire.pop() {
            hops += 1;
            assert!(hops < 16, "handshake did not converge");
            let (target, password_slot) = if to_a {
                (&mut *a, &mut password_a)
            } else {
                (&mut *b, &mut password_b)
            };
            for action in target.handle_frame(&bytes).unwrap() {
                match action {
                    HandshakeAction::Write(bytes) => wire.push((!to_a, bytes)),
                    HandshakeAction::PasswordAvailable(pw) => *password_slot = Some(pw),
                    HandshakeAction::Completed => {}
                }
            }
        }
        (password_a, password_b)
    }

    #[test]
    fn test_two_way_exchange_converges() {
        let mut a = armed(true);
        let mut b = armed(true);
        let (pw_a, pw_b) = run_exchange(&mut a, &mut b);

        assert_eq!(a.state(), HandshakeState::Completed);
        assert_eq!(b.state(), HandshakeState::Completed);
        assert!(pw_a.is_some());
        assert_eq!(pw_a, pw_b);
    }

    #[test]
    fn test_one_way_exchange_converges() {
        let mut a = armed(true);
        let mut b = armed(false);
        let (pw_a, pw_b) = run_exchange(&mut a, &mut b);

        assert_eq!(a.state(), HandshakeState::Completed);
        assert_eq!(b.state(), HandshakeState::Completed);
        // One password, adopted by both ends of the channel.
        assert!(pw_a.is_some());
        assert_eq!(pw_a, pw_b);
    }

    #[test]
    fn test_no_encryption_completes_without_password() {
        let mut a = armed(false);
        let mut b = armed(false);
        let (pw_a, pw_b) = run_exchange(&mut a, &mut b);

        assert_eq!(a.state(), HandshakeState::Completed);
        assert_eq!(b.state(), HandshakeState::Completed);
        assert!(pw_a.is_none());
        assert!(pw_b.is_none());
    }

    #[test]
    fn test_begin_is_idempotent() {
        let mut negotiator = armed(true);
        assert_eq!(negotiator.begin().unwrap().len(), 1);
        assert!(negotiator.begin().unwrap().is_empty());
    }

    #[test]
    fn test_completed_watch_flips() {
        let mut a = armed(false);
        let mut b = armed(false);
        let watch = a.completed_watch();
        assert!(!*watch.borrow());
        run_exchange(&mut a, &mut b);
        assert!(*watch.borrow());
    }

    #[test]
    fn test_unreset_negotiator_rejects_frames() {
        let mut negotiator = HandshakeNegotiator::new();
        let err = negotiator.handle_frame(&[0, 1, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, CrosstalkError::Handshake(_)));
    }

    #[test]
    fn test_frames_after_completion_ignored() {
        let mut a = armed(false);
        let mut b = armed(false);
        run_exchange(&mut a, &mut b);

        let mut c = armed(false);
        let request = match c.begin().unwrap().remove(0) {
            HandshakeAction::Write(bytes) => bytes,
            other => panic!("expected write, got {other:?}"),
        };
        assert!(a.handle_frame(&request).unwrap().is_empty());
    }

    #[test]
    fn test_is_handshake_frame() {
        assert!(is_handshake_frame(&[0, 1, 2]));
        assert!(!is_handshake_frame(&[1, 0, 0]));
        assert!(!is_handshake_frame(&[]));
    }
}
