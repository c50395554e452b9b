//! Symmetric payload encryption for an established channel.
//!
//! Dormant until the handshake yields a symmetric password; from then on
//! every payload is sealed with ChaCha20-Poly1305 under a key derived from
//! the password via HKDF-SHA256. The random nonce is prepended to the
//! ciphertext, matching the AEAD framing used by the handshake's password
//! exchange.

use std::sync::RwLock;

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{CrosstalkError, Result};

/// ChaCha20-Poly1305 nonce length in bytes.
const NONCE_SIZE: usize = 12;

/// HKDF context separating payload keys from any other password use.
const KEY_CONTEXT: &[u8] = b"crosstalk-payload-v1";

/// Shared encryption state for one session's channel.
///
/// Both the encoder (push worker) and decoder (pull worker) hold the same
/// instance; the handshake enables it once the password is known.
#[derive(Default)]
pub struct ChannelSecurity {
    cipher: RwLock<Option<ChaCha20Poly1305>>,
}

impl ChannelSecurity {
    /// Create a dormant instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the payload key from the negotiated password and start
    /// sealing/opening payloads.
    pub fn enable(&self, password: &str) -> Result<()> {
        let ikm = Zeroizing::new(password.as_bytes().to_vec());
        let hk = Hkdf::<Sha256>::new(None, &ikm);
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(KEY_CONTEXT, key.as_mut())
            .map_err(|err| CrosstalkError::Crypto(format!("key derivation failed: {err}")))?;

        let cipher = ChaCha20Poly1305::new(key.as_ref().into());
        *self.cipher.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(cipher);
        Ok(())
    }

    /// True once a payload key has been derived.
    pub fn is_enabled(&self) -> bool {
        self.cipher
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }

    /// Seal a payload. Passthrough while dormant.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let guard = self
            .cipher
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(cipher) = guard.as_ref() else {
            return Ok(plaintext.to_vec());
        };

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|err| CrosstalkError::Crypto(format!("payload encryption failed: {err}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a payload. Passthrough while dormant.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let guard = self
            .cipher
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(cipher) = guard.as_ref() else {
            return Ok(data.to_vec());
        };

        if data.len() < NONCE_SIZE {
            return Err(CrosstalkError::Decode {
                token: None,
                reason: "encrypted payload shorter than nonce".to_string(),
            });
        }
        let (nonce, sealed) = data.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CrosstalkError::Decode {
                token: None,
                reason: "payload decryption failed (wrong key or corrupted frame)".to_string(),
            })
    }
}

impl std::fmt::Debug for ChannelSecurity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSecurity")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
