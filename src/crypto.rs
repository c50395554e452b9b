//! Asymmetric cryptography seam for the handshake.
//!
//! The negotiator uses this provider for exactly one job: carrying the
//! symmetric channel password to the peer. Keys and ciphertext travel as
//! base64 strings inside handshake frames.
//!
//! The default implementation is X25519 in sealed-box style: encryption
//! generates an ephemeral key pair, derives a ChaCha20-Poly1305 key from
//! the Diffie-Hellman shared secret, and prepends the ephemeral public key
//! and nonce to the ciphertext.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{CrosstalkError, Result};

/// ChaCha20-Poly1305 nonce length in bytes.
const NONCE_SIZE: usize = 12;

/// HKDF context for sealed-box keys.
const SEAL_CONTEXT: &[u8] = b"crosstalk-handshake-v1";

/// A generated asymmetric key pair, base64-encoded.
#[derive(Clone)]
pub struct KeyPair {
    /// Public half, safe to send in a handshake Request.
    pub public: String,
    /// Private half, never leaves this process.
    pub private: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Creates key pairs and moves short secrets under a peer's public key.
pub trait CryptoProvider: Send + Sync {
    /// Generate a fresh key pair for one connection attempt.
    fn create_keys(&self) -> Result<KeyPair>;
    /// Encrypt `plaintext` so only the holder of `public_key`'s private
    /// half can read it.
    fn encrypt(&self, plaintext: &str, public_key: &str) -> Result<String>;
    /// Reverse of [`CryptoProvider::encrypt`].
    fn decrypt(&self, ciphertext: &str, private_key: &str) -> Result<String>;
}

/// X25519 sealed-box provider. The default.
#[derive(Debug, Default)]
pub struct X25519Provider;

impl CryptoProvider for X25519Provider {
    fn create_keys(&self) -> Result<KeyPair> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Ok(KeyPair {
            public: BASE64.encode(public.as_bytes()),
            private: BASE64.encode(secret.as_bytes()),
        })
    }

    fn encrypt(&self, plaintext: &str, public_key: &str) -> Result<String> {
        let peer = PublicKey::from(decode_key(public_key)?);

        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&peer);
        let cipher = seal_cipher(shared.as_bytes())?;

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|err| CrosstalkError::Crypto(format!("seal failed: {err}")))?;

        let mut blob = Vec::with_capacity(32 + NONCE_SIZE + sealed.len());
        blob.extend_from_slice(ephemeral_public.as_bytes());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(BASE64.encode(blob))
    }

    fn decrypt(&self, ciphertext: &str, private_key: &str) -> Result<String> {
        let secret = StaticSecret::from(decode_key(private_key)?);
        let blob = BASE64.decode(ciphertext)?;
        if blob.len() < 32 + NONCE_SIZE {
            return Err(CrosstalkError::Crypto("sealed blob too short".to_string()));
        }

        let mut ephemeral_public = [0u8; 32];
        ephemeral_public.copy_from_slice(&blob[..32]);
        let shared = secret.diffie_hellman(&PublicKey::from(ephemeral_public));
        let cipher = seal_cipher(shared.as_bytes())?;

        let nonce = Nonce::from_slice(&blob[32..32 + NONCE_SIZE]);
        let plain = cipher
            .decrypt(nonce, &blob[32 + NONCE_SIZE..])
            .map_err(|_| CrosstalkError::Crypto("open failed (wrong key or corrupted blob)".to_string()))?;

        String::from_utf8(plain)
            .map_err(|_| CrosstalkError::Crypto("sealed plaintext is not UTF-8".to_string()))
    }
}

fn seal_cipher(shared: &[u8; 32]) -> Result<ChaCha20Poly1305> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(SEAL_CONTEXT, key.as_mut())
        .map_err(|err| CrosstalkError::Crypto(format!("key derivation failed: {err}")))?;
    Ok(ChaCha20Poly1305::new(key.as_ref().into()))
}

fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    let raw = BASE64.decode(encoded)?;
    raw.try_into()
        .map_err(|_| CrosstalkError::Crypto("key must be 32 bytes".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sealed_roundtrip() {
        let provider = X25519Provider;
        let keys = provider.create_keys().unwrap();

        let sealed = provider.encrypt("the-symmetric-password", &keys.public).unwrap();
        let opened = provider.decrypt(&sealed, &keys.private).unwrap();
        assert_eq!(opened, "the-symmetric-password");
    }

    #[test]
    fn test_wrong_private_key_fails() {
        let provider = X25519Provider;
        let keys = provider.create_keys().unwrap();
        let other = provider.create_keys().unwrap();

        let sealed = provider.encrypt("secret", &keys.public).unwrap();
        assert!(provider.decrypt(&sealed, &other.private).is_err());
    }

    #[test]
    fn test_fresh_keys_each_call() {
        let provider = X25519Provider;
        let a = provider.create_keys().unwrap();
        let b = provider.create_keys().unwrap();
        assert_ne!(a.public, b.public);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let provider = X25519Provider;
        let keys = provider.create_keys().unwrap();
        let rendered = format!("{keys:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains(&keys.private));
    }
}
