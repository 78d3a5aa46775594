//! Payload encryption.
//!
//! Packets ask for encryption with [`OutboundPacket::encrypted`]; the messenger applies
//! the installed [`Cipher`] to the payload and sets the `ENCRYPTED` flag. Key agreement
//! is left to the application, which installs a cipher built from a shared key.
//!
//! [`OutboundPacket::encrypted`]: crate::core::packet::OutboundPacket::encrypted

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

use crate::error::{ProtocolError, Result};

/// Nonce length for XChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 24;

/// An authenticated payload cipher.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// XChaCha20-Poly1305 with a random 24-byte nonce prepended to every payload.
pub struct ChaChaCipher {
    cipher: XChaCha20Poly1305,
}

impl ChaChaCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Generates a fresh random key.
    pub fn generate_key() -> Result<[u8; 32]> {
        let mut key = [0u8; 32];
        getrandom::fill(&mut key).map_err(|_| ProtocolError::EncryptionFailure)?;
        Ok(key)
    }
}

impl std::fmt::Debug for ChaChaCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChaChaCipher { .. }")
    }
}

impl Cipher for ChaChaCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce).map_err(|_| ProtocolError::EncryptionFailure)?;

        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| ProtocolError::EncryptionFailure)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), body)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}
