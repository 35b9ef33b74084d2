//! Secret-at-rest encryption for `ApiKey` scope blobs and `IntegrationConfig`
//! secret fields, via AES-256-GCM.
//!
//! The key is a 32-byte value supplied as hex in `SECRETS_KEY_HEX`. When
//! absent, a process-local random key is generated at startup (fine for a
//! single dev run, useless across restarts) and a warning is logged by the
//! caller in `main.rs` — this module itself stays side-effect free.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use rand::RngCore;

#[derive(Debug)]
pub enum SecretsError {
    InvalidKeyLength,
    InvalidHex,
    Encrypt,
    Decrypt(&'static str),
}

impl std::fmt::Display for SecretsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretsError::InvalidKeyLength => write!(f, "secrets key must be 32 bytes"),
            SecretsError::InvalidHex => write!(f, "secrets key is not valid hex"),
            SecretsError::Encrypt => write!(f, "encryption failed"),
            SecretsError::Decrypt(why) => write!(f, "decryption failed: {why}"),
        }
    }
}

impl std::error::Error for SecretsError {}

/// 32-byte AEAD key, held by whatever owns the `IntegrationManager`/control
/// API handlers that need to read or write secret blobs.
#[derive(Clone)]
pub struct SecretsKey(Key<Aes256Gcm>);

impl SecretsKey {
    pub fn from_hex(hex_str: &str) -> Result<Self, SecretsError> {
        let bytes = hex::decode(hex_str).map_err(|_| SecretsError::InvalidHex)?;
        if bytes.len() != 32 {
            return Err(SecretsError::InvalidKeyLength);
        }
        Ok(Self(*Key::<Aes256Gcm>::from_slice(&bytes)))
    }

    /// Generate a fresh random key for a single process lifetime.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(*Key::<Aes256Gcm>::from_slice(&bytes))
    }

    /// Encrypt `plaintext`, returning `base64(nonce || ciphertext)`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretsError> {
        let cipher = Aes256Gcm::new(&self.0);
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SecretsError::Encrypt)?;

        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(blob))
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, encoded: &str) -> Result<String, SecretsError> {
        let blob = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| SecretsError::Decrypt("invalid base64"))?;
        if blob.len() < 12 {
            return Err(SecretsError::Decrypt("blob too short"));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(12);
        let cipher = Aes256Gcm::new(&self.0);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecretsError::Decrypt("authentication failed"))?;
        String::from_utf8(plaintext).map_err(|_| SecretsError::Decrypt("not utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_secret() {
        let key = SecretsKey::generate();
        let ciphertext = key.encrypt("super-secret-token").unwrap();
        assert_ne!(ciphertext, "super-secret-token");
        assert_eq!(key.decrypt(&ciphertext).unwrap(), "super-secret-token");
    }

    #[test]
    fn rejects_tampered_blob() {
        let key = SecretsKey::generate();
        let mut ciphertext = key.encrypt("super-secret-token").unwrap();
        ciphertext.push('A');
        assert!(key.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(SecretsKey::from_hex("abcd").is_err());
    }
}
