//! Block encryption.
//!
//! Key derivation: Argon2id(password, salt) → 32-byte key.  The salt is the
//! random value stored in the archive-root header, so the same password gives
//! a different key for every archive.
//!
//! Encrypted block layout: `nonce (12 B) | ciphertext | GCM tag (16 B)`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use thiserror::Error;

pub const NONCE_LEN: usize = 12;

pub use crate::block::ENCRYPT_NONE;
pub const ENCRYPT_AES256_GCM: u16 = 1;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed, wrong password or corrupted data")]
    DecryptionFailed,
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Encrypted payload too short (minimum {NONCE_LEN} bytes)")]
    TooShort,
    #[error("Block is encrypted but no key was provided")]
    MissingKey,
    #[error("Unknown encryption algorithm tag {0}")]
    UnknownAlgorithm(u16),
}

/// A derived 256-bit block key.
#[derive(Clone)]
pub struct BlockKey([u8; 32]);

impl std::fmt::Debug for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlockKey(..)")
    }
}

impl BlockKey {
    pub fn derive(password: &str, salt: &[u8]) -> Result<Self, CryptoError> {
        let params = Params::new(64 * 1024, 3, 1, Some(32))
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut key = [0u8; 32];
        argon2
            .hash_password_into(password.as_bytes(), salt, &mut key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(Self(key))
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self(key)
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::EncryptionFailed)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()?
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LEN {
            return Err(CryptoError::TooShort);
        }
        let nonce = aes_gcm::Nonce::from_slice(&data[..NONCE_LEN]);
        self.cipher()?
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
