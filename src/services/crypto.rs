//! Secrets codec for provider URLs and credential logins
//!
//! AES-256-GCM with a random 96-bit nonce per value. Stored form is
//! `base64(nonce || ciphertext)`.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::{AppError, Result};

/// AES-256-GCM nonce size (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

#[derive(Clone)]
pub struct SecretsCodec {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretsCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsCodec")
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}

impl SecretsCodec {
    /// Create a codec from a 32-byte key
    pub fn new(key_bytes: &[u8]) -> Result<Self> {
        if key_bytes.len() != 32 {
            return Err(AppError::Internal(format!(
                "Secrets key must be exactly 32 bytes, got {}",
                key_bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Create from a 64-character hex key
    pub fn from_hex_key(hex_key: &str) -> Result<Self> {
        let key_bytes = hex::decode(hex_key.trim())
            .map_err(|e| AppError::Internal(format!("Invalid hex key: {e}")))?;
        Self::new(&key_bytes)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| AppError::Internal(format!("Encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let combined = STANDARD
            .decode(stored.trim())
            .map_err(|e| AppError::Internal(format!("Invalid base64 in secret: {e}")))?;

        if combined.len() <= NONCE_SIZE {
            return Err(AppError::Internal("Encrypted secret too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                AppError::Internal("Decryption failed (wrong key or corrupted data)".to_string())
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| AppError::Internal("Decrypted secret is not UTF-8".to_string()))
    }
}

/// Mask a secret for diagnostics: `****` followed by its last four characters
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}
