//! Authenticated encryption for credentials at rest.
//!
//! Stored form is `hex(nonce):hex(tag):hex(ciphertext)` produced by AES-256-GCM
//! with a process-wide key.
use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use std::fmt;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault key must be 32 bytes of hex")]
    InvalidKey,
    #[error("encrypted value failed integrity check: {0}")]
    Integrity(&'static str),
}

/// A decrypted credential. Formatting never reveals the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    pub fn from_key(key: &[u8]) -> Result<Self, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| VaultError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn from_hex_key(key_hex: &str) -> Result<Self, VaultError> {
        let bytes = hex::decode(key_hex.trim()).map_err(|_| VaultError::InvalidKey)?;
        if bytes.len() != KEY_LEN {
            return Err(VaultError::InvalidKey);
        }
        Self::from_key(&bytes)
    }

    /// Load the key once from the named environment variable.
    pub fn from_env(var: &str) -> anyhow::Result<Self> {
        let key_hex = std::env::var(var)
            .map_err(|_| anyhow::anyhow!("environment variable {} is not set", var))?;
        Ok(Self::from_hex_key(&key_hex)?)
    }

    /// Fresh random key, hex encoded.
    pub fn generate_key_hex() -> String {
        hex::encode(Aes256Gcm::generate_key(&mut OsRng))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, b"", &mut buffer)
            .map_err(|_| VaultError::Integrity("encryption failed"))?;
        Ok(format!(
            "{}:{}:{}",
            hex::encode(nonce),
            hex::encode(tag),
            hex::encode(buffer)
        ))
    }

    pub fn decrypt(&self, opaque: &str) -> Result<Secret, VaultError> {
        let mut parts = opaque.split(':');
        let (Some(nonce_hex), Some(tag_hex), Some(body_hex), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(VaultError::Integrity("expected nonce:tag:ciphertext"));
        };

        let nonce = hex::decode(nonce_hex).map_err(|_| VaultError::Integrity("nonce is not hex"))?;
        let tag = hex::decode(tag_hex).map_err(|_| VaultError::Integrity("tag is not hex"))?;
        let mut buffer =
            hex::decode(body_hex).map_err(|_| VaultError::Integrity("ciphertext is not hex"))?;
        if nonce.len() != NONCE_LEN {
            return Err(VaultError::Integrity("nonce has wrong length"));
        }
        if tag.len() != TAG_LEN {
            return Err(VaultError::Integrity("tag has wrong length"));
        }

        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                b"",
                &mut buffer,
                Tag::from_slice(&tag),
            )
            .map_err(|_| VaultError::Integrity("authentication tag mismatch"))?;

        let plaintext =
            String::from_utf8(buffer).map_err(|_| VaultError::Integrity("plaintext is not utf-8"))?;
        Ok(Secret(plaintext))
    }
}
