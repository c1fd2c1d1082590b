//! Authenticated encryption of OAuth tokens at rest.
//!
//! Tokens are sealed with AES-256-GCM and stored as
//! `base64(nonce || ciphertext || tag)`. The 32-byte key comes from
//! configuration as 64 hex characters, or from the OS keyring.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use keyring::Entry;
use tracing::debug;

use crate::error::VaultError;

const APP_NAME: &str = "voisemail";
const KEY_ENTRY: &str = "vault_key";
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&(*key).into()),
        }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, VaultError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| VaultError::InvalidKey(format!("not hex: {}", e)))?;
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            VaultError::InvalidKey("must be 64 hex characters (32 bytes)".to_string())
        })?;
        Ok(Self::new(&key))
    }

    /// Uses the configured key when present, otherwise the keyring entry.
    pub fn load(configured: Option<&str>) -> Result<Self, VaultError> {
        if let Some(hex_key) = configured.filter(|k| !k.trim().is_empty()) {
            return Self::from_hex(hex_key);
        }
        let entry = Entry::new(APP_NAME, KEY_ENTRY).map_err(|e| VaultError::Keyring(e.to_string()))?;
        match entry.get_password() {
            Ok(hex_key) => {
                debug!("Loaded vault key from keyring");
                Self::from_hex(&hex_key)
            }
            Err(keyring::Error::NoEntry) => Err(VaultError::InvalidKey(
                "no key configured and none in keyring; run `voisemail init-key`".to_string(),
            )),
            Err(e) => Err(VaultError::Keyring(e.to_string())),
        }
    }

    pub fn generate_key_hex() -> String {
        hex::encode(Aes256Gcm::generate_key(OsRng))
    }

    /// Generates a new key and stores it in the OS keyring, replacing any old one.
    pub fn init_keyring() -> Result<String, VaultError> {
        let hex_key = Self::generate_key_hex();
        let entry = Entry::new(APP_NAME, KEY_ENTRY).map_err(|e| VaultError::Keyring(e.to_string()))?;
        entry
            .set_password(&hex_key)
            .map_err(|e| VaultError::Keyring(e.to_string()))?;
        Ok(hex_key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        if plaintext.is_empty() {
            return Err(VaultError::Encryption(
                "Cannot encrypt empty plaintext".to_string(),
            ));
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::Encryption(format!("AES-GCM encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(&combined))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, VaultError> {
        if encrypted.is_empty() {
            return Err(VaultError::InvalidFormat(
                "Cannot decrypt empty string".to_string(),
            ));
        }

        let combined = BASE64
            .decode(encrypted)
            .map_err(|e| VaultError::InvalidFormat(format!("Invalid base64 encoding: {}", e)))?;

        if combined.len() <= NONCE_SIZE {
            return Err(VaultError::InvalidFormat(format!(
                "Encrypted data too short: {} bytes",
                combined.len()
            )));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                VaultError::Decryption("wrong key or tampered ciphertext".to_string())
            })?;

        String::from_utf8(plaintext)
            .map_err(|e| VaultError::Decryption(format!("not valid UTF-8: {}", e)))
    }
}
