//! Encryption for sensitive settings (Graph client secret, AD bind password,
//! FTP password).
//!
//! Stored format: `ENC:` + base64(nonce || ciphertext || tag), AES-256-GCM
//! with a key derived from the configured secret via PBKDF2-HMAC-SHA256.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::pbkdf2;
use std::num::NonZeroU32;

const NONCE_LEN: usize = 12;
const KDF_ROUNDS: u32 = 100_000;
const KDF_SALT: &[u8] = b"helpdesk_settings_v1";

pub const ENCRYPTED_PREFIX: &str = "ENC:";

/// Setting keys whose values never touch the database in plain text
pub const SENSITIVE_SETTING_KEYS: &[&str] = &["MS_CLIENT_SECRET", "AD_BIND_PASSWORD", "FTP_PASS"];

pub fn is_sensitive(key: &str) -> bool {
    SENSITIVE_SETTING_KEYS.contains(&key)
}

/// 256-bit key used for settings encryption
#[derive(Clone)]
pub struct SettingsKey([u8; 32]);

impl std::fmt::Debug for SettingsKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SettingsKey(..)")
    }
}

impl SettingsKey {
    pub fn derive(secret: &str) -> Self {
        let mut key = [0u8; 32];
        let rounds = NonZeroU32::new(KDF_ROUNDS).unwrap_or(NonZeroU32::MIN);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            rounds,
            KDF_SALT,
            secret.as_bytes(),
            &mut key,
        );
        Self(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        use rand::RngCore;

        if plaintext.is_empty() || is_encrypted(plaintext) {
            return Ok(plaintext.to_string());
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + sealed.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&sealed);

        Ok(format!("{}{}", ENCRYPTED_PREFIX, BASE64.encode(&combined)))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let Some(encoded) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(stored.to_string());
        };

        let combined = BASE64.decode(encoded).context("Failed to decode base64")?;
        if combined.len() <= NONCE_LEN {
            anyhow::bail!("Ciphertext too short");
        }
        let (nonce_bytes, sealed) = combined.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))?;
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|e| anyhow::anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

        String::from_utf8(plain).context("Decrypted value is not valid UTF-8")
    }
}

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

/// Replace a secret with a fixed-width mask for API responses
pub fn mask(value: &str) -> String {
    if value.is_empty() {
        String::new()
    } else {
        "********".to_string()
    }
}
