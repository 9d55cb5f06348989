// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Secrets at rest.
//!
//! Provider API keys are sealed with AES-256-GCM under a process-wide master
//! key; the stored form is `base64(nonce || ciphertext)`.  Auth tokens are
//! never stored at all — only their SHA-256 digest, compared in constant
//! time.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::DbError;

const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for provider API keys.
#[derive(Clone)]
pub struct KeyCipher {
    key: Key<Aes256Gcm>,
}

impl KeyCipher {
    /// Build from a hex-encoded 32-byte master key.
    pub fn from_hex(hex_key: &str) -> Result<Self, DbError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| DbError::Internal(format!("master key is not hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(DbError::Internal(format!(
                "master key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self { key: *Key::<Aes256Gcm>::from_slice(&bytes) })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, DbError> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| DbError::Internal("encryption failed".into()))?;
        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, sealed_b64: &str) -> Result<String, DbError> {
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(sealed_b64)
            .map_err(|e| DbError::Internal(format!("sealed key is not base64: {e}")))?;
        if sealed.len() < NONCE_LEN {
            return Err(DbError::Internal("sealed key too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| DbError::Internal("decryption failed (wrong master key?)".into()))?;
        String::from_utf8(plaintext)
            .map_err(|_| DbError::Internal("decrypted key is not UTF-8".into()))
    }
}

/// SHA-256 digest of an auth token, hex-encoded for storage.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Constant-time comparison of a presented token against a stored digest.
pub fn token_matches(token: &str, stored_hash_hex: &str) -> bool {
    let presented = Sha256::digest(token.as_bytes());
    match hex::decode(stored_hash_hex) {
        Ok(stored) if stored.len() == presented.len() => {
            presented.as_slice().ct_eq(&stored).into()
        }
        _ => false,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
