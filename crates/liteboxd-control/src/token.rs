// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandbox access-token generation, encryption and hashing.
//!
//! A fresh token is generated for every sandbox. The control plane stores
//! three representations of it:
//!
//! - the SHA-256 hex digest, the only form ever compared against an inbound
//!   credential
//! - the AES-GCM ciphertext and nonce (base64), used only when the control
//!   plane must hand the plaintext back to the sandbox owner
//! - the id of the key that produced the ciphertext

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type Aes192Gcm = AesGcm<Aes192, U12>;

const NONCE_LEN: usize = 12;
const TOKEN_BYTES: usize = 32;

/// Token cipher errors.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Key material does not decode to a 16, 24 or 32 byte key.
    #[error("invalid encryption key length: must be 16/24/32 bytes (raw/hex/base64)")]
    InvalidKey,
    /// Ciphertext was produced by a different key.
    #[error("token was encrypted with key '{stored}', active key is '{active}'")]
    KeyMismatch {
        /// Key id persisted with the ciphertext
        stored: String,
        /// Key id of this cipher
        active: String,
    },
    /// Stored ciphertext or nonce is not valid base64.
    #[error("failed to decode {0}")]
    Decode(&'static str),
    /// AEAD sealing failed.
    #[error("failed to encrypt token")]
    Encrypt,
    /// AEAD opening failed (tampered data or wrong key).
    #[error("failed to decrypt token")]
    Decrypt,
}

/// Encrypted form of an access token, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedToken {
    /// Base64 AES-GCM ciphertext
    pub ciphertext: String,
    /// Base64 96-bit nonce
    pub nonce: String,
    /// Key id used for sealing
    pub key_id: String,
}

enum Inner {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

/// AES-GCM cipher for sandbox access tokens.
pub struct TokenCipher {
    inner: Inner,
    key_id: String,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Build a cipher from raw key bytes.
    pub fn new(key: &[u8], key_id: impl Into<String>) -> Result<Self, TokenError> {
        let inner = match key.len() {
            16 => Inner::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key).map_err(|_| TokenError::InvalidKey)?,
            )),
            24 => Inner::Aes192(Box::new(
                Aes192Gcm::new_from_slice(key).map_err(|_| TokenError::InvalidKey)?,
            )),
            32 => Inner::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| TokenError::InvalidKey)?,
            )),
            _ => return Err(TokenError::InvalidKey),
        };

        Ok(Self {
            inner,
            key_id: key_id.into(),
        })
    }

    /// Build a cipher from key material given as base64, hex or raw text (tried in that order).
    pub fn from_key_material(raw: &str, key_id: impl Into<String>) -> Result<Self, TokenError> {
        Self::new(&parse_key(raw)?, key_id)
    }

    /// Id of the active key.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Encrypt a plaintext token under a random nonce.
    pub fn seal(&self, token: &str) -> Result<SealedToken, TokenError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::<U12>::from_slice(&nonce_bytes);

        let ciphertext = match &self.inner {
            Inner::Aes128(c) => c.encrypt(nonce, token.as_bytes()),
            Inner::Aes192(c) => c.encrypt(nonce, token.as_bytes()),
            Inner::Aes256(c) => c.encrypt(nonce, token.as_bytes()),
        }
        .map_err(|_| TokenError::Encrypt)?;

        Ok(SealedToken {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce_bytes),
            key_id: self.key_id.clone(),
        })
    }

    /// Decrypt a previously sealed token.
    pub fn open(&self, sealed: &SealedToken) -> Result<String, TokenError> {
        if sealed.key_id != self.key_id {
            return Err(TokenError::KeyMismatch {
                stored: sealed.key_id.clone(),
                active: self.key_id.clone(),
            });
        }

        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .map_err(|_| TokenError::Decode("ciphertext"))?;
        let nonce_bytes = BASE64
            .decode(&sealed.nonce)
            .map_err(|_| TokenError::Decode("nonce"))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(TokenError::Decode("nonce"));
        }
        let nonce = Nonce::<U12>::from_slice(&nonce_bytes);

        let plain = match &self.inner {
            Inner::Aes128(c) => c.decrypt(nonce, ciphertext.as_slice()),
            Inner::Aes192(c) => c.decrypt(nonce, ciphertext.as_slice()),
            Inner::Aes256(c) => c.decrypt(nonce, ciphertext.as_slice()),
        }
        .map_err(|_| TokenError::Decrypt)?;

        String::from_utf8(plain).map_err(|_| TokenError::Decrypt)
    }
}

/// Generate a random access token (32 bytes, hex encoded).
pub fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    hex::encode(bytes)
}

/// SHA-256 hex digest of a token.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Compare a presented token against a stored digest in constant time.
pub fn digest_matches(presented: &str, stored_digest: &str) -> bool {
    let presented = hash_token(presented);
    presented.as_bytes().ct_eq(stored_digest.as_bytes()).into()
}

fn parse_key(raw: &str) -> Result<Vec<u8>, TokenError> {
    let raw = raw.trim();
    if let Ok(decoded) = BASE64.decode(raw)
        && valid_key_len(decoded.len())
    {
        return Ok(decoded);
    }
    if let Ok(decoded) = hex::decode(raw)
        && valid_key_len(decoded.len())
    {
        return Ok(decoded);
    }
    if valid_key_len(raw.len()) {
        return Ok(raw.as_bytes().to_vec());
    }
    Err(TokenError::InvalidKey)
}

fn valid_key_len(n: usize) -> bool {
    matches!(n, 16 | 24 | 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW_KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_seal_and_open() {
        let cipher = TokenCipher::from_key_material(RAW_KEY, "v1").unwrap();
        let token = generate_token();

        let sealed = cipher.seal(&token).unwrap();
        assert_eq!(sealed.key_id, "v1");
        assert_ne!(sealed.ciphertext, token);
        assert_eq!(cipher.open(&sealed).unwrap(), token);
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let cipher = TokenCipher::from_key_material(RAW_KEY, "v1").unwrap();
        let a = cipher.seal("same").unwrap();
        let b = cipher.seal("same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_key_material_formats() {
        let hex_key = hex::encode([7u8; 24]);
        assert!(TokenCipher::from_key_material(&hex_key, "v1").is_ok());

        let b64_key = BASE64.encode([9u8; 16]);
        assert!(TokenCipher::from_key_material(&b64_key, "v1").is_ok());

        assert!(TokenCipher::from_key_material(RAW_KEY, "v1").is_ok());
        assert!(matches!(
            TokenCipher::from_key_material("too-short", "v1"),
            Err(TokenError::InvalidKey)
        ));
    }

    #[test]
    fn test_open_rejects_other_key_id() {
        let v1 = TokenCipher::from_key_material(RAW_KEY, "v1").unwrap();
        let v2 = TokenCipher::from_key_material(RAW_KEY, "v2").unwrap();
        let sealed = v1.seal("tok").unwrap();
        assert!(matches!(v2.open(&sealed), Err(TokenError::KeyMismatch { .. })));
    }

    #[test]
    fn test_open_rejects_tampered_ciphertext() {
        let cipher = TokenCipher::from_key_material(RAW_KEY, "v1").unwrap();
        let mut sealed = cipher.seal("tok").unwrap();
        let mut bytes = BASE64.decode(&sealed.ciphertext).unwrap();
        bytes[0] ^= 0xff;
        sealed.ciphertext = BASE64.encode(bytes);
        assert!(matches!(cipher.open(&sealed), Err(TokenError::Decrypt)));
    }

    #[test]
    fn test_hash_is_deterministic_hex() {
        let digest = hash_token("abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest, hash_token("abc"));
        assert!(digest_matches("abc", &digest));
        assert!(!digest_matches("abd", &digest));
    }

    #[test]
    fn test_generated_tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
