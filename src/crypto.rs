//! Token generation, keyed token hashing, and upstream-key encryption
//!
//! Three secrets flow through the proxy and each gets a different
//! treatment:
//!
//! - **Withering tokens** are never stored. We persist a keyed SHA-256
//!   hash (process-wide pepper mixed in) and look rows up by a truncated
//!   prefix of it; the full hash is compared in constant time.
//! - **Upstream provider keys** are encrypted at rest with AES-256-GCM
//!   when an encryption key is configured, and decrypted lazily per
//!   request.
//! - **The management token** is only ever compared, in constant time.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Prefix on every issued token. Purely cosmetic: lets operators spot a
/// withering token in a config file or log at a glance.
const TOKEN_PREFIX: &str = "wt-";

/// Random bytes per token (256 bits, comfortably above the 128-bit floor).
const TOKEN_ENTROPY_BYTES: usize = 32;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Hex characters of the token hash used for the indexed lookup column
/// (128 bits; the full 256-bit hash is still verified afterwards).
pub const LOOKUP_HASH_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be 32 bytes (64 hex chars or base64)")]
    BadKeyLength,
    #[error("ciphertext too short")]
    CiphertextTooShort,
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptFailed,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("stored key is encrypted but no encryption key is configured")]
    CipherUnavailable,
}

// ─────────────────────────────────────────────────────────────────────────────
// Constant-time comparison
// ─────────────────────────────────────────────────────────────────────────────

/// Compare two byte strings without early exit.
///
/// Length difference still returns immediately; for the hex-hash and
/// bearer-token comparisons in this crate both sides are fixed-width.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ─────────────────────────────────────────────────────────────────────────────
// Token generation and hashing
// ─────────────────────────────────────────────────────────────────────────────

/// Generate a fresh withering token: `wt-` + 256 random bits, URL-safe
/// base64 without padding. Returned exactly once at issuance.
pub fn generate_token() -> String {
    let mut buf = [0u8; TOKEN_ENTROPY_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(buf))
}

/// Keyed hash of a presented token, in the stored (hex) form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHash {
    /// Full 64-char hex digest; persisted and compared in constant time.
    pub full: String,
}

impl TokenHash {
    /// The truncated prefix used for the indexed lookup column.
    pub fn lookup(&self) -> &str {
        &self.full[..LOOKUP_HASH_LEN]
    }
}

/// Hash a token with the process-wide pepper.
///
/// The pepper never leaves process memory, so a copied database cannot be
/// probed for token membership offline.
pub fn hash_token(pepper: &str, token: &str) -> TokenHash {
    let mut hasher = Sha256::new();
    hasher.update(pepper.as_bytes());
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();
    TokenHash {
        full: format!("{digest:x}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Upstream-key encryption at rest
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a configured master key: 64 hex chars or base64 of 32 bytes.
pub fn parse_master_key(raw: &str) -> Result<[u8; 32], CryptoError> {
    let raw = raw.trim();
    let bytes = if raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut out = Vec::with_capacity(32);
        let chars: Vec<u8> = raw.bytes().collect();
        for pair in chars.chunks(2) {
            let hi = (pair[0] as char).to_digit(16).ok_or(CryptoError::BadKeyLength)?;
            let lo = (pair[1] as char).to_digit(16).ok_or(CryptoError::BadKeyLength)?;
            out.push(((hi << 4) | lo) as u8);
        }
        out
    } else {
        STANDARD
            .decode(raw)
            .map_err(|_| CryptoError::BadKeyLength)?
    };
    let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::BadKeyLength)?;
    Ok(arr)
}

/// Encrypts and decrypts upstream provider keys.
///
/// With no master key configured the cipher passes values through and
/// flags them unencrypted, so a deployment can start without encryption
/// and add it later without a data migration (old rows stay readable).
pub struct KeyCipher {
    cipher: Option<Aes256Gcm>,
}

impl KeyCipher {
    /// Build from an optional 32-byte master key.
    pub fn new(master_key: Option<[u8; 32]>) -> Self {
        Self {
            cipher: master_key.map(|k| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&k))),
        }
    }

    /// Whether values will actually be encrypted.
    pub fn is_active(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypt a secret for storage. Returns the blob and whether it is
    /// encrypted. Encrypted blobs are `nonce (12 bytes) || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(Vec<u8>, bool), CryptoError> {
        match &self.cipher {
            None => Ok((plaintext.to_vec(), false)),
            Some(cipher) => {
                let mut nonce = [0u8; NONCE_LEN];
                rand::rngs::OsRng.fill_bytes(&mut nonce);
                let ct = cipher
                    .encrypt(Nonce::from_slice(&nonce), plaintext)
                    .map_err(|_| CryptoError::EncryptFailed)?;
                let mut blob = Vec::with_capacity(NONCE_LEN + ct.len());
                blob.extend_from_slice(&nonce);
                blob.extend_from_slice(&ct);
                Ok((blob, true))
            }
        }
    }

    /// Decrypt a stored blob. `encrypted` comes from the row's flag column.
    pub fn open(&self, blob: &[u8], encrypted: bool) -> Result<Vec<u8>, CryptoError> {
        if !encrypted {
            return Ok(blob.to_vec());
        }
        let cipher = self.cipher.as_ref().ok_or(CryptoError::CipherUnavailable)?;
        if blob.len() <= NONCE_LEN {
            return Err(CryptoError::CiphertextTooShort);
        }
        let (nonce, ct) = blob.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn test_generate_token_shape() {
        let t1 = generate_token();
        let t2 = generate_token();
        assert!(t1.starts_with("wt-"));
        assert_ne!(t1, t2);
        // 32 bytes -> 43 base64url chars, plus the prefix
        assert_eq!(t1.len(), 3 + 43);
        assert!(t1[3..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_hash_token_stable_and_peppered() {
        let a = hash_token("pepper", "wt-abc");
        let b = hash_token("pepper", "wt-abc");
        let c = hash_token("other", "wt-abc");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.full.len(), 64);
        assert_eq!(a.lookup().len(), LOOKUP_HASH_LEN);
        assert!(a.full.starts_with(a.lookup()));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abcd", "abcd"));
        assert!(!constant_time_eq("abcd", "abce"));
        assert!(!constant_time_eq("abcd", "abcde"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = KeyCipher::new(Some(test_key()));
        let (blob, encrypted) = cipher.seal(b"sk-upstream-secret").unwrap();
        assert!(encrypted);
        assert_ne!(blob, b"sk-upstream-secret");
        let plain = cipher.open(&blob, true).unwrap();
        assert_eq!(plain, b"sk-upstream-secret");
    }

    #[test]
    fn test_seal_unique_nonces() {
        let cipher = KeyCipher::new(Some(test_key()));
        let (a, _) = cipher.seal(b"same").unwrap();
        let (b, _) = cipher.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_wrong_key_fails() {
        let cipher = KeyCipher::new(Some(test_key()));
        let (blob, _) = cipher.seal(b"secret").unwrap();
        let other = KeyCipher::new(Some([9u8; 32]));
        assert!(matches!(
            other.open(&blob, true),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn test_plaintext_passthrough() {
        let cipher = KeyCipher::new(None);
        assert!(!cipher.is_active());
        let (blob, encrypted) = cipher.seal(b"secret").unwrap();
        assert!(!encrypted);
        assert_eq!(blob, b"secret");
        assert_eq!(cipher.open(&blob, false).unwrap(), b"secret");
        // Encrypted rows are unreadable without a key
        assert!(matches!(
            cipher.open(&blob, true),
            Err(CryptoError::CipherUnavailable)
        ));
    }

    #[test]
    fn test_parse_master_key_hex_and_base64() {
        let hex = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let parsed = parse_master_key(hex).unwrap();
        assert_eq!(parsed[0], 0x00);
        assert_eq!(parsed[1], 0x11);

        let b64 = STANDARD.encode([5u8; 32]);
        assert_eq!(parse_master_key(&b64).unwrap(), [5u8; 32]);

        assert!(parse_master_key("too-short").is_err());
    }
}
