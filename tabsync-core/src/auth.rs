//! Freshness-bound authentication tokens.
//!
//! Every session opens with a token minted from two pre-shared values: a
//! secret key and an authentication phrase. The token is an
//! XChaCha20-Poly1305 ciphertext of `issued_at_ms (u64 BE) || phrase` under a
//! key derived from the secret via HKDF-SHA256, encoded as URL-safe base64 of
//! `nonce || ciphertext`.
//!
//! A responder accepts a token only if it decrypts, carries the expected
//! phrase, and was issued within `ttl` of the responder's clock.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Environment variable holding the shared secret key.
pub const SECRET_KEY_ENV: &str = "TABSYNC_SECRET_KEY";

/// Environment variable holding the shared authentication phrase.
pub const AUTH_PHRASE_ENV: &str = "TABSYNC_AUTH_PHRASE";

/// Default maximum token age.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(5);

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

const TIMESTAMP_SIZE: usize = 8;
const TAG_SIZE: usize = 16;

/// Authentication errors. Fatal to the session.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A credential environment variable is unset or empty.
    #[error("missing credential: {0} is not set")]
    MissingEnv(&'static str),

    /// Token is not valid base64 or is too short.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// Token failed authenticated decryption.
    #[error("token decryption failed")]
    Decryption,

    /// Token decrypted but carries a different phrase.
    #[error("authentication phrase mismatch")]
    PhraseMismatch,

    /// Token is older than the allowed age.
    #[error("token expired: age {age:?} exceeds {ttl:?}")]
    Expired {
        /// Age of the token.
        age: Duration,
        /// Maximum allowed age.
        ttl: Duration,
    },

    /// Token was issued further in the future than clock skew allows.
    #[error("token issued {ahead:?} in the future")]
    FromFuture {
        /// How far ahead of the local clock.
        ahead: Duration,
    },

    /// Token could not be minted.
    #[error("token creation failed: {0}")]
    Mint(String),
}

/// Shared secret material for minting and checking tokens.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    key: [u8; KEY_SIZE],
    phrase: String,
}

impl Credentials {
    /// Derive credentials from the shared secret key and phrase.
    pub fn new(secret_key: &str, phrase: &str) -> Result<Self, AuthError> {
        if secret_key.is_empty() {
            return Err(AuthError::MissingEnv(SECRET_KEY_ENV));
        }
        if phrase.is_empty() {
            return Err(AuthError::MissingEnv(AUTH_PHRASE_ENV));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(b"tabsync-auth-token-v1"), secret_key.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(b"token", &mut key)
            .map_err(|e| AuthError::Mint(e.to_string()))?;

        Ok(Self {
            key,
            phrase: phrase.to_string(),
        })
    }

    /// Read credentials from `TABSYNC_SECRET_KEY` and `TABSYNC_AUTH_PHRASE`.
    pub fn from_env() -> Result<Self, AuthError> {
        let secret =
            std::env::var(SECRET_KEY_ENV).map_err(|_| AuthError::MissingEnv(SECRET_KEY_ENV))?;
        let phrase =
            std::env::var(AUTH_PHRASE_ENV).map_err(|_| AuthError::MissingEnv(AUTH_PHRASE_ENV))?;
        Self::new(&secret, &phrase)
    }

    /// Mint a token stamped with the current time.
    pub fn issue_token(&self) -> Result<String, AuthError> {
        self.issue_token_at(unix_millis())
    }

    /// Mint a token stamped with an explicit issue time.
    pub fn issue_token_at(&self, issued_at_ms: u64) -> Result<String, AuthError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes).map_err(|e| AuthError::Mint(e.to_string()))?;

        let mut plaintext = Vec::with_capacity(TIMESTAMP_SIZE + self.phrase.len());
        plaintext.extend_from_slice(&issued_at_ms.to_be_bytes());
        plaintext.extend_from_slice(self.phrase.as_bytes());

        let ciphertext = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| AuthError::Mint("aead encrypt failed".into()))?;
        plaintext.zeroize();

        let mut token = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    /// Check a token against the current time.
    pub fn validate(&self, token: &str, ttl: Duration) -> Result<(), AuthError> {
        self.validate_at(token, ttl, unix_millis())
    }

    /// Check a token against an explicit current time.
    pub fn validate_at(&self, token: &str, ttl: Duration, now_ms: u64) -> Result<(), AuthError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        if raw.len() < NONCE_SIZE + TAG_SIZE + TIMESTAMP_SIZE {
            return Err(AuthError::Malformed(format!("{} bytes is too short", raw.len())));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        let mut plaintext = self
            .cipher()
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| AuthError::Decryption)?;

        let (stamp, phrase) = plaintext.split_at(TIMESTAMP_SIZE);
        let phrase_matches = phrase == self.phrase.as_bytes();
        let mut stamp_bytes = [0u8; TIMESTAMP_SIZE];
        stamp_bytes.copy_from_slice(stamp);
        plaintext.zeroize();

        if !phrase_matches {
            return Err(AuthError::PhraseMismatch);
        }

        let issued_at_ms = u64::from_be_bytes(stamp_bytes);
        if issued_at_ms > now_ms {
            let ahead = Duration::from_millis(issued_at_ms - now_ms);
            if ahead > ttl {
                return Err(AuthError::FromFuture { ahead });
            }
            return Ok(());
        }
        let age = Duration::from_millis(now_ms - issued_at_ms);
        if age > ttl {
            return Err(AuthError::Expired { age, ttl });
        }
        Ok(())
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key))
    }
}

// Don't leak secrets in debug output
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials {{ key: [REDACTED], phrase: [REDACTED] }}")
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
