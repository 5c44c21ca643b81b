//! Encrypted secret storage facade.
//!
//! Wraps a single long-lived AES-256-GCM key and turns the raw session
//! credential (the captured cookie string) into an opaque blob for the
//! account store. The store never sees plaintext and this module never
//! persists anything itself.
//!
//! Blob layout: base64( nonce[12] ‖ ciphertext ). A fresh random nonce is
//! generated per encryption, so encrypting the same plaintext twice yields
//! different blobs.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL},
    Engine,
};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Prefix of the stand-in secret stored when a handshake only carried an
/// access token and no cookie. Accounts holding one of these cannot be
/// silently re-authenticated; the user must re-link.
const PLACEHOLDER_PREFIX: &str = "ACCESS_TOKEN_ONLY::";

/// Symmetric cipher over one process-wide key.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    /// Build a cipher from a urlsafe-base64 encoded 32-byte key.
    pub fn from_key(key_base64: &str) -> Result<Self> {
        let key_bytes = BASE64_URL
            .decode(key_base64)
            .context("Failed to decode base64 encryption key")?;

        if key_bytes.len() != KEY_SIZE {
            return Err(anyhow!(
                "Encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key_bytes.len()
            ));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

        Ok(Self { cipher })
    }

    /// Encrypt a secret into a single opaque base64 blob.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(blob))
    }

    /// Decrypt a blob produced by [`SecretBox::encrypt`].
    ///
    /// Fails on a wrong key, a truncated blob, or tampered ciphertext
    /// (authenticated encryption). Failure is terminal for the calling
    /// operation — the account needs a manual re-link — but never fatal
    /// to the process.
    pub fn decrypt(&self, blob: &str) -> Result<String> {
        let bytes = BASE64.decode(blob).context("Failed to decode secret blob")?;

        if bytes.len() < NONCE_SIZE {
            return Err(anyhow!(
                "Secret blob too short: {} bytes, need at least {}",
                bytes.len(),
                NONCE_SIZE
            ));
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

        String::from_utf8(plaintext).context("Decrypted secret is not valid UTF-8")
    }
}

/// Deterministic stand-in secret for access-token-only handshakes.
///
/// Keeps the non-null storage invariant while marking the account as
/// partially linked.
pub fn placeholder_secret(requester_id: i64) -> String {
    format!(
        "{}{}::{}",
        PLACEHOLDER_PREFIX,
        requester_id,
        chrono::Utc::now().timestamp()
    )
}

/// True if a decrypted secret is a placeholder rather than a usable cookie.
pub fn is_placeholder(secret: &str) -> bool {
    secret.starts_with(PLACEHOLDER_PREFIX)
}
