//! HMAC-SHA256 signatures for webhook link events.
//!
//! The event transport is untrusted; only the detached signature proves a
//! payload came from the browser extension. Signing and verification both
//! operate on the literal payload bytes as delivered — callers must not
//! re-serialize before verifying.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Compute the base64-encoded HMAC-SHA256 signature over payload bytes.
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verify a detached base64 signature against the payload bytes.
///
/// Comparison is constant-time; undecodable signatures simply fail.
pub fn verify(payload: &[u8], signature_b64: &str, secret: &str) -> bool {
    let Ok(supplied) = BASE64.decode(signature_b64.trim()) else {
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    expected.as_slice().ct_eq(supplied.as_slice()).into()
}
