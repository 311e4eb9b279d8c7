//! Message integrity primitives for inter-node traffic.
//!
//! Every message exchanged between the control plane and its nodes is wrapped
//! in a [`SignedMessage`] envelope:
//!
//! ```text
//! {"payload": "...", "signature": "<hex>", "nonce": "<hex>", "timestamp": <epoch-ms>, "senderId": "node-1"}
//! ```
//!
//! The signature is `HMAC-SHA256(payload|nonce|timestamp|senderId)` under the
//! shared cluster secret. Verification rejects stale, future-dated, replayed
//! and tampered messages.
//!
//! Cluster tokens use the string format `<hex-id>.<hex-secret>`; helpers for
//! generating and splitting that format live here so both sides agree on it.

mod message;

pub use message::{SignatureError, SignedCommunication, SignedMessage, SigningConfig};

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Random bytes in a token id.
pub const TOKEN_ID_BYTES: usize = 8;

/// Random bytes in a token secret (256 bits of entropy).
pub const TOKEN_SECRET_BYTES: usize = 32;

/// Random bytes in a message nonce.
pub const NONCE_BYTES: usize = 16;

/// Token string format errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenFormatError {
    #[error("token must have the form <id>.<secret>")]
    MissingSeparator,

    #[error("token {part} is not lowercase hex")]
    NotHex { part: &'static str },
}

fn new_mac(key: &[u8]) -> HmacSha256 {
    match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    }
}

/// Compute `HMAC-SHA256(key, message)` as lowercase hex.
pub fn hmac_sha256_hex(key: &[u8], message: &[u8]) -> String {
    let mut mac = new_mac(key);
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a hex-encoded HMAC in constant time.
///
/// Malformed hex is treated as a mismatch.
pub fn verify_hmac_hex(key: &[u8], message: &[u8], expected_hex: &str) -> bool {
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };
    let mut mac = new_mac(key);
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

/// Generate `n` random bytes as lowercase hex.
pub fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::rng().fill(bytes.as_mut_slice());
    hex::encode(bytes)
}

/// Generate a fresh `(id, secret)` pair in hex.
pub fn generate_token_parts() -> (String, String) {
    (random_hex(TOKEN_ID_BYTES), random_hex(TOKEN_SECRET_BYTES))
}

/// Join an id and secret into the `<id>.<secret>` token string.
pub fn format_token(id: &str, secret: &str) -> String {
    format!("{}.{}", id, secret)
}

/// Split a `<id>.<secret>` token string.
pub fn parse_token(token: &str) -> Result<(&str, &str), TokenFormatError> {
    let Some((id, secret)) = token.split_once('.') else {
        return Err(TokenFormatError::MissingSeparator);
    };
    if id.is_empty() || !is_lower_hex(id) {
        return Err(TokenFormatError::NotHex { part: "id" });
    }
    if secret.is_empty() || !is_lower_hex(secret) {
        return Err(TokenFormatError::NotHex { part: "secret" });
    }
    Ok((id, secret))
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
