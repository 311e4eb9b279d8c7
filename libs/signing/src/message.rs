//! Signed message envelope and replay-protected verification.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{hmac_sha256_hex, random_hex, verify_hmac_hex, NONCE_BYTES};

/// Default maximum age of an accepted message.
pub const DEFAULT_MAX_MESSAGE_AGE: Duration = Duration::from_secs(5 * 60);

/// Maximum tolerated clock skew for future-dated messages.
pub const DEFAULT_MAX_FUTURE_SKEW: Duration = Duration::from_secs(30);

/// Signature verification errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("message is {age_ms}ms old (max {max_ms}ms)")]
    Expired { age_ms: i64, max_ms: i64 },

    #[error("message timestamp is {ahead_ms}ms in the future")]
    FutureTimestamp { ahead_ms: i64 },

    #[error("nonce {0} has already been used")]
    Replay(String),

    #[error("signature mismatch")]
    InvalidSignature,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("signing secret must not be empty")]
    EmptySecret,
}

/// Wire envelope for a signed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedMessage {
    pub payload: String,
    /// Hex HMAC-SHA256 over `payload|nonce|timestamp|senderId`.
    pub signature: String,
    /// Hex single-use nonce.
    pub nonce: String,
    /// Epoch milliseconds at signing time.
    pub timestamp: i64,
    pub sender_id: String,
}

impl SignedMessage {
    pub fn to_json(&self) -> Result<String, SignatureError> {
        serde_json::to_string(self).map_err(|e| SignatureError::Malformed(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, SignatureError> {
        serde_json::from_str(json).map_err(|e| SignatureError::Malformed(e.to_string()))
    }

    fn signing_input(payload: &str, nonce: &str, timestamp: i64, sender_id: &str) -> String {
        format!("{}|{}|{}|{}", payload, nonce, timestamp, sender_id)
    }
}

/// Verification limits.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    /// Messages older than this are rejected; nonces are remembered this long.
    pub max_message_age: Duration,

    /// Messages timestamped further ahead than this are rejected.
    pub max_future_skew: Duration,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            max_message_age: DEFAULT_MAX_MESSAGE_AGE,
            max_future_skew: DEFAULT_MAX_FUTURE_SKEW,
        }
    }
}

/// Signs and verifies [`SignedMessage`]s under a shared secret.
///
/// Accepted nonces are kept until they age out of the max-message-age
/// window, so a replayed message is rejected for as long as it would
/// otherwise still be fresh.
pub struct SignedCommunication {
    secret: Vec<u8>,
    config: SigningConfig,
    /// nonce -> message timestamp (epoch ms)
    seen_nonces: Mutex<HashMap<String, i64>>,
}

impl SignedCommunication {
    pub fn new(secret: impl AsRef<[u8]>, config: SigningConfig) -> Result<Self, SignatureError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(SignatureError::EmptySecret);
        }
        Ok(Self {
            secret: secret.to_vec(),
            config,
            seen_nonces: Mutex::new(HashMap::new()),
        })
    }

    /// Sign a payload on behalf of `sender_id`.
    pub fn sign(&self, payload: impl Into<String>, sender_id: impl Into<String>) -> SignedMessage {
        self.sign_at(payload, sender_id, Utc::now().timestamp_millis())
    }

    pub fn sign_at(
        &self,
        payload: impl Into<String>,
        sender_id: impl Into<String>,
        now_ms: i64,
    ) -> SignedMessage {
        let payload = payload.into();
        let sender_id = sender_id.into();
        let nonce = random_hex(NONCE_BYTES);
        let input = SignedMessage::signing_input(&payload, &nonce, now_ms, &sender_id);
        let signature = hmac_sha256_hex(&self.secret, input.as_bytes());

        SignedMessage {
            payload,
            signature,
            nonce,
            timestamp: now_ms,
            sender_id,
        }
    }

    /// Verify a message and return its payload.
    ///
    /// On success the nonce is recorded so the same message cannot be
    /// accepted twice.
    pub fn verify(&self, message: &SignedMessage) -> Result<String, SignatureError> {
        self.verify_at(message, Utc::now().timestamp_millis())
    }

    pub fn verify_at(&self, message: &SignedMessage, now_ms: i64) -> Result<String, SignatureError> {
        let max_age_ms = self.config.max_message_age.as_millis() as i64;
        let max_skew_ms = self.config.max_future_skew.as_millis() as i64;

        // The timestamp is sender controlled; saturate instead of overflowing.
        let age_ms = now_ms.saturating_sub(message.timestamp);
        if age_ms > max_age_ms {
            return Err(SignatureError::Expired {
                age_ms,
                max_ms: max_age_ms,
            });
        }
        let ahead_ms = message.timestamp.saturating_sub(now_ms);
        if ahead_ms > max_skew_ms {
            return Err(SignatureError::FutureTimestamp { ahead_ms });
        }

        // Hold the lock across check and insert so two concurrent verifications
        // of the same message cannot both succeed.
        let mut seen = self.seen_nonces.lock();
        if seen.contains_key(&message.nonce) {
            debug!(sender_id = %message.sender_id, nonce = %message.nonce, "Rejected replayed message");
            return Err(SignatureError::Replay(message.nonce.clone()));
        }

        let input = SignedMessage::signing_input(
            &message.payload,
            &message.nonce,
            message.timestamp,
            &message.sender_id,
        );
        if !verify_hmac_hex(&self.secret, input.as_bytes(), &message.signature) {
            return Err(SignatureError::InvalidSignature);
        }

        seen.insert(message.nonce.clone(), message.timestamp);
        Ok(message.payload.clone())
    }

    /// Forget nonces older than the max-message-age window.
    ///
    /// Returns the number of nonces removed.
    pub fn prune_nonces(&self) -> usize {
        self.prune_nonces_at(Utc::now().timestamp_millis())
    }

    pub fn prune_nonces_at(&self, now_ms: i64) -> usize {
        let max_age_ms = self.config.max_message_age.as_millis() as i64;
        let mut seen = self.seen_nonces.lock();
        let before = seen.len();
        seen.retain(|_, ts| now_ms - *ts <= max_age_ms);
        before - seen.len()
    }

    pub fn seen_nonce_count(&self) -> usize {
        self.seen_nonces.lock().len()
    }

    pub fn config(&self) -> &SigningConfig {
        &self.config
    }
}

impl std::fmt::Debug for SignedCommunication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedCommunication")
            .field("config", &self.config)
            .field("seen_nonces", &self.seen_nonce_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn comms() -> SignedCommunication {
        SignedCommunication::new("cluster-secret", SigningConfig::default()).unwrap()
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let comms = comms();
        let msg = comms.sign_at("{\"hello\":1}", "node-1", NOW);

        assert_eq!(msg.sender_id, "node-1");
        assert_eq!(msg.nonce.len(), NONCE_BYTES * 2);
        assert_eq!(comms.verify_at(&msg, NOW + 10).unwrap(), "{\"hello\":1}");
    }

    #[test]
    fn test_replay_rejected() {
        let comms = comms();
        let msg = comms.sign_at("payload", "node-1", NOW);

        assert!(comms.verify_at(&msg, NOW).is_ok());
        assert_eq!(
            comms.verify_at(&msg, NOW).unwrap_err(),
            SignatureError::Replay(msg.nonce.clone())
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let comms = comms();
        let mut msg = comms.sign_at("payload", "node-1", NOW);
        msg.payload = "payload!".into();

        assert_eq!(
            comms.verify_at(&msg, NOW).unwrap_err(),
            SignatureError::InvalidSignature
        );
    }

    #[test]
    fn test_tampered_sender_rejected() {
        let comms = comms();
        let mut msg = comms.sign_at("payload", "node-1", NOW);
        msg.sender_id = "node-2".into();

        assert_eq!(
            comms.verify_at(&msg, NOW).unwrap_err(),
            SignatureError::InvalidSignature
        );
    }

    #[test]
    fn test_failed_verification_does_not_burn_nonce() {
        let comms = comms();
        let msg = comms.sign_at("payload", "node-1", NOW);
        let mut forged = msg.clone();
        forged.signature = "00".repeat(32);

        assert!(comms.verify_at(&forged, NOW).is_err());
        assert!(comms.verify_at(&msg, NOW).is_ok());
    }

    #[test]
    fn test_stale_message_rejected() {
        let comms = comms();
        let msg = comms.sign_at("payload", "node-1", NOW);
        let later = NOW + DEFAULT_MAX_MESSAGE_AGE.as_millis() as i64 + 1;

        assert!(matches!(
            comms.verify_at(&msg, later),
            Err(SignatureError::Expired { .. })
        ));
    }

    #[test]
    fn test_future_message_rejected() {
        let comms = comms();
        let msg = comms.sign_at("payload", "node-1", NOW + 31_000);

        assert_eq!(
            comms.verify_at(&msg, NOW).unwrap_err(),
            SignatureError::FutureTimestamp { ahead_ms: 31_000 }
        );

        let within_skew = comms.sign_at("payload", "node-1", NOW + 29_000);
        assert!(comms.verify_at(&within_skew, NOW).is_ok());
    }

    #[test]
    fn test_extreme_timestamps_rejected_without_overflow() {
        let comms = comms();

        let ancient = comms.sign_at("payload", "node-1", i64::MIN);
        assert!(matches!(
            comms.verify_at(&ancient, NOW),
            Err(SignatureError::Expired { age_ms: i64::MAX, .. })
        ));

        let distant = comms.sign_at("payload", "node-1", i64::MAX);
        assert!(matches!(
            comms.verify_at(&distant, NOW),
            Err(SignatureError::FutureTimestamp { .. })
        ));
    }

    #[test]
    fn test_different_secret_rejected() {
        let msg = comms().sign_at("payload", "node-1", NOW);
        let other = SignedCommunication::new("other-secret", SigningConfig::default()).unwrap();

        assert_eq!(
            other.verify_at(&msg, NOW).unwrap_err(),
            SignatureError::InvalidSignature
        );
    }

    #[test]
    fn test_prune_nonces() {
        let comms = comms();
        let old = comms.sign_at("a", "node-1", NOW);
        let fresh = comms.sign_at("b", "node-1", NOW + 200_000);
        comms.verify_at(&old, NOW).unwrap();
        comms.verify_at(&fresh, NOW + 200_000).unwrap();
        assert_eq!(comms.seen_nonce_count(), 2);

        let removed = comms.prune_nonces_at(NOW + DEFAULT_MAX_MESSAGE_AGE.as_millis() as i64 + 1);
        assert_eq!(removed, 1);
        assert_eq!(comms.seen_nonce_count(), 1);
    }

    #[test]
    fn test_wire_format() {
        let msg = comms().sign_at("p", "node-1", NOW);
        let json = msg.to_json().unwrap();

        assert!(json.contains("\"senderId\":\"node-1\""));
        assert!(json.contains(&format!("\"timestamp\":{}", NOW)));
        assert_eq!(SignedMessage::from_json(&json).unwrap(), msg);
        assert!(matches!(
            SignedMessage::from_json("{}"),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert_eq!(
            SignedCommunication::new("", SigningConfig::default()).unwrap_err(),
            SignatureError::EmptySecret
        );
    }
}
