//! Cluster tokens.
//!
//! Tokens are handed out as `<hex-id>.<hex-secret>`. Only an HMAC-SHA256 of
//! the secret is kept; the plaintext exists once, in the [`IssuedToken`]
//! returned at creation.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_signing::{
    format_token, generate_token_parts, hmac_sha256_hex, parse_token, verify_hmac_hex,
    TokenFormatError,
};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ConfigError;

/// Well-known scopes.
pub mod scopes {
    /// Node to control plane heartbeats.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Control plane to node job assignment.
    pub const DISPATCH: &str = "dispatch";
    /// Satisfies any scope requirement.
    pub const ADMIN: &str = "admin";
}

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Token validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(#[from] TokenFormatError),

    #[error("unknown token")]
    UnknownToken,

    #[error("token revoked")]
    Revoked,

    #[error("token expired")]
    Expired,

    #[error("token secret mismatch")]
    InvalidSecret,

    #[error("token lacks scope {required}")]
    InsufficientScope { required: String },
}

/// Stored token record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterToken {
    pub id: String,
    /// Hex HMAC of the secret.
    #[serde(skip)]
    pub token_hash: String,
    pub node_id: Option<String>,
    pub scopes: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ClusterToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn has_scope(&self, required: &str) -> bool {
        self.scopes.contains(scopes::ADMIN) || self.scopes.contains(required)
    }
}

/// A freshly minted token. `plaintext` is not recoverable later.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: ClusterToken,
    pub plaintext: String,
}

/// Result of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedToken {
    pub token_id: String,
    pub node_id: Option<String>,
    pub scopes: BTreeSet<String>,
}

/// Issues, validates, rotates and revokes cluster tokens.
pub struct TokenAuthManager {
    key: Vec<u8>,
    default_ttl: Duration,
    tokens: RwLock<HashMap<String, ClusterToken>>,
}

impl TokenAuthManager {
    pub fn new(key: impl AsRef<[u8]>, default_ttl: Duration) -> Result<Self, ConfigError> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(ConfigError::new("tokens", "hash key must not be empty"));
        }
        Ok(Self {
            key: key.to_vec(),
            default_ttl,
            tokens: RwLock::new(HashMap::new()),
        })
    }

    pub fn generate_token<I, S>(
        &self,
        node_id: Option<&str>,
        scopes: I,
        ttl: Option<Duration>,
    ) -> IssuedToken
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.generate_token_at(node_id, scopes, ttl, Utc::now())
    }

    pub fn generate_token_at<I, S>(
        &self,
        node_id: Option<&str>,
        scopes: I,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> IssuedToken
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let (id, secret) = generate_token_parts();

        let token = ClusterToken {
            id: id.clone(),
            token_hash: hmac_sha256_hex(&self.key, secret.as_bytes()),
            node_id: node_id.map(str::to_string),
            scopes: scopes.into_iter().map(Into::into).collect(),
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            revoked: false,
            revoked_at: None,
        };

        info!(token_id = %id, node_id = ?token.node_id, "Token issued");
        self.tokens.write().insert(id.clone(), token.clone());

        IssuedToken {
            token,
            plaintext: format_token(&id, &secret),
        }
    }

    pub fn validate(
        &self,
        token: &str,
        required_scope: Option<&str>,
    ) -> Result<ValidatedToken, TokenError> {
        self.validate_at(token, required_scope, Utc::now())
    }

    /// Check a presented token string.
    ///
    /// Rejects, in order: unknown id, revoked, expired, secret mismatch,
    /// missing scope.
    pub fn validate_at(
        &self,
        token: &str,
        required_scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ValidatedToken, TokenError> {
        let (id, secret) = parse_token(token)?;

        let tokens = self.tokens.read();
        let stored = tokens.get(id).ok_or(TokenError::UnknownToken)?;

        if stored.revoked {
            return Err(TokenError::Revoked);
        }
        if stored.is_expired_at(now) {
            return Err(TokenError::Expired);
        }
        if !verify_hmac_hex(&self.key, secret.as_bytes(), &stored.token_hash) {
            debug!(token_id = %id, "Token secret mismatch");
            return Err(TokenError::InvalidSecret);
        }
        if let Some(required) = required_scope {
            if !stored.has_scope(required) {
                return Err(TokenError::InsufficientScope {
                    required: required.to_string(),
                });
            }
        }

        Ok(ValidatedToken {
            token_id: stored.id.clone(),
            node_id: stored.node_id.clone(),
            scopes: stored.scopes.clone(),
        })
    }

    pub fn rotate(&self, token_id: &str) -> Result<IssuedToken, TokenError> {
        self.rotate_at(token_id, Utc::now())
    }

    /// Replace a live token with a new one carrying the same node, scopes and
    /// remaining lifetime. The old token is revoked.
    pub fn rotate_at(&self, token_id: &str, now: DateTime<Utc>) -> Result<IssuedToken, TokenError> {
        let (node_id, scopes, remaining) = {
            let mut tokens = self.tokens.write();
            let old = tokens.get_mut(token_id).ok_or(TokenError::UnknownToken)?;
            if old.revoked {
                return Err(TokenError::Revoked);
            }
            if old.is_expired_at(now) {
                return Err(TokenError::Expired);
            }

            old.revoked = true;
            old.revoked_at = Some(now);
            let remaining = (old.expires_at - now).to_std().unwrap_or_default();
            (old.node_id.clone(), old.scopes.clone(), remaining)
        };

        let issued = self.generate_token_at(node_id.as_deref(), scopes, Some(remaining), now);
        info!(old_token_id = %token_id, new_token_id = %issued.token.id, "Token rotated");
        Ok(issued)
    }

    pub fn revoke(&self, token_id: &str) -> bool {
        let mut tokens = self.tokens.write();
        match tokens.get_mut(token_id) {
            Some(token) if !token.revoked => {
                token.revoked = true;
                token.revoked_at = Some(Utc::now());
                info!(token_id = %token_id, "Token revoked");
                true
            }
            _ => false,
        }
    }

    /// All tokens, oldest first.
    pub fn list_tokens(&self) -> Vec<ClusterToken> {
        let mut tokens: Vec<ClusterToken> = self.tokens.read().values().cloned().collect();
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tokens
    }

    pub fn purge_expired(&self, retention: Duration) -> usize {
        self.purge_expired_at(retention, Utc::now())
    }

    /// Drop tokens that have been expired or revoked for longer than
    /// `retention`.
    pub fn purge_expired_at(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let mut tokens = self.tokens.write();
        let before = tokens.len();
        tokens.retain(|_, t| {
            let dead_since = match (t.revoked_at, t.is_expired_at(now)) {
                (Some(revoked_at), true) => Some(revoked_at.min(t.expires_at)),
                (Some(revoked_at), false) => Some(revoked_at),
                (None, true) => Some(t.expires_at),
                (None, false) => None,
            };
            dead_since.map_or(true, |since| now - since <= retention)
        });
        before - tokens.len()
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

impl std::fmt::Debug for TokenAuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthManager")
            .field("tokens", &self.len())
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TokenAuthManager {
        TokenAuthManager::new("token-hash-key", DEFAULT_TOKEN_TTL).unwrap()
    }

    fn flip_last_char(token: &str) -> String {
        let mut chars: Vec<char> = token.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '0' { '1' } else { '0' };
        chars.into_iter().collect()
    }

    #[test]
    fn test_generate_and_validate() {
        let tokens = manager();
        let issued = tokens.generate_token(Some("node-1"), [scopes::HEARTBEAT], None);

        let validated = tokens
            .validate(&issued.plaintext, Some(scopes::HEARTBEAT))
            .unwrap();
        assert_eq!(validated.node_id.as_deref(), Some("node-1"));
        assert_eq!(validated.token_id, issued.token.id);

        // The plaintext secret is not what is stored.
        let secret = issued.plaintext.split('.').nth(1).unwrap();
        assert_ne!(tokens.list_tokens()[0].token_hash, secret);
    }

    #[test]
    fn test_flipped_secret_fails() {
        let tokens = manager();
        let issued = tokens.generate_token(None, [scopes::HEARTBEAT], None);

        assert_eq!(
            tokens
                .validate(&flip_last_char(&issued.plaintext), None)
                .unwrap_err(),
            TokenError::InvalidSecret
        );
    }

    #[test]
    fn test_expired_token_fails() {
        let tokens = manager();
        let now = Utc::now();
        let issued =
            tokens.generate_token_at(None, [scopes::HEARTBEAT], Some(Duration::from_secs(60)), now);

        assert!(tokens
            .validate_at(&issued.plaintext, None, now + chrono::Duration::seconds(59))
            .is_ok());
        assert_eq!(
            tokens
                .validate_at(&issued.plaintext, None, now + chrono::Duration::seconds(60))
                .unwrap_err(),
            TokenError::Expired
        );
    }

    #[test]
    fn test_unknown_and_malformed() {
        let tokens = manager();
        assert_eq!(
            tokens.validate("abcd.ef01", None).unwrap_err(),
            TokenError::UnknownToken
        );
        assert!(matches!(
            tokens.validate("no-separator", None).unwrap_err(),
            TokenError::Malformed(_)
        ));
    }

    #[test]
    fn test_scope_enforcement() {
        let tokens = manager();
        let heartbeat = tokens.generate_token(Some("node-1"), [scopes::HEARTBEAT], None);
        let admin = tokens.generate_token(None, [scopes::ADMIN], None);

        assert_eq!(
            tokens
                .validate(&heartbeat.plaintext, Some(scopes::DISPATCH))
                .unwrap_err(),
            TokenError::InsufficientScope {
                required: scopes::DISPATCH.into()
            }
        );
        assert!(tokens
            .validate(&admin.plaintext, Some(scopes::DISPATCH))
            .is_ok());
    }

    #[test]
    fn test_revoke() {
        let tokens = manager();
        let issued = tokens.generate_token(None, [scopes::HEARTBEAT], None);

        assert!(tokens.revoke(&issued.token.id));
        assert!(!tokens.revoke(&issued.token.id));
        assert_eq!(
            tokens.validate(&issued.plaintext, None).unwrap_err(),
            TokenError::Revoked
        );
    }

    #[test]
    fn test_rotate_preserves_remaining_ttl_and_scopes() {
        let tokens = manager();
        let t0 = Utc::now();
        let old = tokens.generate_token_at(
            Some("node-1"),
            [scopes::HEARTBEAT, scopes::DISPATCH],
            Some(Duration::from_secs(3600)),
            t0,
        );

        let later = t0 + chrono::Duration::seconds(600);
        let new = tokens.rotate_at(&old.token.id, later).unwrap();

        assert_eq!(new.token.expires_at, old.token.expires_at);
        assert_eq!(new.token.scopes, old.token.scopes);
        assert_eq!(new.token.node_id.as_deref(), Some("node-1"));
        assert_eq!(
            tokens.validate_at(&old.plaintext, None, later).unwrap_err(),
            TokenError::Revoked
        );
        assert!(tokens.validate_at(&new.plaintext, None, later).is_ok());

        assert_eq!(
            tokens.rotate_at(&old.token.id, later).unwrap_err(),
            TokenError::Revoked
        );
    }

    #[test]
    fn test_purge_expired_respects_retention() {
        let tokens = manager();
        let t0 = Utc::now();
        tokens.generate_token_at(None, ["a"], Some(Duration::from_secs(10)), t0);
        tokens.generate_token_at(None, ["b"], Some(Duration::from_secs(3600)), t0);

        let retention = Duration::from_secs(60);
        assert_eq!(
            tokens.purge_expired_at(retention, t0 + chrono::Duration::seconds(30)),
            0
        );
        assert_eq!(
            tokens.purge_expired_at(retention, t0 + chrono::Duration::seconds(71)),
            1
        );
        assert_eq!(tokens.len(), 1);
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(TokenAuthManager::new("", DEFAULT_TOKEN_TTL).is_err());
    }
}
