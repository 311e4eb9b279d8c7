//! Coarse network policy.
//!
//! A connection is checked against, in order, the IP allowlist (when
//! enforced), port/protocol rules and the TLS policy. The first failing check
//! decides; every decision lands in a bounded audit log.

use std::collections::VecDeque;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use fleet_networking::{IpMatcher, NetworkError, PortRange, Protocol, TlsVersion};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::registry::TlsInfo;

/// Default number of retained audit entries.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

/// A port/protocol rule. The first rule covering a connection decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRule {
    pub protocol: Protocol,
    pub ports: PortRange,
    pub allow: bool,
}

impl PortRule {
    pub fn allow(protocol: Protocol, ports: PortRange) -> Self {
        Self {
            protocol,
            ports,
            allow: true,
        }
    }

    pub fn deny(protocol: Protocol, ports: PortRange) -> Self {
        Self {
            protocol,
            ports,
            allow: false,
        }
    }

    fn matches(&self, protocol: Protocol, port: u16) -> bool {
        self.protocol.covers(protocol) && self.ports.contains(port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsPolicy {
    pub required: bool,
    pub min_version: TlsVersion,
    pub require_verified_cert: bool,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            required: false,
            min_version: TlsVersion::Tls12,
            require_verified_cert: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkPolicyConfig {
    pub enforce_allowlist: bool,
    pub allowlist: Vec<IpMatcher>,
    pub port_rules: Vec<PortRule>,
    pub tls: TlsPolicy,
    pub audit_capacity: usize,
}

impl Default for NetworkPolicyConfig {
    fn default() -> Self {
        Self {
            enforce_allowlist: false,
            allowlist: Vec::new(),
            port_rules: Vec::new(),
            tls: TlsPolicy::default(),
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

/// Which check produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    IpAllowlist,
    PortRule,
    Tls,
    /// Every check passed.
    All,
}

/// A connection to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub address: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub tls: Option<TlsInfo>,
}

impl ConnectionRequest {
    pub fn tcp(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            protocol: Protocol::Tcp,
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: Option<TlsInfo>) -> Self {
        self.tls = tls;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyCheckResult {
    pub allowed: bool,
    pub policy_type: PolicyType,
    pub reason: Option<String>,
    pub address: IpAddr,
    pub port: u16,
    pub checked_at: DateTime<Utc>,
}

/// Evaluates connections against the configured policy.
pub struct NetworkPolicyManager {
    config: RwLock<NetworkPolicyConfig>,
    audit: Mutex<VecDeque<PolicyCheckResult>>,
}

impl NetworkPolicyManager {
    pub fn new(config: NetworkPolicyConfig) -> Self {
        Self {
            audit: Mutex::new(VecDeque::with_capacity(config.audit_capacity.min(1024))),
            config: RwLock::new(config),
        }
    }

    /// Full check: allowlist, port rules, then TLS.
    pub fn check(&self, request: &ConnectionRequest) -> PolicyCheckResult {
        let denial = {
            let config = self.config.read();
            Self::check_allowlist(&config, request)
                .or_else(|| Self::check_ports(&config, request))
                .or_else(|| Self::check_tls(&config.tls, request.tls))
        };
        self.record(request, denial)
    }

    /// Allowlist and port rules only, for inbound peers whose transport
    /// security is handled by the listener.
    pub fn check_peer(&self, address: IpAddr, port: u16) -> PolicyCheckResult {
        let request = ConnectionRequest::tcp(address, port);
        let denial = {
            let config = self.config.read();
            Self::check_allowlist(&config, &request).or_else(|| Self::check_ports(&config, &request))
        };
        self.record(&request, denial)
    }

    fn check_allowlist(
        config: &NetworkPolicyConfig,
        request: &ConnectionRequest,
    ) -> Option<(PolicyType, String)> {
        if !config.enforce_allowlist {
            return None;
        }
        let listed = config.allowlist.iter().any(|m| m.matches(request.address));
        (!listed).then(|| {
            (
                PolicyType::IpAllowlist,
                format!("{} is not in the allowlist", request.address),
            )
        })
    }

    fn check_ports(
        config: &NetworkPolicyConfig,
        request: &ConnectionRequest,
    ) -> Option<(PolicyType, String)> {
        let rule = config
            .port_rules
            .iter()
            .find(|r| r.matches(request.protocol, request.port))?;
        (!rule.allow).then(|| {
            (
                PolicyType::PortRule,
                format!("port {} denied by rule {:?}", request.port, rule.ports),
            )
        })
    }

    fn check_tls(policy: &TlsPolicy, tls: Option<TlsInfo>) -> Option<(PolicyType, String)> {
        match tls {
            None if policy.required => Some((PolicyType::Tls, "TLS required".to_string())),
            None => None,
            Some(info) if info.version < policy.min_version => Some((
                PolicyType::Tls,
                format!(
                    "{} is below minimum {}",
                    info.version, policy.min_version
                ),
            )),
            Some(info) if policy.require_verified_cert && !info.cert_verified => Some((
                PolicyType::Tls,
                "certificate not verified".to_string(),
            )),
            Some(_) => None,
        }
    }

    fn record(
        &self,
        request: &ConnectionRequest,
        denial: Option<(PolicyType, String)>,
    ) -> PolicyCheckResult {
        let result = match denial {
            Some((policy_type, reason)) => {
                warn!(
                    address = %request.address,
                    port = request.port,
                    policy = ?policy_type,
                    reason = %reason,
                    "Connection denied by network policy"
                );
                PolicyCheckResult {
                    allowed: false,
                    policy_type,
                    reason: Some(reason),
                    address: request.address,
                    port: request.port,
                    checked_at: Utc::now(),
                }
            }
            None => {
                debug!(address = %request.address, port = request.port, "Connection allowed");
                PolicyCheckResult {
                    allowed: true,
                    policy_type: PolicyType::All,
                    reason: None,
                    address: request.address,
                    port: request.port,
                    checked_at: Utc::now(),
                }
            }
        };

        let capacity = self.config.read().audit_capacity;
        let mut audit = self.audit.lock();
        audit.push_back(result.clone());
        while audit.len() > capacity {
            audit.pop_front();
        }
        result
    }

    /// Add an allowlist entry (exact IP or CIDR).
    pub fn allow_ip(&self, entry: &str) -> Result<(), NetworkError> {
        let matcher = IpMatcher::parse(entry)?;
        let mut config = self.config.write();
        if !config.allowlist.contains(&matcher) {
            config.allowlist.push(matcher);
            info!(entry, "Allowlist entry added");
        }
        Ok(())
    }

    /// Remove an allowlist entry. Returns whether it was present.
    pub fn revoke_ip(&self, entry: &str) -> Result<bool, NetworkError> {
        let matcher = IpMatcher::parse(entry)?;
        let mut config = self.config.write();
        let before = config.allowlist.len();
        config.allowlist.retain(|m| *m != matcher);
        let removed = config.allowlist.len() != before;
        if removed {
            info!(entry, "Allowlist entry removed");
        }
        Ok(removed)
    }

    pub fn set_enforce_allowlist(&self, enforce: bool) {
        self.config.write().enforce_allowlist = enforce;
    }

    pub fn set_port_rules(&self, rules: Vec<PortRule>) {
        self.config.write().port_rules = rules;
    }

    pub fn set_tls_policy(&self, tls: TlsPolicy) {
        self.config.write().tls = tls;
    }

    /// Up to `limit` most recent decisions, newest first.
    pub fn audit_log(&self, limit: usize) -> Vec<PolicyCheckResult> {
        self.audit.lock().iter().rev().take(limit).cloned().collect()
    }
}

impl std::fmt::Debug for NetworkPolicyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkPolicyManager")
            .field("config", &*self.config.read())
            .field("audit_entries", &self.audit.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_networking::parse_allowlist;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn enforced(allowlist: &str) -> NetworkPolicyManager {
        NetworkPolicyManager::new(NetworkPolicyConfig {
            enforce_allowlist: true,
            allowlist: parse_allowlist(allowlist).unwrap(),
            ..Default::default()
        })
    }

    #[test]
    fn test_allowlist_exact_and_cidr() {
        let policy = enforced("192.168.1.10, 10.0.0.0/8");

        assert!(policy.check(&ConnectionRequest::tcp(ip("192.168.1.10"), 443)).allowed);
        assert!(policy.check(&ConnectionRequest::tcp(ip("10.20.30.40"), 443)).allowed);

        let denied = policy.check(&ConnectionRequest::tcp(ip("192.168.1.11"), 443));
        assert!(!denied.allowed);
        assert_eq!(denied.policy_type, PolicyType::IpAllowlist);
    }

    #[test]
    fn test_allowlist_not_enforced() {
        let policy = NetworkPolicyManager::new(NetworkPolicyConfig::default());
        let result = policy.check(&ConnectionRequest::tcp(ip("203.0.113.9"), 22));
        assert!(result.allowed);
        assert_eq!(result.policy_type, PolicyType::All);
    }

    #[test]
    fn test_first_matching_port_rule_wins() {
        let policy = NetworkPolicyManager::new(NetworkPolicyConfig::default());
        policy.set_port_rules(vec![
            PortRule::allow(Protocol::Tcp, PortRange::single(8443)),
            PortRule::deny(Protocol::Any, PortRange::new(8000, 8999).unwrap()),
        ]);

        assert!(policy.check(&ConnectionRequest::tcp(ip("10.0.0.1"), 8443)).allowed);

        let denied = policy.check(&ConnectionRequest::tcp(ip("10.0.0.1"), 8080));
        assert!(!denied.allowed);
        assert_eq!(denied.policy_type, PolicyType::PortRule);

        // No rule covers 22: allowed.
        assert!(policy.check(&ConnectionRequest::tcp(ip("10.0.0.1"), 22)).allowed);
    }

    #[test]
    fn test_tls_policy() {
        let policy = NetworkPolicyManager::new(NetworkPolicyConfig {
            tls: TlsPolicy {
                required: true,
                min_version: TlsVersion::Tls12,
                require_verified_cert: true,
            },
            ..Default::default()
        });
        let base = ConnectionRequest::tcp(ip("10.0.0.1"), 443);

        let missing = policy.check(&base);
        assert_eq!(missing.policy_type, PolicyType::Tls);
        assert_eq!(missing.reason.as_deref(), Some("TLS required"));

        let old = policy.check(&base.with_tls(Some(TlsInfo {
            version: TlsVersion::Tls11,
            cert_verified: true,
        })));
        assert!(!old.allowed);

        let unverified = policy.check(&base.with_tls(Some(TlsInfo {
            version: TlsVersion::Tls13,
            cert_verified: false,
        })));
        assert_eq!(unverified.reason.as_deref(), Some("certificate not verified"));

        assert!(policy
            .check(&base.with_tls(Some(TlsInfo {
                version: TlsVersion::Tls12,
                cert_verified: true,
            })))
            .allowed);
    }

    #[test]
    fn test_allowlist_checked_before_ports() {
        let policy = enforced("10.0.0.0/8");
        policy.set_port_rules(vec![PortRule::deny(Protocol::Tcp, PortRange::single(22))]);

        let result = policy.check(&ConnectionRequest::tcp(ip("172.16.0.1"), 22));
        assert_eq!(result.policy_type, PolicyType::IpAllowlist);
    }

    #[test]
    fn test_check_peer_ignores_tls() {
        let policy = NetworkPolicyManager::new(NetworkPolicyConfig {
            tls: TlsPolicy {
                required: true,
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(policy.check_peer(ip("10.0.0.1"), 8080).allowed);
    }

    #[test]
    fn test_runtime_allowlist_changes() {
        let policy = enforced("");
        let addr = ip("10.1.2.3");
        assert!(!policy.check_peer(addr, 80).allowed);

        policy.allow_ip("10.1.2.0/24").unwrap();
        assert!(policy.check_peer(addr, 80).allowed);

        assert!(policy.revoke_ip("10.1.2.0/24").unwrap());
        assert!(!policy.revoke_ip("10.1.2.0/24").unwrap());
        assert!(!policy.check_peer(addr, 80).allowed);

        assert!(policy.allow_ip("not-an-ip").is_err());
    }

    #[test]
    fn test_audit_log_is_bounded_and_newest_first() {
        let policy = NetworkPolicyManager::new(NetworkPolicyConfig {
            audit_capacity: 3,
            ..Default::default()
        });
        for port in 1..=5 {
            policy.check_peer(ip("10.0.0.1"), port);
        }

        let log = policy.audit_log(10);
        let ports: Vec<u16> = log.iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![5, 4, 3]);
        assert_eq!(policy.audit_log(1).len(), 1);
    }
}
