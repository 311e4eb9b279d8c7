//! Networking utilities for the fleet.
//!
//! This library provides helpers for:
//! - CIDR prefixes over both IPv4 and IPv6
//! - IP allowlist entries (exact address or prefix)
//! - Transport protocols and port ranges
//! - TLS protocol version ordering

use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid port range.
    #[error("invalid port range: {0}")]
    InvalidPortRange(String),

    /// Unknown protocol name.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Unknown TLS version.
    #[error("unknown TLS version: {0}")]
    UnknownTlsVersion(String),
}

// ============================================================================
// CIDR Prefixes
// ============================================================================

/// IP prefix in CIDR notation (e.g. `10.0.0.0/8`, `fd00::/8`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    /// Base address of the prefix, masked to `prefix_len`.
    address: IpAddr,

    /// Prefix length (e.g., 24 for /24).
    prefix_len: u8,
}

impl IpPrefix {
    /// Create a new prefix, masking host bits off the address.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max = max_prefix_len(&address);
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }

        Ok(Self {
            address: mask(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "192.168.0.0/16").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = IpAddr::from_str(addr_str.trim())
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .trim()
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    ///
    /// Addresses of the other family never match. IPv4-mapped IPv6
    /// addresses are compared as IPv4.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = canonical(addr);
        if addr.is_ipv4() != self.address.is_ipv4() {
            return false;
        }
        mask(addr, self.prefix_len) == self.address
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

impl std::fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

fn max_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Treat IPv4-mapped IPv6 peers (`::ffff:a.b.c.d`) as plain IPv4.
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Mask an address to a prefix length.
fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from_be_bytes(v4.octets());
            let mask = if prefix_len == 0 {
                0
            } else if prefix_len >= 32 {
                u32::MAX
            } else {
                u32::MAX << (32 - prefix_len)
            };
            IpAddr::from((bits & mask).to_be_bytes())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from_be_bytes(v6.octets());
            let mask = if prefix_len == 0 {
                0
            } else if prefix_len >= 128 {
                u128::MAX
            } else {
                u128::MAX << (128 - prefix_len)
            };
            IpAddr::from((bits & mask).to_be_bytes())
        }
    }
}

// ============================================================================
// Allowlist Entries
// ============================================================================

/// A single allowlist entry: an exact address or a CIDR prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpMatcher {
    Exact(IpAddr),
    Prefix(IpPrefix),
}

impl IpMatcher {
    /// Parse `"10.1.2.3"` as an exact match or `"10.0.0.0/8"` as a prefix.
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        if s.contains('/') {
            return IpPrefix::from_cidr(s).map(IpMatcher::Prefix);
        }
        IpAddr::from_str(s)
            .map(|addr| IpMatcher::Exact(canonical(addr)))
            .map_err(|_| NetworkError::InvalidAddress(s.to_string()))
    }

    pub fn matches(&self, addr: IpAddr) -> bool {
        match self {
            IpMatcher::Exact(expected) => canonical(addr) == *expected,
            IpMatcher::Prefix(prefix) => prefix.contains(addr),
        }
    }
}

impl std::fmt::Display for IpMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpMatcher::Exact(addr) => write!(f, "{}", addr),
            IpMatcher::Prefix(prefix) => write!(f, "{}", prefix),
        }
    }
}

/// Parse a comma-separated allowlist (`"10.0.0.1, 192.168.0.0/16"`).
pub fn parse_allowlist(s: &str) -> Result<Vec<IpMatcher>, NetworkError> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(IpMatcher::parse)
        .collect()
}

// ============================================================================
// Protocols and Ports
// ============================================================================

/// Transport protocol of a connection or rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    /// Rule wildcard; a connection is never `Any`.
    Any,
}

impl Protocol {
    /// Whether a rule with this protocol applies to a connection protocol.
    pub fn covers(&self, other: Protocol) -> bool {
        *self == Protocol::Any || *self == other
    }
}

impl FromStr for Protocol {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "any" | "*" => Ok(Protocol::Any),
            other => Err(NetworkError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, NetworkError> {
        if start > end {
            return Err(NetworkError::InvalidPortRange(format!("{}-{}", start, end)));
        }
        Ok(Self { start, end })
    }

    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl FromStr for PortRange {
    type Err = NetworkError;

    /// Parse `"443"` or `"8000-8999"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| NetworkError::InvalidPortRange(s.to_string()))
        };
        match s.split_once('-') {
            Some((start, end)) => Self::new(parse(start)?, parse(end)?),
            None => Ok(Self::single(parse(s)?)),
        }
    }
}

// ============================================================================
// TLS Versions
// ============================================================================

/// TLS protocol version, ordered oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "TLSv1.0")]
    Tls10,
    #[serde(rename = "TLSv1.1")]
    Tls11,
    #[serde(rename = "TLSv1.2")]
    Tls12,
    #[serde(rename = "TLSv1.3")]
    Tls13,
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TlsVersion {
    type Err = NetworkError;

    /// Accepts `"TLSv1.2"`, `"tls1.2"` or `"1.2"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let version = lowered
            .trim_start_matches("tlsv")
            .trim_start_matches("tls");
        match version {
            "1.0" | "1" => Ok(TlsVersion::Tls10),
            "1.1" => Ok(TlsVersion::Tls11),
            "1.2" => Ok(TlsVersion::Tls12),
            "1.3" => Ok(TlsVersion::Tls13),
            _ => Err(NetworkError::UnknownTlsVersion(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_ipv4_prefix() {
        let prefix = IpPrefix::from_cidr("10.1.2.3/8").unwrap();
        assert_eq!(prefix.to_string(), "10.0.0.0/8");
        assert!(prefix.contains("10.200.0.1".parse().unwrap()));
        assert!(!prefix.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_prefix() {
        let prefix = IpPrefix::from_cidr("fd00:1234::/32").unwrap();
        assert!(prefix.contains("fd00:1234::1".parse().unwrap()));
        assert!(!prefix.contains("fd00:1235::1".parse().unwrap()));
        assert!(!prefix.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_prefix() {
        assert!(IpPrefix::from_cidr("10.0.0.0/33").is_err());
        assert!(IpPrefix::from_cidr("10.0.0.0").is_err());
        assert!(IpPrefix::from_cidr("nope/8").is_err());
    }

    #[test]
    fn test_zero_prefix_matches_family() {
        let any_v4 = IpPrefix::from_cidr("0.0.0.0/0").unwrap();
        assert!(any_v4.contains("203.0.113.9".parse().unwrap()));
        assert!(!any_v4.contains("::1".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_peer_matches_v4_rules() {
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 5).to_ipv6_mapped());

        assert!(IpMatcher::parse("10.0.0.0/24").unwrap().matches(mapped));
        assert!(IpMatcher::parse("10.0.0.5").unwrap().matches(mapped));
    }

    #[test]
    fn test_parse_allowlist() {
        let list = parse_allowlist("10.0.0.1, 192.168.0.0/16,,").unwrap();
        assert_eq!(list.len(), 2);
        assert!(matches!(list[0], IpMatcher::Exact(_)));
        assert!(matches!(list[1], IpMatcher::Prefix(_)));

        assert!(parse_allowlist("10.0.0.1, bogus").is_err());
    }

    #[test]
    fn test_port_range_parse() {
        let range: PortRange = "8000-8999".parse().unwrap();
        assert!(range.contains(8443));
        assert!(!range.contains(9000));

        let single: PortRange = "443".parse().unwrap();
        assert!(single.contains(443));
        assert!("9000-8000".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_protocol_covers() {
        assert!(Protocol::Any.covers(Protocol::Udp));
        assert!(Protocol::Tcp.covers(Protocol::Tcp));
        assert!(!Protocol::Tcp.covers(Protocol::Udp));
    }

    #[test]
    fn test_tls_version_ordering_and_parse() {
        assert!(TlsVersion::Tls10 < TlsVersion::Tls12);
        assert!(TlsVersion::Tls13 > TlsVersion::Tls12);
        assert_eq!("TLSv1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert!("SSLv3".parse::<TlsVersion>().is_err());
    }

    proptest! {
        #[test]
        fn prop_ipv4_prefix_contains_its_own_hosts(raw in any::<u32>(), len in 0u8..=32, host in any::<u32>()) {
            let prefix = IpPrefix::new(IpAddr::V4(Ipv4Addr::from(raw)), len).unwrap();
            let host_bits = if len == 32 { 0 } else { host & (u32::MAX >> len) };
            let base = match prefix.address() {
                IpAddr::V4(v4) => u32::from(v4),
                IpAddr::V6(_) => unreachable!(),
            };
            prop_assert!(prefix.contains(IpAddr::V4(Ipv4Addr::from(base | host_bits))));
        }

        #[test]
        fn prop_ipv6_prefix_masking_is_idempotent(raw in any::<u128>(), len in 0u8..=128) {
            prop_assume!(Ipv6Addr::from(raw).to_ipv4_mapped().is_none());
            let prefix = IpPrefix::new(IpAddr::V6(Ipv6Addr::from(raw)), len).unwrap();
            let again = IpPrefix::new(prefix.address(), len).unwrap();
            prop_assert_eq!(prefix, again);
            prop_assert!(prefix.contains(IpAddr::V6(Ipv6Addr::from(raw))));
        }
    }
}
