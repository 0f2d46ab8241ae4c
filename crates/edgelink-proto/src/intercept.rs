//! Intercept configuration and address matching
//!
//! Services advertise how outbound traffic should be intercepted through
//! config blobs. Two shapes are understood: the host-based `intercept.v1`
//! config and the legacy single-address client config, which translates into
//! the same shape. Matching an address yields a specificity score: lower is
//! more specific, zero is a perfect match.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Score of a perfect address match.
pub const MATCH_EXACT: u32 = 0;

/// Transport protocols an intercept rule can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptProtocol {
    Tcp,
    Udp,
}

impl InterceptProtocol {
    /// Normalize a protocol string; `tcp`/`tcp4`/`tcp6` all mean TCP, and
    /// likewise for UDP.
    pub fn parse(protocol: &str) -> Option<Self> {
        let p = protocol.to_ascii_lowercase();
        if p.starts_with("tcp") {
            Some(InterceptProtocol::Tcp)
        } else if p.starts_with("udp") {
            Some(InterceptProtocol::Udp)
        } else {
            None
        }
    }
}

impl fmt::Display for InterceptProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptProtocol::Tcp => write!(f, "tcp"),
            InterceptProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// Inclusive destination port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        self.low <= port && port <= self.high
    }

    fn width(&self) -> u32 {
        u32::from(self.high.saturating_sub(self.low))
    }
}

/// Host-based intercept configuration (config type `intercept.v1`).
///
/// Addresses may be exact hostnames, `*.domain` wildcards, IP literals, or
/// CIDR blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptConfig {
    pub protocols: Vec<InterceptProtocol>,
    pub addresses: Vec<String>,
    pub port_ranges: Vec<PortRange>,
}

impl InterceptConfig {
    /// Score this rule against a destination tuple.
    ///
    /// Returns `None` when the rule does not cover the protocol, no address
    /// pattern matches, or the port falls outside every range. The score is
    /// the most specific matching address's score plus the width of the
    /// matched port range; [`MATCH_EXACT`] means a perfect match.
    pub fn match_addr(&self, protocol: &str, host: &str, port: u16) -> Option<u32> {
        let protocol = InterceptProtocol::parse(protocol)?;
        if !self.protocols.contains(&protocol) {
            return None;
        }

        let range = self.port_ranges.iter().find(|r| r.contains(port))?;

        let addr_score = self
            .addresses
            .iter()
            .filter_map(|pattern| address_score(pattern, host))
            .min()?;

        Some(addr_score.saturating_add(range.width()))
    }
}

/// Legacy single-address client configuration (config type
/// `edgelink-client.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub hostname: String,
    pub port: u16,
}

impl ClientConfig {
    /// Translate into the host-based intercept shape.
    pub fn to_intercept(&self) -> InterceptConfig {
        InterceptConfig {
            protocols: vec![InterceptProtocol::Tcp, InterceptProtocol::Udp],
            addresses: vec![self.hostname.clone()],
            port_ranges: vec![PortRange {
                low: self.port,
                high: self.port,
            }],
        }
    }
}

/// Specificity of one address pattern against a destination host.
///
/// Exact hostnames and IP literals score 0. A `*.domain` wildcard scores by
/// how much of the hostname it leaves unmatched, so a longer suffix wins. A
/// CIDR block scores by the number of unconstrained address bits.
fn address_score(pattern: &str, host: &str) -> Option<u32> {
    if pattern.contains('/') {
        let (net, prefix, total_bits) = parse_cidr(pattern)?;
        let ip: IpAddr = host.parse().ok()?;
        if cidr_contains(net, prefix, ip) {
            return Some(total_bits - prefix);
        }
        return None;
    }

    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();

    if let Some(suffix) = pattern.strip_prefix("*.") {
        let matches = host.len() > suffix.len() + 1
            && host.ends_with(suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.';
        if matches {
            return Some((host.len() - suffix.len()) as u32);
        }
        return None;
    }

    (host == pattern).then_some(MATCH_EXACT)
}

fn parse_cidr(pattern: &str) -> Option<(IpAddr, u32, u32)> {
    let (addr, prefix) = pattern.split_once('/')?;
    let addr: IpAddr = addr.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    let total_bits = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    (prefix <= total_bits).then_some((addr, prefix, total_bits))
}

fn cidr_contains(net: IpAddr, prefix: u32, ip: IpAddr) -> bool {
    if prefix == 0 {
        return matches!(
            (net, ip),
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
        );
    }
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = u32::MAX << (32 - prefix);
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = u128::MAX << (128 - prefix);
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}
