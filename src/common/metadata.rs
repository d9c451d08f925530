//! Per-flow and per-query metadata

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Destination of a flow: an IP address or a fully qualified domain name,
/// plus a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ip(IpAddr),
    Fqdn(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: Host,
    pub port: u16,
}

impl Destination {
    pub fn new_ip(ip: IpAddr, port: u16) -> Self {
        Destination {
            host: Host::Ip(ip),
            port,
        }
    }

    pub fn new_fqdn<S: Into<String>>(domain: S, port: u16) -> Self {
        let domain = domain.into();
        match domain.parse::<IpAddr>() {
            Ok(ip) => Destination::new_ip(ip, port),
            Err(_) => Destination {
                host: Host::Fqdn(domain),
                port,
            },
        }
    }

    /// Parse `host:port`, with `[v6]:port` bracket syntax.
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Some(Destination::new_ip(addr.ip(), addr.port()));
        }
        let (host, port) = s.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Destination::new_fqdn(host, port))
    }

    pub fn is_fqdn(&self) -> bool {
        matches!(self.host, Host::Fqdn(_))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self.host {
            Host::Ip(ip) => Some(ip),
            Host::Fqdn(_) => None,
        }
    }

    pub fn fqdn(&self) -> Option<&str> {
        match &self.host {
            Host::Fqdn(domain) => Some(domain),
            Host::Ip(_) => None,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Same port, resolved address.
    pub fn with_ip(&self, ip: IpAddr) -> Destination {
        Destination::new_ip(ip, self.port)
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.host, Host::Ip(IpAddr::V6(_)))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            Host::Fqdn(domain) => write!(f, "{}:{}", domain, self.port),
        }
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Destination::new_ip(addr.ip(), addr.port())
    }
}

/// Everything the rule engines may inspect about a flow or a DNS query.
///
/// A single record serves both the connection path and the DNS path; DNS-only
/// fields stay at their defaults for plain flows.
#[derive(Debug, Clone, Default)]
pub struct FlowMetadata {
    pub inbound_tag: String,
    pub network: Option<Network>,
    pub source: Option<SocketAddr>,
    pub destination: Option<Destination>,
    pub domain: String,
    pub user: String,
    pub user_id: Option<u32>,
    pub auth_user: String,
    pub protocol: String,
    pub process_name: String,
    pub process_path: String,
    pub package_name: String,
    pub clash_mode: String,
    pub outbound_tag: String,
    pub wifi_ssid: String,
    pub wifi_bssid: String,

    /// DNS query type (A = 1, AAAA = 28, ...), set on the DNS path only.
    pub query_type: Option<u16>,
    pub ip_version: Option<u8>,
    /// Answer addresses, populated for address-limit rechecks and
    /// fallback-rule matching.
    pub destination_addresses: Vec<IpAddr>,
    pub dns_fallback: bool,

    /// Memoized rule results for this metadata snapshot. Must be cleared
    /// whenever the fields above mutate between evaluations.
    rule_cache: HashMap<u64, bool>,
}

impl FlowMetadata {
    pub fn new() -> Self {
        FlowMetadata::default()
    }

    pub fn with_domain<S: Into<String>>(mut self, domain: S) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_inbound<S: Into<String>>(mut self, tag: S) -> Self {
        self.inbound_tag = tag.into();
        self
    }

    pub fn reset_rule_cache(&mut self) {
        self.rule_cache.clear();
    }

    pub fn cached_rule_result(&self, key: u64) -> Option<bool> {
        self.rule_cache.get(&key).copied()
    }

    pub fn cache_rule_result(&mut self, key: u64, matched: bool) {
        self.rule_cache.insert(key, matched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_destination_parse() {
        let dest = Destination::parse("example.com:443").unwrap();
        assert!(dest.is_fqdn());
        assert_eq!(dest.port, 443);
        assert_eq!(dest.to_string(), "example.com:443");

        let dest = Destination::parse("10.0.0.1:80").unwrap();
        assert_eq!(dest.ip(), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));

        let dest = Destination::parse("[::1]:53").unwrap();
        assert!(dest.is_ipv6());
        assert_eq!(dest.to_string(), "[::1]:53");

        assert!(Destination::parse("no-port").is_none());
        assert!(Destination::parse(":80").is_none());
    }

    #[test]
    fn test_fqdn_that_is_an_ip() {
        let dest = Destination::new_fqdn("127.0.0.1", 8080);
        assert!(!dest.is_fqdn());
        assert_eq!(dest.socket_addr().unwrap().port(), 8080);
    }

    #[test]
    fn test_rule_cache_reset() {
        let mut meta = FlowMetadata::new().with_domain("example.com");
        meta.cache_rule_result(1, true);
        assert_eq!(meta.cached_rule_result(1), Some(true));
        meta.reset_rule_cache();
        assert_eq!(meta.cached_rule_result(1), None);
    }
}
