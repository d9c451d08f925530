//! Configuration option structs.
//!
//! The surface mirrors the native JSON config format; YAML input is accepted
//! and reduced to the same shapes. Unknown top-level keys are ignored,
//! except inside `override_dialer` where they are a validation error.

mod duration;

pub use duration::{parse_duration, DurationOption};

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub log: LogOptions,
    pub dns: DnsOptions,
    pub inbounds: Vec<InboundOptions>,
    pub outbounds: Vec<OutboundOptions>,
    pub outbound_providers: Vec<ProviderOptions>,
    pub route: RouteOptions,
    pub experimental: ExperimentalOptions,
}

impl Options {
    /// Parse JSON or YAML content into the known top-level keys.
    pub fn parse_str(content: &str) -> Result<Self> {
        let trimmed = content.trim_start();
        if trimmed.starts_with('{') {
            Ok(serde_json::from_str(trimmed)?)
        } else {
            Ok(serde_yaml::from_str(content)?)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    pub level: String,
    pub timestamp: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: "info".to_string(),
            timestamp: true,
        }
    }
}

/// Inbound listeners are collaborators; the core only consumes their tags
/// for rule matching and keeps the rest of the object opaque.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundOptions {
    #[serde(rename = "type")]
    pub inbound_type: String,
    pub tag: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Address family handling when a domain resolves to both families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStrategy {
    #[default]
    #[serde(alias = "")]
    AsIs,
    PreferIpv4,
    PreferIpv6,
    Ipv4Only,
    Ipv6Only,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerOptions {
    pub detour: String,
    pub bind_interface: String,
    pub protect_path: String,
    pub inet4_bind_address: Option<Ipv4Addr>,
    pub inet6_bind_address: Option<Ipv6Addr>,
    pub routing_mark: u32,
    pub reuse_addr: bool,
    pub connect_timeout: Option<DurationOption>,
    pub tcp_fast_open: bool,
    pub tcp_multi_path: bool,
    pub udp_fragment: Option<bool>,
    pub domain_strategy: DomainStrategy,
    pub fallback_delay: Option<DurationOption>,
    pub server_addresses: Vec<IpAddr>,
    pub store_last_ip: bool,
    pub is_wireguard_listener: bool,
}

/// One outbound entry. Common fields are typed; protocol-specific scalars
/// stay in `extra` so deep comparison sees the whole record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundOptions {
    #[serde(rename = "type")]
    pub outbound_type: String,
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    #[serde(flatten)]
    pub dialer: DialerOptions,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl OutboundOptions {
    pub fn port(&self) -> u16 {
        self.server_port
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_u16(&self, key: &str) -> Option<u16> {
        self.extra
            .get(key)
            .and_then(|v| v.as_u64())
            .and_then(|v| u16::try_from(v).ok())
    }

    /// Reinterpret the non-common fields as group options.
    pub fn group_options(&self) -> Result<GroupOptions> {
        let value = serde_json::Value::Object(self.extra.clone());
        Ok(serde_json::from_value(value)?)
    }
}

/// Options shared by selector and urltest groups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupOptions {
    pub outbounds: Vec<String>,
    pub providers: Vec<String>,
    pub use_all_providers: bool,
    pub includes: Vec<String>,
    pub excludes: String,
    pub types: Vec<String>,
    pub ports: Vec<String>,
    /// Selector: initial pick when nothing is persisted.
    pub default: String,
    /// URLTest: probe target.
    pub url: String,
    pub interval: Option<DurationOption>,
    pub tolerance: u16,
    pub interrupt_exist_connections: bool,
}

/// Dialer fields a provider may force onto every parsed outbound.
/// Unknown keys are a validation error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverrideDialerOptions {
    pub force_override: bool,
    pub detour: Option<String>,
    pub bind_interface: Option<String>,
    pub inet4_bind_address: Option<Ipv4Addr>,
    pub inet6_bind_address: Option<Ipv6Addr>,
    pub routing_mark: Option<u32>,
    pub reuse_addr: Option<bool>,
    pub connect_timeout: Option<DurationOption>,
    pub tcp_fast_open: Option<bool>,
    pub tcp_multi_path: Option<bool>,
    pub udp_fragment: Option<bool>,
    pub domain_strategy: Option<DomainStrategy>,
    pub fallback_delay: Option<DurationOption>,
}

impl OverrideDialerOptions {
    /// Apply onto an outbound's own dialer options. Set fields win over
    /// unset ones; `force_override` wins even over set ones.
    pub fn apply(&self, options: &mut DialerOptions) {
        let force = self.force_override;
        if let Some(detour) = &self.detour {
            if options.detour.is_empty() || force {
                options.detour = detour.clone();
            }
        }
        if let Some(bind_interface) = &self.bind_interface {
            if options.bind_interface.is_empty() || force {
                options.bind_interface = bind_interface.clone();
            }
        }
        if let Some(addr) = self.inet4_bind_address {
            if options.inet4_bind_address.is_none() || force {
                options.inet4_bind_address = Some(addr);
            }
        }
        if let Some(addr) = self.inet6_bind_address {
            if options.inet6_bind_address.is_none() || force {
                options.inet6_bind_address = Some(addr);
            }
        }
        if let Some(mark) = self.routing_mark {
            if options.routing_mark == 0 || force {
                options.routing_mark = mark;
            }
        }
        if let Some(reuse) = self.reuse_addr {
            options.reuse_addr = reuse;
        }
        if let Some(timeout) = self.connect_timeout {
            if options.connect_timeout.is_none() || force {
                options.connect_timeout = Some(timeout);
            }
        }
        if let Some(tfo) = self.tcp_fast_open {
            options.tcp_fast_open = tfo;
        }
        if let Some(mptcp) = self.tcp_multi_path {
            options.tcp_multi_path = mptcp;
        }
        if let Some(fragment) = self.udp_fragment {
            options.udp_fragment = Some(fragment);
        }
        if let Some(strategy) = self.domain_strategy {
            if options.domain_strategy == DomainStrategy::AsIs || force {
                options.domain_strategy = strategy;
            }
        }
        if let Some(delay) = self.fallback_delay {
            if options.fallback_delay.is_none() || force {
                options.fallback_delay = Some(delay);
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOptions {
    pub tag: String,
    /// `file` or `http`.
    #[serde(rename = "type")]
    pub provider_type: String,
    pub path: String,
    pub url: String,
    pub user_agent: String,
    pub interval: Option<DurationOption>,
    pub healthcheck_url: String,
    pub healthcheck_interval: Option<DurationOption>,
    pub enable_healthcheck: bool,
    pub detour: String,
    pub includes: Vec<String>,
    pub excludes: String,
    pub types: Vec<String>,
    pub ports: Vec<String>,
    pub override_dialer: Option<OverrideDialerOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteOptions {
    /// Default outbound tag for flows no rule claims.
    #[serde(rename = "final")]
    pub final_outbound: String,
    pub auto_detect_interface: bool,
    pub default_interface: String,
    pub default_mark: u32,
    pub concurrent_dial: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentalOptions {
    pub cache_file: CacheFileOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheFileOptions {
    pub enabled: bool,
    pub path: String,
    pub store_selected: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsOptions {
    pub servers: Vec<DnsServerOptions>,
    pub rules: Vec<DnsRuleOptions>,
    /// Default transport tag.
    #[serde(rename = "final")]
    pub final_transport: String,
    pub strategy: DomainStrategy,
    pub hosts: HashMap<String, HostsEntry>,
    pub disable_cache: bool,
    pub reverse_mapping: bool,
    pub fakeip: FakeIpOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostsEntry {
    Single(String),
    Multiple(Vec<String>),
}

impl HostsEntry {
    pub fn values(&self) -> Vec<String> {
        match self {
            HostsEntry::Single(v) => vec![v.clone()],
            HostsEntry::Multiple(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsServerOptions {
    pub tag: String,
    /// `udp://1.1.1.1`, plain `1.1.1.1`, `fakeip`, or `rcode://refused`.
    pub address: String,
    pub detour: String,
    pub strategy: Option<DomainStrategy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeIpOptions {
    pub enabled: bool,
    pub inet4_range: Option<String>,
}

/// One DNS rule. `type: logical` nests sub-rules under `rules` with a mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsRuleOptions {
    #[serde(rename = "type")]
    pub rule_type: String,
    pub mode: String,
    pub rules: Vec<DnsRuleOptions>,

    pub inbound: Vec<String>,
    pub ip_version: Option<u8>,
    pub query_type: Vec<String>,
    pub network: Vec<String>,
    pub auth_user: Vec<String>,
    pub protocol: Vec<String>,
    pub domain: Vec<String>,
    pub domain_suffix: Vec<String>,
    pub domain_keyword: Vec<String>,
    pub domain_regex: Vec<String>,
    pub geosite: Vec<String>,
    pub source_geoip: Vec<String>,
    pub geoip: Vec<String>,
    pub source_ip_cidr: Vec<String>,
    pub ip_cidr: Vec<String>,
    pub source_ip_is_private: bool,
    pub ip_is_private: bool,
    pub source_port: Vec<u16>,
    pub source_port_range: Vec<String>,
    pub port: Vec<u16>,
    pub port_range: Vec<String>,
    pub process_name: Vec<String>,
    pub process_path: Vec<String>,
    pub package_name: Vec<String>,
    pub user: Vec<String>,
    pub user_id: Vec<u32>,
    pub outbound: Vec<String>,
    pub clash_mode: String,
    pub wifi_ssid: Vec<String>,
    pub wifi_bssid: Vec<String>,
    pub rule_set: Vec<String>,
    pub rule_set_ip_cidr_match_source: bool,
    pub invert: bool,

    pub server: String,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<String>,
    pub fallback_rules: Vec<FallbackRuleOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackRuleOptions {
    pub match_all: bool,
    pub ip_cidr: Vec<String>,
    pub ip_is_private: bool,
    pub geoip: Vec<String>,
    pub invert: bool,
    pub server: String,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_and_yaml() {
        let json = r#"{
            "log": {"level": "debug"},
            "outbounds": [
                {"type": "direct", "tag": "direct-out"},
                {"type": "http", "tag": "corp", "server": "10.0.0.2", "server_port": 3128}
            ],
            "route": {"final": "direct-out", "concurrent_dial": true}
        }"#;
        let options = Options::parse_str(json).unwrap();
        assert_eq!(options.log.level, "debug");
        assert_eq!(options.outbounds.len(), 2);
        assert_eq!(options.outbounds[1].server_port, 3128);
        assert!(options.route.concurrent_dial);

        let yaml = "log:\n  level: warn\noutbounds:\n  - type: direct\n    tag: d\n";
        let options = Options::parse_str(yaml).unwrap();
        assert_eq!(options.log.level, "warn");
        assert_eq!(options.outbounds[0].tag, "d");
    }

    #[test]
    fn test_unknown_top_level_keys_ignored() {
        let json = r#"{"$schema": "x", "ntp": {"enabled": false}, "outbounds": []}"#;
        assert!(Options::parse_str(json).is_ok());
    }

    #[test]
    fn test_override_dialer_rejects_unknown_keys() {
        let raw = r#"{"force_override": true, "bogus_key": 1}"#;
        let parsed: std::result::Result<OverrideDialerOptions, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_override_apply_set_wins() {
        let mut dialer = DialerOptions {
            bind_interface: "eth0".to_string(),
            ..Default::default()
        };
        let override_options = OverrideDialerOptions {
            bind_interface: Some("wlan0".to_string()),
            routing_mark: Some(255),
            ..Default::default()
        };
        override_options.apply(&mut dialer);
        // Existing value kept without force, unset value filled.
        assert_eq!(dialer.bind_interface, "eth0");
        assert_eq!(dialer.routing_mark, 255);

        let forced = OverrideDialerOptions {
            force_override: true,
            bind_interface: Some("wlan0".to_string()),
            ..Default::default()
        };
        forced.apply(&mut dialer);
        assert_eq!(dialer.bind_interface, "wlan0");
    }

    #[test]
    fn test_override_apply_idempotent() {
        let mut first = DialerOptions::default();
        let override_options = OverrideDialerOptions {
            domain_strategy: Some(DomainStrategy::PreferIpv6),
            tcp_fast_open: Some(true),
            ..Default::default()
        };
        override_options.apply(&mut first);
        let mut second = first.clone();
        override_options.apply(&mut second);
        assert_eq!(first, second);
        assert_eq!(first.domain_strategy, DomainStrategy::PreferIpv6);
    }

    #[test]
    fn test_prefer_strategies_distinct() {
        let v4: DomainStrategy = serde_json::from_str("\"prefer_ipv4\"").unwrap();
        let v6: DomainStrategy = serde_json::from_str("\"prefer_ipv6\"").unwrap();
        assert_ne!(v4, v6);
    }

    #[test]
    fn test_group_options_from_extra() {
        let json = r#"{
            "type": "selector",
            "tag": "grp",
            "outbounds": ["a", "b"],
            "providers": ["sub"],
            "default": "b",
            "interrupt_exist_connections": true
        }"#;
        let outbound: OutboundOptions = serde_json::from_str(json).unwrap();
        let group = outbound.group_options().unwrap();
        assert_eq!(group.outbounds, vec!["a", "b"]);
        assert_eq!(group.providers, vec!["sub"]);
        assert_eq!(group.default, "b");
        assert!(group.interrupt_exist_connections);
    }
}
