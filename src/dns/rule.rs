//! DNS rules and their nested fallback rules.
//!
//! Rule items are a closed set, so they dispatch as a tagged enum rather
//! than trait objects. Destination-address items (`ip_cidr`,
//! `ip_is_private`, `geoip`) are special: the primary match treats them as
//! satisfied, and they are only enforced against the answered address set in
//! the address-limit recheck.

use super::QueryContext;
use crate::common::metadata::{FlowMetadata, Network};
use crate::config::{DnsRuleOptions, FallbackRuleOptions};
use crate::router::GeoReader;
use crate::{Error, Result};
use hickory_proto::rr::RecordType;
use ipnet::IpNet;
use regex::Regex;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_RULE_KEY: AtomicU64 = AtomicU64::new(1);

fn parse_query_types(raw: &[String]) -> Result<Vec<u16>> {
    raw.iter()
        .map(|value| {
            if let Ok(numeric) = value.parse::<u16>() {
                return Ok(numeric);
            }
            RecordType::from_str(&value.to_uppercase())
                .map(u16::from)
                .map_err(|_| Error::config(format!("unknown query type: {}", value)))
        })
        .collect()
}

fn parse_networks(raw: &[String]) -> Result<Vec<Network>> {
    raw.iter()
        .map(|value| match value.as_str() {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            other => Err(Error::config(format!("unknown network: {}", other))),
        })
        .collect()
}

fn parse_cidrs(raw: &[String]) -> Result<Vec<IpNet>> {
    raw.iter()
        .map(|value| {
            if let Ok(net) = value.parse::<IpNet>() {
                return Ok(net);
            }
            // A bare address is a host prefix.
            value
                .parse::<IpAddr>()
                .map(IpNet::from)
                .map_err(|_| Error::config(format!("invalid CIDR: {}", value)))
        })
        .collect()
}

fn parse_port_ranges(raw: &[String]) -> Result<Vec<(u16, u16)>> {
    raw.iter()
        .map(|value| {
            let (start, end) = value
                .split_once(':')
                .ok_or_else(|| Error::config(format!("invalid port range: {}", value)))?;
            let start: u16 = if start.is_empty() {
                0
            } else {
                start
                    .parse()
                    .map_err(|_| Error::config(format!("invalid port range: {}", value)))?
            };
            let end: u16 = if end.is_empty() {
                u16::MAX
            } else {
                end.parse()
                    .map_err(|_| Error::config(format!("invalid port range: {}", value)))?
            };
            if start > end {
                return Err(Error::config(format!("invalid port range: {}", value)));
            }
            Ok((start, end))
        })
        .collect()
}

fn compile_regexes(raw: &[String]) -> Result<Vec<Regex>> {
    raw.iter()
        .map(|value| {
            Regex::new(value).map_err(|e| Error::config(format!("domain_regex {:?}: {}", value, e)))
        })
        .collect()
}

pub fn ip_is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
        }
        IpAddr::V6(ip) => {
            ip.is_loopback()
                || ip.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

fn domain_matches_suffix(domain: &str, suffix: &str) -> bool {
    if let Some(stripped) = suffix.strip_prefix('.') {
        return domain.ends_with(suffix) || domain == stripped;
    }
    domain == suffix || domain.ends_with(&format!(".{}", suffix))
}

enum RuleItem {
    Inbound(Vec<String>),
    IpVersion(u8),
    QueryType(Vec<u16>),
    Network(Vec<Network>),
    AuthUser(Vec<String>),
    Protocol(Vec<String>),
    Domain { exact: Vec<String>, suffix: Vec<String> },
    DomainKeyword(Vec<String>),
    DomainRegex(Vec<Regex>),
    Geosite(Vec<String>),
    SourceGeoIp(Vec<String>),
    GeoIp(Vec<String>),
    SourceIpCidr(Vec<IpNet>),
    IpCidr(Vec<IpNet>),
    SourceIpIsPrivate,
    IpIsPrivate,
    SourcePort(Vec<u16>),
    SourcePortRange(Vec<(u16, u16)>),
    Port(Vec<u16>),
    PortRange(Vec<(u16, u16)>),
    ProcessName(Vec<String>),
    ProcessPath(Vec<String>),
    PackageName(Vec<String>),
    User(Vec<String>),
    UserId(Vec<u32>),
    Outbound(Vec<String>),
    ClashMode(String),
    WifiSsid(Vec<String>),
    WifiBssid(Vec<String>),
    RuleSet(Vec<String>),
}

impl RuleItem {
    /// Items evaluated against the answered address set, not the question.
    fn is_destination_address_item(&self) -> bool {
        matches!(
            self,
            RuleItem::GeoIp(_) | RuleItem::IpCidr(_) | RuleItem::IpIsPrivate
        )
    }

    fn query_domain(meta: &FlowMetadata) -> Option<String> {
        if !meta.domain.is_empty() {
            return Some(meta.domain.to_lowercase());
        }
        meta.destination
            .as_ref()
            .and_then(|dest| dest.fqdn())
            .map(str::to_lowercase)
    }

    fn destination_ips(meta: &FlowMetadata) -> Vec<IpAddr> {
        let mut ips = meta.destination_addresses.clone();
        if let Some(ip) = meta.destination.as_ref().and_then(|dest| dest.ip()) {
            ips.push(ip);
        }
        ips
    }

    fn matches(&self, meta: &FlowMetadata, geo: Option<&dyn GeoReader>) -> bool {
        match self {
            RuleItem::Inbound(tags) => tags.iter().any(|tag| *tag == meta.inbound_tag),
            RuleItem::IpVersion(version) => meta.ip_version == Some(*version),
            RuleItem::QueryType(types) => meta
                .query_type
                .map(|qtype| types.contains(&qtype))
                .unwrap_or(false),
            RuleItem::Network(networks) => meta
                .network
                .map(|network| networks.contains(&network))
                .unwrap_or(false),
            RuleItem::AuthUser(users) => users.iter().any(|user| *user == meta.auth_user),
            RuleItem::Protocol(protocols) => {
                protocols.iter().any(|protocol| *protocol == meta.protocol)
            }
            RuleItem::Domain { exact, suffix } => match Self::query_domain(meta) {
                Some(domain) => {
                    exact.iter().any(|candidate| *candidate == domain)
                        || suffix
                            .iter()
                            .any(|candidate| domain_matches_suffix(&domain, candidate))
                }
                None => false,
            },
            RuleItem::DomainKeyword(keywords) => match Self::query_domain(meta) {
                Some(domain) => keywords.iter().any(|keyword| domain.contains(keyword)),
                None => false,
            },
            RuleItem::DomainRegex(regexes) => match Self::query_domain(meta) {
                Some(domain) => regexes.iter().any(|regex| regex.is_match(&domain)),
                None => false,
            },
            RuleItem::Geosite(categories) => match (geo, Self::query_domain(meta)) {
                (Some(geo), Some(domain)) => categories
                    .iter()
                    .any(|category| geo.match_geosite(category, &domain)),
                _ => false,
            },
            RuleItem::SourceGeoIp(codes) => match (geo, meta.source) {
                (Some(geo), Some(source)) => geo
                    .lookup_country(source.ip())
                    .map(|code| codes.iter().any(|c| c.eq_ignore_ascii_case(&code)))
                    .unwrap_or(false),
                _ => false,
            },
            RuleItem::GeoIp(codes) => match geo {
                Some(geo) => Self::destination_ips(meta).iter().any(|ip| {
                    geo.lookup_country(*ip)
                        .map(|code| codes.iter().any(|c| c.eq_ignore_ascii_case(&code)))
                        .unwrap_or(false)
                }),
                None => false,
            },
            RuleItem::SourceIpCidr(nets) => meta
                .source
                .map(|source| nets.iter().any(|net| net.contains(&source.ip())))
                .unwrap_or(false),
            RuleItem::IpCidr(nets) => Self::destination_ips(meta)
                .iter()
                .any(|ip| nets.iter().any(|net| net.contains(ip))),
            RuleItem::SourceIpIsPrivate => meta
                .source
                .map(|source| ip_is_private(source.ip()))
                .unwrap_or(false),
            RuleItem::IpIsPrivate => Self::destination_ips(meta)
                .iter()
                .any(|ip| ip_is_private(*ip)),
            RuleItem::SourcePort(ports) => meta
                .source
                .map(|source| ports.contains(&source.port()))
                .unwrap_or(false),
            RuleItem::SourcePortRange(ranges) => meta
                .source
                .map(|source| {
                    ranges
                        .iter()
                        .any(|(start, end)| (*start..=*end).contains(&source.port()))
                })
                .unwrap_or(false),
            RuleItem::Port(ports) => meta
                .destination
                .as_ref()
                .map(|dest| ports.contains(&dest.port))
                .unwrap_or(false),
            RuleItem::PortRange(ranges) => meta
                .destination
                .as_ref()
                .map(|dest| {
                    ranges
                        .iter()
                        .any(|(start, end)| (*start..=*end).contains(&dest.port))
                })
                .unwrap_or(false),
            RuleItem::ProcessName(names) => names.iter().any(|name| *name == meta.process_name),
            RuleItem::ProcessPath(paths) => paths.iter().any(|path| *path == meta.process_path),
            RuleItem::PackageName(names) => names.iter().any(|name| *name == meta.package_name),
            RuleItem::User(users) => users.iter().any(|user| *user == meta.user),
            RuleItem::UserId(ids) => meta.user_id.map(|id| ids.contains(&id)).unwrap_or(false),
            RuleItem::Outbound(tags) => tags.iter().any(|tag| *tag == meta.outbound_tag),
            RuleItem::ClashMode(mode) => mode.eq_ignore_ascii_case(&meta.clash_mode),
            RuleItem::WifiSsid(ssids) => ssids.iter().any(|ssid| *ssid == meta.wifi_ssid),
            RuleItem::WifiBssid(bssids) => bssids.iter().any(|bssid| *bssid == meta.wifi_bssid),
            RuleItem::RuleSet(tags) => match (geo, Self::query_domain(meta)) {
                (Some(geo), Some(domain)) => tags.iter().any(|tag| {
                    geo.match_rule_set(tag, &domain, &meta.destination_addresses)
                }),
                _ => false,
            },
        }
    }
}

fn build_items(options: &DnsRuleOptions) -> Result<Vec<RuleItem>> {
    let mut items = Vec::new();
    if !options.inbound.is_empty() {
        items.push(RuleItem::Inbound(options.inbound.clone()));
    }
    if let Some(version) = options.ip_version {
        if version != 4 && version != 6 {
            return Err(Error::config(format!("invalid ip version: {}", version)));
        }
        items.push(RuleItem::IpVersion(version));
    }
    if !options.query_type.is_empty() {
        items.push(RuleItem::QueryType(parse_query_types(&options.query_type)?));
    }
    if !options.network.is_empty() {
        items.push(RuleItem::Network(parse_networks(&options.network)?));
    }
    if !options.auth_user.is_empty() {
        items.push(RuleItem::AuthUser(options.auth_user.clone()));
    }
    if !options.protocol.is_empty() {
        items.push(RuleItem::Protocol(options.protocol.clone()));
    }
    if !options.domain.is_empty() || !options.domain_suffix.is_empty() {
        items.push(RuleItem::Domain {
            exact: options.domain.iter().map(|d| d.to_lowercase()).collect(),
            suffix: options
                .domain_suffix
                .iter()
                .map(|d| d.to_lowercase())
                .collect(),
        });
    }
    if !options.domain_keyword.is_empty() {
        items.push(RuleItem::DomainKeyword(options.domain_keyword.clone()));
    }
    if !options.domain_regex.is_empty() {
        items.push(RuleItem::DomainRegex(compile_regexes(&options.domain_regex)?));
    }
    if !options.geosite.is_empty() {
        items.push(RuleItem::Geosite(options.geosite.clone()));
    }
    if !options.source_geoip.is_empty() {
        items.push(RuleItem::SourceGeoIp(options.source_geoip.clone()));
    }
    if !options.geoip.is_empty() {
        items.push(RuleItem::GeoIp(options.geoip.clone()));
    }
    if !options.source_ip_cidr.is_empty() {
        items.push(RuleItem::SourceIpCidr(parse_cidrs(&options.source_ip_cidr)?));
    }
    if !options.ip_cidr.is_empty() {
        items.push(RuleItem::IpCidr(parse_cidrs(&options.ip_cidr)?));
    }
    if options.source_ip_is_private {
        items.push(RuleItem::SourceIpIsPrivate);
    }
    if options.ip_is_private {
        items.push(RuleItem::IpIsPrivate);
    }
    if !options.source_port.is_empty() {
        items.push(RuleItem::SourcePort(options.source_port.clone()));
    }
    if !options.source_port_range.is_empty() {
        items.push(RuleItem::SourcePortRange(parse_port_ranges(
            &options.source_port_range,
        )?));
    }
    if !options.port.is_empty() {
        items.push(RuleItem::Port(options.port.clone()));
    }
    if !options.port_range.is_empty() {
        items.push(RuleItem::PortRange(parse_port_ranges(&options.port_range)?));
    }
    if !options.process_name.is_empty() {
        items.push(RuleItem::ProcessName(options.process_name.clone()));
    }
    if !options.process_path.is_empty() {
        items.push(RuleItem::ProcessPath(options.process_path.clone()));
    }
    if !options.package_name.is_empty() {
        items.push(RuleItem::PackageName(options.package_name.clone()));
    }
    if !options.user.is_empty() {
        items.push(RuleItem::User(options.user.clone()));
    }
    if !options.user_id.is_empty() {
        items.push(RuleItem::UserId(options.user_id.clone()));
    }
    if !options.outbound.is_empty() {
        items.push(RuleItem::Outbound(options.outbound.clone()));
    }
    if !options.clash_mode.is_empty() {
        items.push(RuleItem::ClashMode(options.clash_mode.clone()));
    }
    if !options.wifi_ssid.is_empty() {
        items.push(RuleItem::WifiSsid(options.wifi_ssid.clone()));
    }
    if !options.wifi_bssid.is_empty() {
        items.push(RuleItem::WifiBssid(options.wifi_bssid.clone()));
    }
    if !options.rule_set.is_empty() {
        items.push(RuleItem::RuleSet(options.rule_set.clone()));
    }
    Ok(items)
}

enum RuleKind {
    Simple { items: Vec<RuleItem> },
    Logical { and: bool, rules: Vec<DnsRule> },
}

pub struct DnsRule {
    cache_key: u64,
    kind: RuleKind,
    invert: bool,
    server: String,
    disable_cache: bool,
    rewrite_ttl: Option<u32>,
    client_subnet: Option<IpNet>,
    fallback_rules: Vec<FallbackRule>,
}

impl DnsRule {
    pub fn new(options: &DnsRuleOptions, check_server: bool) -> Result<Self> {
        if options.server.is_empty() && check_server {
            return Err(Error::config("missing server field"));
        }
        let fallback_rules = options
            .fallback_rules
            .iter()
            .enumerate()
            .map(|(i, fb)| {
                FallbackRule::new(fb)
                    .map_err(|e| Error::config(format!("fallback_rule[{}]: {}", i, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        let kind = match options.rule_type.as_str() {
            "" | "default" => {
                let items = build_items(options)?;
                if items.is_empty() && fallback_rules.is_empty() {
                    return Err(Error::config("missing conditions"));
                }
                RuleKind::Simple { items }
            }
            "logical" => {
                let and = match options.mode.as_str() {
                    "and" => true,
                    "or" => false,
                    other => {
                        return Err(Error::config(format!("unknown logical mode: {}", other)))
                    }
                };
                if options.rules.is_empty() {
                    return Err(Error::config("missing conditions"));
                }
                let rules = options
                    .rules
                    .iter()
                    .enumerate()
                    .map(|(i, sub)| {
                        DnsRule::new(sub, false)
                            .map_err(|e| Error::config(format!("sub rule[{}]: {}", i, e)))
                    })
                    .collect::<Result<Vec<_>>>()?;
                RuleKind::Logical { and, rules }
            }
            other => return Err(Error::config(format!("unknown rule type: {}", other))),
        };
        let client_subnet = options
            .client_subnet
            .as_ref()
            .map(|raw| parse_client_subnet(raw))
            .transpose()?;
        Ok(DnsRule {
            cache_key: NEXT_RULE_KEY.fetch_add(1, Ordering::Relaxed),
            kind,
            invert: options.invert,
            server: options.server.clone(),
            disable_cache: options.disable_cache,
            rewrite_ttl: options.rewrite_ttl,
            client_subnet,
            fallback_rules,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn fallback_rules(&self) -> &[FallbackRule] {
        &self.fallback_rules
    }

    pub fn query_context(&self) -> QueryContext {
        QueryContext {
            disable_cache: self.disable_cache,
            rewrite_ttl: self.rewrite_ttl,
            client_subnet: self.client_subnet,
        }
    }

    /// True when the answer set must be rechecked against this rule.
    pub fn with_address_limit(&self) -> bool {
        match &self.kind {
            RuleKind::Simple { items } => {
                items.iter().any(RuleItem::is_destination_address_item)
            }
            RuleKind::Logical { rules, .. } => rules.iter().any(DnsRule::with_address_limit),
        }
    }

    fn match_inner(
        &self,
        meta: &mut FlowMetadata,
        geo: Option<&dyn GeoReader>,
        include_address_items: bool,
    ) -> bool {
        let matched = match &self.kind {
            RuleKind::Simple { items } => items.iter().all(|item| {
                if !include_address_items && item.is_destination_address_item() {
                    return true;
                }
                item.matches(meta, geo)
            }),
            RuleKind::Logical { and, rules } => {
                if *and {
                    rules.iter().all(|rule| {
                        meta.reset_rule_cache();
                        rule.match_inner(meta, geo, include_address_items)
                    })
                } else {
                    rules.iter().any(|rule| {
                        meta.reset_rule_cache();
                        rule.match_inner(meta, geo, include_address_items)
                    })
                }
            }
        };
        matched != self.invert
    }

    /// Primary match, with destination-address items treated as satisfied.
    pub fn matches(&self, meta: &mut FlowMetadata, geo: Option<&dyn GeoReader>) -> bool {
        if let Some(cached) = meta.cached_rule_result(self.cache_key) {
            return cached;
        }
        let matched = self.match_inner(meta, geo, false);
        meta.cache_rule_result(self.cache_key, matched);
        matched
    }

    /// Full recheck including destination-address items, run against the
    /// answered address set in `meta.destination_addresses`.
    pub fn match_address_limit(&self, meta: &mut FlowMetadata, geo: Option<&dyn GeoReader>) -> bool {
        self.match_inner(meta, geo, true)
    }
}

impl fmt::Display for DnsRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RuleKind::Simple { items } => write!(f, "rule({} items)", items.len())?,
            RuleKind::Logical { and, rules } => write!(
                f,
                "logical({}, {} rules)",
                if *and { "and" } else { "or" },
                rules.len()
            )?,
        }
        if !self.server.is_empty() {
            write!(f, "=>{}", self.server)?;
        }
        Ok(())
    }
}

fn parse_client_subnet(raw: &str) -> Result<IpNet> {
    if let Ok(net) = raw.parse::<IpNet>() {
        return Ok(net);
    }
    raw.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| Error::config(format!("invalid client_subnet: {}", raw)))
}

/// Sub-rule consulted after the primary transport answered, matched against
/// the returned address set.
pub struct FallbackRule {
    match_all: bool,
    ip_cidr: Vec<IpNet>,
    ip_is_private: bool,
    geoip: Vec<String>,
    invert: bool,
    server: String,
    disable_cache: bool,
    rewrite_ttl: Option<u32>,
    client_subnet: Option<IpNet>,
}

impl FallbackRule {
    pub fn new(options: &FallbackRuleOptions) -> Result<Self> {
        if !options.match_all
            && options.ip_cidr.is_empty()
            && !options.ip_is_private
            && options.geoip.is_empty()
        {
            return Err(Error::config("missing conditions"));
        }
        let client_subnet = options
            .client_subnet
            .as_ref()
            .map(|raw| parse_client_subnet(raw))
            .transpose()?;
        Ok(FallbackRule {
            match_all: options.match_all,
            ip_cidr: parse_cidrs(&options.ip_cidr)?,
            ip_is_private: options.ip_is_private,
            geoip: options.geoip.clone(),
            invert: options.invert,
            server: options.server.clone(),
            disable_cache: options.disable_cache,
            rewrite_ttl: options.rewrite_ttl,
            client_subnet,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn query_context(&self) -> QueryContext {
        QueryContext {
            disable_cache: self.disable_cache,
            rewrite_ttl: self.rewrite_ttl,
            client_subnet: self.client_subnet,
        }
    }

    pub fn matches(&self, addresses: &[IpAddr], geo: Option<&dyn GeoReader>) -> bool {
        if self.match_all {
            return true;
        }
        let matched = addresses.iter().any(|ip| {
            if self.ip_cidr.iter().any(|net| net.contains(ip)) {
                return true;
            }
            if self.ip_is_private && ip_is_private(*ip) {
                return true;
            }
            if let Some(geo) = geo {
                if let Some(code) = geo.lookup_country(*ip) {
                    return self.geoip.iter().any(|c| c.eq_ignore_ascii_case(&code));
                }
            }
            false
        });
        matched != self.invert
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_from_json(raw: &str) -> DnsRule {
        let options: DnsRuleOptions = serde_json::from_str(raw).unwrap();
        DnsRule::new(&options, true).unwrap()
    }

    #[test]
    fn test_domain_suffix_match() {
        assert!(domain_matches_suffix("a.example.com", "example.com"));
        assert!(domain_matches_suffix("example.com", "example.com"));
        assert!(!domain_matches_suffix("badexample.com", "example.com"));
        assert!(domain_matches_suffix("a.example.com", ".example.com"));
        assert!(domain_matches_suffix("example.com", ".example.com"));
    }

    #[test]
    fn test_simple_rule_match_and_invert() {
        let rule = rule_from_json(
            r#"{"domain_suffix": ["example.com"], "query_type": ["A"], "server": "clean"}"#,
        );
        let mut meta = FlowMetadata::new().with_domain("www.example.com");
        meta.query_type = Some(1);
        assert!(rule.matches(&mut meta, None));

        meta.reset_rule_cache();
        meta.query_type = Some(28);
        assert!(!rule.matches(&mut meta, None));

        let inverted = rule_from_json(
            r#"{"domain_suffix": ["example.com"], "invert": true, "server": "clean"}"#,
        );
        let mut meta = FlowMetadata::new().with_domain("other.org");
        assert!(inverted.matches(&mut meta, None));
    }

    #[test]
    fn test_address_limit_items_deferred() {
        let rule = rule_from_json(r#"{"ip_cidr": ["10.0.0.0/8"], "server": "clean"}"#);
        assert!(rule.with_address_limit());

        // Primary match passes without any addresses.
        let mut meta = FlowMetadata::new().with_domain("example.com");
        assert!(rule.matches(&mut meta, None));

        // Recheck enforces the CIDR against the answer set.
        meta.destination_addresses = vec!["10.1.2.3".parse().unwrap()];
        assert!(rule.match_address_limit(&mut meta, None));
        meta.destination_addresses = vec!["93.184.216.34".parse().unwrap()];
        assert!(!rule.match_address_limit(&mut meta, None));
    }

    #[test]
    fn test_logical_rule() {
        let rule = rule_from_json(
            r#"{
                "type": "logical",
                "mode": "and",
                "rules": [
                    {"domain_suffix": ["example.com"]},
                    {"query_type": ["AAAA"]}
                ],
                "server": "clean"
            }"#,
        );
        let mut meta = FlowMetadata::new().with_domain("www.example.com");
        meta.query_type = Some(28);
        assert!(rule.matches(&mut meta, None));

        meta.reset_rule_cache();
        meta.query_type = Some(1);
        assert!(!rule.matches(&mut meta, None));
    }

    #[test]
    fn test_missing_conditions_rejected() {
        let options: DnsRuleOptions = serde_json::from_str(r#"{"server": "clean"}"#).unwrap();
        assert!(DnsRule::new(&options, true).is_err());

        let options: DnsRuleOptions =
            serde_json::from_str(r#"{"domain": ["example.com"]}"#).unwrap();
        assert!(DnsRule::new(&options, true).is_err());
    }

    #[test]
    fn test_fallback_rule_match() {
        let options: FallbackRuleOptions =
            serde_json::from_str(r#"{"ip_is_private": true, "server": "local"}"#).unwrap();
        let rule = FallbackRule::new(&options).unwrap();
        assert!(rule.matches(&["192.168.0.10".parse().unwrap()], None));
        assert!(!rule.matches(&["93.184.216.34".parse().unwrap()], None));

        let options: FallbackRuleOptions =
            serde_json::from_str(r#"{"match_all": true}"#).unwrap();
        let rule = FallbackRule::new(&options).unwrap();
        assert!(rule.matches(&[], None));
    }

    #[test]
    fn test_port_range_parse() {
        assert_eq!(parse_port_ranges(&["80:443".to_string()]).unwrap(), vec![(80, 443)]);
        assert_eq!(parse_port_ranges(&[":1024".to_string()]).unwrap(), vec![(0, 1024)]);
        assert_eq!(
            parse_port_ranges(&["1024:".to_string()]).unwrap(),
            vec![(1024, u16::MAX)]
        );
        assert!(parse_port_ranges(&["443:80".to_string()]).is_err());
        assert!(parse_port_ranges(&["abc".to_string()]).is_err());
    }
}
