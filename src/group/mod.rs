//! Outbound groups: polymorphic outbounds that forward through one of their
//! members, composed from static tags and provider subscriptions.

mod selector;
mod urltest;

pub use selector::Selector;
pub use urltest::UrlTest;

use crate::common::metadata::Network;
use crate::config::OutboundOptions;
use crate::outbound::{is_proxy_type, Outbound, OutboundType};
use crate::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

/// Capability contract common to selector and urltest groups.
#[async_trait]
pub trait OutboundGroup: Outbound {
    fn group_type(&self) -> OutboundType;

    /// Tag of the member currently forwarded through.
    fn now(&self) -> String;

    fn all(&self) -> Vec<String>;

    fn selected(&self, network: Network) -> Option<Arc<dyn Outbound>>;

    /// Manual selection; only meaningful for selectors.
    async fn select_by_tag(&self, tag: &str) -> bool {
        let _ = tag;
        false
    }

    /// Rebuild the member list after the named provider changed.
    async fn update_outbounds(&self, provider_tag: &str) -> Result<()>;

    /// Probe members (urltest) or revalidate the selection (selector).
    async fn check_outbounds(&self, force: bool);

    /// Cheap re-evaluation of the selection against current history and
    /// members; no probing.
    fn refresh_selected(&self) {}
}

/// Parse port filter syntax: `N`, `N:M`, `:M`, `N:`. Ranges are inclusive
/// and an open upper bound means 65535.
pub fn create_ports_map(ports: &[String]) -> Result<HashSet<u16>> {
    let mut map = HashSet::new();
    for (index, raw) in ports.iter().enumerate() {
        let invalid = || Error::config(format!("invalid ports item[{}]: {:?}", index, raw));
        if raw == ":" {
            return Err(invalid());
        }
        if !raw.contains(':') {
            let port: i64 = raw.parse().map_err(|_| invalid())?;
            if !(0..=65535).contains(&port) {
                return Err(invalid());
            }
            map.insert(port as u16);
            continue;
        }
        let (start, end) = raw.split_once(':').ok_or_else(invalid)?;
        let parse = |value: &str, default: i64| -> Result<i64> {
            if value.is_empty() {
                return Ok(default);
            }
            value.parse().map_err(|_| invalid())
        };
        let start = parse(start, 0)?;
        let mut end = parse(end, 65535)?;
        if !(0..=65535).contains(&start) || !(0..=65535).contains(&end) {
            return Err(invalid());
        }
        if end == 0 {
            end = 65535;
        }
        if start > end {
            return Err(invalid());
        }
        for port in start..=end {
            map.insert(port as u16);
        }
    }
    Ok(map)
}

/// Member filter shared by groups and providers: every include regex must
/// hit, the exclude regex must not, the type must be a listed proxy type,
/// and the port must be in the map. Empty criteria pass.
pub struct GroupFilter {
    includes: Vec<Regex>,
    excludes: Option<Regex>,
    types: Vec<String>,
    ports: HashSet<u16>,
}

impl GroupFilter {
    pub fn new(
        includes: &[String],
        excludes: &str,
        types: &[String],
        ports: &[String],
    ) -> Result<Self> {
        if !types.iter().all(|t| is_proxy_type(t)) {
            return Err(Error::config("invalid types"));
        }
        let includes = includes
            .iter()
            .map(|pattern| {
                Regex::new(&format!("(?i){}", pattern))
                    .map_err(|e| Error::config(format!("includes {:?}: {}", pattern, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        let excludes = if excludes.is_empty() {
            None
        } else {
            Some(
                Regex::new(&format!("(?i){}", excludes))
                    .map_err(|e| Error::config(format!("excludes {:?}: {}", excludes, e)))?,
            )
        };
        Ok(GroupFilter {
            includes,
            excludes,
            types: types.to_vec(),
            ports: create_ports_map(ports)?,
        })
    }

    fn test(&self, tag: &str, outbound_type: &str, port: u16) -> bool {
        if !self.includes.iter().all(|regex| regex.is_match(tag)) {
            return false;
        }
        if let Some(excludes) = &self.excludes {
            if excludes.is_match(tag) {
                return false;
            }
        }
        if !self.types.is_empty() && !self.types.iter().any(|t| t == outbound_type) {
            return false;
        }
        if port != 0 && !self.ports.is_empty() && !self.ports.contains(&port) {
            return false;
        }
        true
    }

    pub fn matches_outbound(&self, outbound: &dyn Outbound) -> bool {
        self.test(
            outbound.tag(),
            outbound.outbound_type().as_str(),
            outbound.port(),
        )
    }

    pub fn matches_options(&self, options: &OutboundOptions) -> bool {
        self.test(&options.tag, &options.outbound_type, options.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports_map_syntax() {
        let map = create_ports_map(&["443".to_string()]).unwrap();
        assert!(map.contains(&443));

        let map = create_ports_map(&["8000:8010".to_string()]).unwrap();
        assert!(map.contains(&8000) && map.contains(&8010) && !map.contains(&8011));

        let map = create_ports_map(&[":80".to_string()]).unwrap();
        assert!(map.contains(&0) && map.contains(&80) && !map.contains(&81));

        let map = create_ports_map(&["65000:".to_string()]).unwrap();
        assert!(map.contains(&65535) && !map.contains(&64999));
    }

    #[test]
    fn test_ports_map_boundaries() {
        assert!(create_ports_map(&["-1".to_string()]).is_err());
        assert!(create_ports_map(&["65536".to_string()]).is_err());
        assert!(create_ports_map(&[":".to_string()]).is_err());
        assert!(create_ports_map(&["443:80".to_string()]).is_err());
        assert!(create_ports_map(&["abc".to_string()]).is_err());
        assert!(create_ports_map(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_filter_includes_excludes() {
        let filter = GroupFilter::new(
            &["HK".to_string(), "premium".to_string()],
            "expired",
            &[],
            &[],
        )
        .unwrap();
        // All include patterns must match, case-insensitively.
        assert!(filter.test("hk premium 01", "vmess", 0));
        assert!(!filter.test("HK standard", "vmess", 0));
        assert!(!filter.test("HK Premium expired", "vmess", 0));
    }

    #[test]
    fn test_filter_types_and_ports() {
        let filter = GroupFilter::new(&[], "", &["vmess".to_string()], &["443".to_string()])
            .unwrap();
        assert!(filter.test("node", "vmess", 443));
        assert!(!filter.test("node", "trojan", 443));
        assert!(!filter.test("node", "vmess", 8443));
        // Port zero means unknown and always passes.
        assert!(filter.test("node", "vmess", 0));

        assert!(GroupFilter::new(&[], "", &["direct".to_string()], &[]).is_err());
        assert!(GroupFilter::new(&[], "", &["selector".to_string()], &[]).is_err());
    }
}
