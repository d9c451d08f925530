//! Router façade: registries of inbound tags, outbounds and providers, the
//! DNS router, interface state, and collaborator hooks.

use crate::common::cachefile::CacheFile;
use crate::common::history::HistoryStore;
use crate::common::metadata::{FlowMetadata, Network};
use crate::common::pause::PauseManager;
use crate::config::{DnsServerOptions, DomainStrategy, Options};
use crate::dns::{new_transport, DnsClient, DnsRouter, DnsRule, DnsTransport, FakeIpTransport};
use crate::outbound::Outbound;
use crate::provider::OutboundProvider;
use crate::{Error, Result};
use hickory_proto::op::Message;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use tracing::debug;

/// Platform hooks supplied by the embedding application.
pub trait Platform: Send + Sync {
    /// Currently active default network interface, when the platform can
    /// tell.
    fn default_interface(&self) -> Option<String> {
        None
    }

    fn clear_dns_cache(&self) {}
}

/// Geodata collaborator consumed by geoip/geosite/rule-set rule items. The
/// loaders themselves live outside the core.
pub trait GeoReader: Send + Sync {
    /// ISO country code for an address.
    fn lookup_country(&self, ip: IpAddr) -> Option<String>;

    fn match_geosite(&self, category: &str, domain: &str) -> bool;

    fn match_rule_set(&self, tag: &str, domain: &str, addresses: &[IpAddr]) -> bool {
        let _ = (tag, domain, addresses);
        false
    }
}

pub struct Router {
    history: Arc<HistoryStore>,
    pause: Arc<PauseManager>,
    outbounds: RwLock<Vec<Arc<dyn Outbound>>>,
    outbound_by_tag: RwLock<HashMap<String, Arc<dyn Outbound>>>,
    providers: RwLock<Vec<Arc<dyn OutboundProvider>>>,
    provider_by_tag: RwLock<HashMap<String, Arc<dyn OutboundProvider>>>,
    inbound_tags: RwLock<Vec<String>>,
    outboundless: RwLock<Option<Arc<dyn Outbound>>>,
    default_outbound_tag: String,
    dns_options: crate::config::DnsOptions,
    dns: OnceLock<Arc<DnsRouter>>,
    cache_file: RwLock<Option<Arc<dyn CacheFile>>>,
    platform: RwLock<Option<Arc<dyn Platform>>>,
    geo: RwLock<Option<Arc<dyn GeoReader>>>,
    auto_detect_interface: bool,
    default_interface: String,
    default_mark: u32,
    interface_tx: broadcast::Sender<()>,
}

impl Router {
    pub fn new(options: &Options) -> Result<Arc<Self>> {
        crate::dialer::set_concurrent_dial(options.route.concurrent_dial);
        let (interface_tx, _) = broadcast::channel(4);
        Ok(Arc::new(Router {
            history: Arc::new(HistoryStore::new()),
            pause: Arc::new(PauseManager::new()),
            outbounds: RwLock::new(Vec::new()),
            outbound_by_tag: RwLock::new(HashMap::new()),
            providers: RwLock::new(Vec::new()),
            provider_by_tag: RwLock::new(HashMap::new()),
            inbound_tags: RwLock::new(Vec::new()),
            outboundless: RwLock::new(None),
            default_outbound_tag: options.route.final_outbound.clone(),
            dns_options: options.dns.clone(),
            dns: OnceLock::new(),
            cache_file: RwLock::new(None),
            platform: RwLock::new(None),
            geo: RwLock::new(None),
            auto_detect_interface: options.route.auto_detect_interface,
            default_interface: options.route.default_interface.clone(),
            default_mark: options.route.default_mark,
            interface_tx,
        }))
    }

    // Registration, used during gateway construction.

    pub fn register_inbound_tag(&self, tag: &str) {
        self.inbound_tags.write().push(tag.to_string());
    }

    pub fn register_outbound(&self, outbound: Arc<dyn Outbound>) -> Result<()> {
        let tag = outbound.tag().to_string();
        let mut by_tag = self.outbound_by_tag.write();
        if by_tag.contains_key(&tag) {
            return Err(Error::config(format!("duplicate outbound tag: {}", tag)));
        }
        by_tag.insert(tag, outbound.clone());
        self.outbounds.write().push(outbound);
        Ok(())
    }

    pub fn set_outboundless(&self, outbound: Arc<dyn Outbound>) {
        *self.outboundless.write() = Some(outbound);
    }

    pub fn register_provider(&self, provider: Arc<dyn OutboundProvider>) -> Result<()> {
        let tag = provider.tag().to_string();
        let mut by_tag = self.provider_by_tag.write();
        if by_tag.contains_key(&tag) {
            return Err(Error::config(format!("duplicate provider tag: {}", tag)));
        }
        by_tag.insert(tag, provider.clone());
        self.providers.write().push(provider);
        Ok(())
    }

    // Registry lookups.

    pub fn inbound_tags(&self) -> Vec<String> {
        self.inbound_tags.read().clone()
    }

    pub fn outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        self.outbound_by_tag.read().get(tag).cloned()
    }

    pub fn outbounds(&self) -> Vec<Arc<dyn Outbound>> {
        self.outbounds.read().clone()
    }

    /// Look a tag up across static outbounds and every provider's children.
    pub fn outbound_with_provider(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        if let Some(outbound) = self.outbound(tag) {
            return Some(outbound);
        }
        for provider in self.providers.read().iter() {
            if let Some(outbound) = provider.outbound(tag) {
                return Some(outbound);
            }
        }
        None
    }

    pub fn outbound_provider(&self, tag: &str) -> Option<Arc<dyn OutboundProvider>> {
        self.provider_by_tag.read().get(tag).cloned()
    }

    pub fn outbound_providers(&self) -> Vec<Arc<dyn OutboundProvider>> {
        self.providers.read().clone()
    }

    /// The last-resort sentinel; always present once the gateway is built.
    pub fn outboundless(&self) -> Arc<dyn Outbound> {
        self.outboundless
            .read()
            .clone()
            .expect("OUTBOUNDLESS not registered")
    }

    /// Default egress for flows no rule claims: the configured final tag,
    /// else the first capable configured outbound, else the sentinel.
    pub fn default_outbound(&self, network: Network) -> Result<Arc<dyn Outbound>> {
        if !self.default_outbound_tag.is_empty() {
            return self.outbound(&self.default_outbound_tag).ok_or_else(|| {
                Error::config(format!(
                    "default outbound not found: {}",
                    self.default_outbound_tag
                ))
            });
        }
        let sentinel_tag = crate::constant::OUTBOUNDLESS_TAG;
        let found = self
            .outbounds
            .read()
            .iter()
            .find(|outbound| {
                outbound.tag() != sentinel_tag && outbound.networks().contains(&network)
            })
            .cloned();
        Ok(found.unwrap_or_else(|| self.outboundless()))
    }

    // Shared services.

    pub fn history(&self) -> Arc<HistoryStore> {
        self.history.clone()
    }

    pub fn pause(&self) -> Arc<PauseManager> {
        self.pause.clone()
    }

    pub fn cache_file(&self) -> Option<Arc<dyn CacheFile>> {
        self.cache_file.read().clone()
    }

    pub fn set_cache_file(&self, cache_file: Arc<dyn CacheFile>) {
        *self.cache_file.write() = Some(cache_file);
    }

    pub fn platform(&self) -> Option<Arc<dyn Platform>> {
        self.platform.read().clone()
    }

    pub fn set_platform(&self, platform: Arc<dyn Platform>) {
        *self.platform.write() = Some(platform);
    }

    pub fn geo_reader(&self) -> Option<Arc<dyn GeoReader>> {
        self.geo.read().clone()
    }

    pub fn set_geo_reader(&self, geo: Arc<dyn GeoReader>) {
        *self.geo.write() = Some(geo);
    }

    // Interface state.

    pub fn auto_detect_interface(&self) -> bool {
        self.auto_detect_interface
    }

    pub fn default_interface(&self) -> String {
        if !self.default_interface.is_empty() {
            return self.default_interface.clone();
        }
        self.platform
            .read()
            .as_ref()
            .and_then(|platform| platform.default_interface())
            .unwrap_or_default()
    }

    pub fn default_mark(&self) -> u32 {
        self.default_mark
    }

    pub fn subscribe_interface_updates(&self) -> broadcast::Receiver<()> {
        self.interface_tx.subscribe()
    }

    /// Propagate a network change: urltest groups re-check through their
    /// subscription, providers are poked directly.
    pub fn notify_interface_update(&self) {
        debug!("network interface updated");
        let _ = self.interface_tx.send(());
        for provider in self.providers.read().iter() {
            provider.interface_updated();
        }
    }

    // DNS.

    /// Compile DNS rules and freeze the transport map. Runs once; the maps
    /// are immutable afterwards so readers take no lock.
    pub fn pre_start(self: &Arc<Self>) -> Result<()> {
        if self.dns.get().is_some() {
            return Ok(());
        }
        let options = &self.dns_options;
        let mut transports: HashMap<String, Arc<dyn DnsTransport>> = HashMap::new();
        let mut strategies: HashMap<String, DomainStrategy> = HashMap::new();
        let mut ordered: Vec<Arc<dyn DnsTransport>> = Vec::new();
        for (index, server) in options.servers.iter().enumerate() {
            let mut server = server.clone();
            if server.tag.is_empty() {
                server.tag = index.to_string();
            }
            if transports.contains_key(&server.tag) {
                return Err(Error::config(format!(
                    "duplicate dns server tag: {}",
                    server.tag
                )));
            }
            let transport: Arc<dyn DnsTransport> = if server.address.trim() == "fakeip" {
                let range = options
                    .fakeip
                    .inet4_range
                    .as_deref()
                    .map(|raw| {
                        raw.parse().map_err(|_| {
                            Error::config(format!("invalid fakeip inet4_range: {}", raw))
                        })
                    })
                    .transpose()?;
                Arc::new(FakeIpTransport::new(&server.tag, range)?)
            } else {
                new_transport(self, &server)?
            };
            if let Some(strategy) = server.strategy {
                strategies.insert(server.tag.clone(), strategy);
            }
            transports.insert(server.tag.clone(), transport.clone());
            ordered.push(transport);
        }
        let default_transport = if !options.final_transport.is_empty() {
            transports
                .get(&options.final_transport)
                .cloned()
                .ok_or_else(|| {
                    Error::config(format!(
                        "default dns server not found: {}",
                        options.final_transport
                    ))
                })?
        } else if let Some(first) = ordered.first() {
            first.clone()
        } else {
            // No servers configured: fall back to a well-known resolver so
            // bare configurations still resolve.
            let fallback = DnsServerOptions {
                tag: "default".to_string(),
                address: "8.8.8.8".to_string(),
                ..Default::default()
            };
            let transport = new_transport(self, &fallback)?;
            transports.insert(fallback.tag.clone(), transport.clone());
            transport
        };
        let mut rules = Vec::with_capacity(options.rules.len());
        for (index, rule) in options.rules.iter().enumerate() {
            let rule = DnsRule::new(rule, true)
                .map_err(|err| Error::config(format!("dns rule[{}]: {}", index, err)))?;
            rules.push(rule);
        }
        let client = DnsClient::new(options);
        let dns = DnsRouter::new(
            client,
            transports,
            strategies,
            default_transport,
            options.strategy,
            rules,
            options.reverse_mapping,
            self.geo_reader(),
        );
        let _ = self.dns.set(Arc::new(dns));
        Ok(())
    }

    fn dns_router(&self) -> Result<Arc<DnsRouter>> {
        self.dns
            .get()
            .cloned()
            .ok_or_else(|| Error::start("router not pre-started"))
    }

    pub async fn exchange(&self, message: &Message, meta: &mut FlowMetadata) -> Result<Message> {
        self.dns_router()?.exchange(message, meta).await
    }

    pub async fn lookup(&self, domain: &str, strategy: DomainStrategy) -> Result<Vec<IpAddr>> {
        self.dns_router()?.lookup(domain, strategy).await
    }

    pub async fn lookup_default(&self, domain: &str) -> Result<Vec<IpAddr>> {
        self.lookup(domain, DomainStrategy::AsIs).await
    }

    pub fn reverse_query(&self, ip: IpAddr) -> Option<String> {
        self.dns.get()?.reverse_query(ip)
    }

    pub fn clear_dns_cache(&self) {
        if let Some(dns) = self.dns.get() {
            dns.clear_cache();
        }
        if let Some(platform) = self.platform.read().as_ref() {
            platform.clear_dns_cache();
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Arc<Router> {
        Router::new(&Options::default()).expect("test router")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutboundOptions;
    use crate::outbound::new_outbound;

    fn direct_options(tag: &str) -> OutboundOptions {
        serde_json::from_str(&format!(r#"{{"type": "direct", "tag": "{}"}}"#, tag)).unwrap()
    }

    #[test]
    fn test_duplicate_outbound_rejected() {
        let router = Router::for_tests();
        let a = new_outbound(&router, "a", &direct_options("a")).unwrap();
        let duplicate = new_outbound(&router, "a", &direct_options("a")).unwrap();
        router.register_outbound(a).unwrap();
        assert!(router.register_outbound(duplicate).is_err());
    }

    #[test]
    fn test_default_outbound_skips_sentinel() {
        let router = Router::for_tests();
        let sentinel =
            new_outbound(&router, crate::constant::OUTBOUNDLESS_TAG, &direct_options("x")).unwrap();
        router.set_outboundless(sentinel.clone());
        router.register_outbound(sentinel).unwrap();
        let first = new_outbound(&router, "first", &direct_options("first")).unwrap();
        router.register_outbound(first).unwrap();

        let default = router.default_outbound(Network::Tcp).unwrap();
        assert_eq!(default.tag(), "first");
    }

    #[tokio::test]
    async fn test_pre_start_compiles_dns() {
        let options: Options = Options::parse_str(
            r#"{
                "dns": {
                    "servers": [{"tag": "cloud", "address": "1.1.1.1"}],
                    "rules": [{"domain_suffix": ["internal.example"], "server": "cloud"}],
                    "final": "cloud"
                }
            }"#,
        )
        .unwrap();
        let router = Router::new(&options).unwrap();
        router.pre_start().unwrap();
        // Idempotent.
        router.pre_start().unwrap();
        assert!(router.reverse_query("1.2.3.4".parse().unwrap()).is_none());
    }
}
