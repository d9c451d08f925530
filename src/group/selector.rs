//! Manual selection group.

use super::{GroupFilter, OutboundGroup};
use crate::common::interrupt::InterruptGroup;
use crate::common::metadata::{Destination, Network};
use crate::config::GroupOptions;
use crate::outbound::{Outbound, OutboundDatagram, OutboundType, ProxyStream};
use crate::router::Router;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

struct SelectorState {
    outbounds: Vec<Arc<dyn Outbound>>,
    by_tag: HashMap<String, Arc<dyn Outbound>>,
    selected: Arc<dyn Outbound>,
}

pub struct Selector {
    tag: String,
    router: Arc<Router>,
    tags: Vec<String>,
    uses: RwLock<Vec<String>>,
    use_all_providers: bool,
    filter: GroupFilter,
    default_tag: String,
    interrupt_group: InterruptGroup,
    interrupt_external: bool,
    state: RwLock<Option<SelectorState>>,
}

impl Selector {
    pub fn new(router: Arc<Router>, tag: &str, options: GroupOptions) -> Result<Self> {
        if options.outbounds.is_empty() && options.providers.is_empty() && !options.use_all_providers
        {
            return Err(Error::config("missing tags and uses"));
        }
        let filter = GroupFilter::new(
            &options.includes,
            &options.excludes,
            &options.types,
            &options.ports,
        )?;
        Ok(Selector {
            tag: tag.to_string(),
            router,
            tags: options.outbounds,
            uses: RwLock::new(options.providers),
            use_all_providers: options.use_all_providers,
            filter,
            default_tag: options.default,
            interrupt_group: InterruptGroup::new(),
            interrupt_external: options.interrupt_exist_connections,
            state: RwLock::new(None),
        })
    }

    fn rebuild(&self) -> Result<SelectorState> {
        let mut outbounds: Vec<Arc<dyn Outbound>> = Vec::new();
        let mut by_tag = HashMap::new();
        for (index, tag) in self.tags.iter().enumerate() {
            let outbound = self
                .router
                .outbound(tag)
                .ok_or_else(|| Error::config(format!("outbound {} not found: {}", index, tag)))?;
            by_tag.insert(tag.clone(), outbound.clone());
            outbounds.push(outbound);
        }
        for (index, tag) in self.uses.read().iter().enumerate() {
            let provider = self.router.outbound_provider(tag).ok_or_else(|| {
                Error::config(format!("outbound provider {} not found: {}", index, tag))
            })?;
            for outbound in provider.outbounds() {
                if self.filter.matches_outbound(outbound.as_ref()) {
                    by_tag.insert(outbound.tag().to_string(), outbound.clone());
                    outbounds.push(outbound);
                }
            }
        }
        if outbounds.is_empty() {
            let sentinel = self.router.outboundless();
            return Ok(SelectorState {
                outbounds: vec![sentinel.clone()],
                by_tag: HashMap::from([(sentinel.tag().to_string(), sentinel.clone())]),
                selected: sentinel,
            });
        }
        let selected = self.choose(&outbounds, &by_tag)?;
        Ok(SelectorState {
            outbounds,
            by_tag,
            selected,
        })
    }

    /// Selection precedence: persisted choice, then the configured default,
    /// then the first member.
    fn choose(
        &self,
        outbounds: &[Arc<dyn Outbound>],
        by_tag: &HashMap<String, Arc<dyn Outbound>>,
    ) -> Result<Arc<dyn Outbound>> {
        if let Some(cache) = self.router.cache_file() {
            if let Some(saved) = cache.load_selected(&self.tag) {
                if let Some(outbound) = by_tag.get(&saved) {
                    return Ok(outbound.clone());
                }
            }
        }
        if !self.default_tag.is_empty() {
            return by_tag.get(&self.default_tag).cloned().ok_or_else(|| {
                Error::config(format!("default outbound not found: {}", self.default_tag))
            });
        }
        Ok(outbounds[0].clone())
    }

    fn snapshot_selected(&self) -> Result<Arc<dyn Outbound>> {
        self.state
            .read()
            .as_ref()
            .map(|state| state.selected.clone())
            .ok_or_else(|| Error::start(format!("selector {} not started", self.tag)))
    }
}

#[async_trait]
impl Outbound for Selector {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> OutboundType {
        OutboundType::Selector
    }

    fn networks(&self) -> Vec<Network> {
        match self.state.read().as_ref() {
            Some(state) => state.selected.networks(),
            None => vec![Network::Tcp, Network::Udp],
        }
    }

    async fn connect(
        &self,
        network: Network,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyStream>> {
        let selected = self.snapshot_selected()?;
        let conn = selected.connect(network, destination).await?;
        Ok(Box::new(self.interrupt_group.new_stream(conn, true)))
    }

    async fn listen_packet(&self, destination: &Destination) -> Result<Box<dyn OutboundDatagram>> {
        let selected = self.snapshot_selected()?;
        let conn = selected.listen_packet(destination).await?;
        Ok(Box::new(self.interrupt_group.new_datagram(conn, true)))
    }

    async fn start(&self) -> Result<()> {
        if self.use_all_providers {
            let all = self
                .router
                .outbound_providers()
                .iter()
                .map(|provider| provider.tag().to_string())
                .collect();
            *self.uses.write() = all;
        }
        let state = self.rebuild()?;
        *self.state.write() = Some(state);
        Ok(())
    }

    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        Some(self)
    }
}

#[async_trait]
impl OutboundGroup for Selector {
    fn group_type(&self) -> OutboundType {
        OutboundType::Selector
    }

    fn now(&self) -> String {
        self.state
            .read()
            .as_ref()
            .map(|state| state.selected.tag().to_string())
            .unwrap_or_default()
    }

    fn all(&self) -> Vec<String> {
        self.state
            .read()
            .as_ref()
            .map(|state| {
                state
                    .outbounds
                    .iter()
                    .map(|outbound| outbound.tag().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn selected(&self, _network: Network) -> Option<Arc<dyn Outbound>> {
        self.state.read().as_ref().map(|state| state.selected.clone())
    }

    async fn select_by_tag(&self, tag: &str) -> bool {
        {
            let mut guard = self.state.write();
            let Some(state) = guard.as_mut() else {
                return false;
            };
            let Some(outbound) = state.by_tag.get(tag) else {
                return false;
            };
            if state.selected.tag() == tag {
                return true;
            }
            state.selected = outbound.clone();
        }
        if let Some(cache) = self.router.cache_file() {
            if let Err(err) = cache.store_selected(&self.tag, tag) {
                warn!("store selected: {}", err);
            }
        }
        debug!("selector {} switched to {}", self.tag, tag);
        if self.interrupt_external {
            self.interrupt_group.interrupt(true);
        }
        true
    }

    async fn update_outbounds(&self, provider_tag: &str) -> Result<()> {
        if !self.uses.read().iter().any(|tag| tag == provider_tag) {
            return Ok(());
        }
        let state = self
            .rebuild()
            .map_err(|err| Error::internal(format!("update outbounds failed: {}: {}", self.tag, err)))?;
        *self.state.write() = Some(state);
        Ok(())
    }

    async fn check_outbounds(&self, _force: bool) {
        self.refresh_selected();
    }

    /// Re-validate the selection against the current member set: a
    /// reappeared persisted choice wins, a vanished selection falls back to
    /// default-tag then the first member.
    fn refresh_selected(&self) {
        let mut guard = self.state.write();
        let Some(state) = guard.as_mut() else {
            return;
        };
        if let Some(cache) = self.router.cache_file() {
            if let Some(saved) = cache.load_selected(&self.tag) {
                if let Some(outbound) = state.by_tag.get(&saved) {
                    if state.selected.tag() != saved {
                        state.selected = outbound.clone();
                    }
                    return;
                }
            }
        }
        if !state.by_tag.contains_key(state.selected.tag()) {
            let fallback = state
                .by_tag
                .get(&self.default_tag)
                .cloned()
                .or_else(|| state.outbounds.first().cloned());
            if let Some(fallback) = fallback {
                state.selected = fallback;
            }
        }
    }
}
