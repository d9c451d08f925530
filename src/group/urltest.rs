//! Latency-based auto-selection group.

use super::{GroupFilter, OutboundGroup};
use crate::common::interrupt::InterruptGroup;
use crate::common::metadata::{Destination, Network};
use crate::common::urltest::url_test;
use crate::config::GroupOptions;
use crate::constant::{
    DEFAULT_HEALTHCHECK_URL, DEFAULT_URLTEST_INTERVAL, DEFAULT_URLTEST_TOLERANCE,
    HEALTHCHECK_CONCURRENCY, TCP_TIMEOUT,
};
use crate::outbound::{real_tag, Outbound, OutboundDatagram, OutboundType, ProxyStream};
use crate::router::Router;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

pub struct UrlTest {
    tag: String,
    weak: Weak<UrlTest>,
    router: Arc<Router>,
    tags: Vec<String>,
    uses: RwLock<Vec<String>>,
    use_all_providers: bool,
    filter: GroupFilter,
    link: String,
    interval: Duration,
    tolerance: u16,
    interrupt_group: InterruptGroup,
    interrupt_external: bool,
    outbounds: RwLock<Vec<Arc<dyn Outbound>>>,
    selected_tcp: RwLock<Option<Arc<dyn Outbound>>>,
    selected_udp: RwLock<Option<Arc<dyn Outbound>>>,
    checking: AtomicBool,
    ticker_started: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl UrlTest {
    pub fn new(router: Arc<Router>, tag: &str, options: GroupOptions) -> Result<Arc<Self>> {
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
        let interval = options
            .interval
            .map(|d| d.get())
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_URLTEST_INTERVAL);
        let tolerance = if options.tolerance == 0 {
            DEFAULT_URLTEST_TOLERANCE
        } else {
            options.tolerance
        };
        let link = if options.url.is_empty() {
            DEFAULT_HEALTHCHECK_URL.to_string()
        } else {
            options.url
        };
        let (shutdown, _) = broadcast::channel(1);
        Ok(Arc::new_cyclic(|weak| UrlTest {
            tag: tag.to_string(),
            weak: weak.clone(),
            router,
            tags: options.outbounds,
            uses: RwLock::new(options.providers),
            use_all_providers: options.use_all_providers,
            filter,
            link,
            interval,
            tolerance,
            interrupt_group: InterruptGroup::new(),
            interrupt_external: options.interrupt_exist_connections,
            outbounds: RwLock::new(Vec::new()),
            selected_tcp: RwLock::new(None),
            selected_udp: RwLock::new(None),
            checking: AtomicBool::new(false),
            ticker_started: AtomicBool::new(false),
            shutdown,
        }))
    }

    fn rebuild(&self) -> Result<Vec<Arc<dyn Outbound>>> {
        let mut outbounds: Vec<Arc<dyn Outbound>> = Vec::new();
        for (index, tag) in self.tags.iter().enumerate() {
            let outbound = self
                .router
                .outbound(tag)
                .ok_or_else(|| Error::config(format!("outbound {} not found: {}", index, tag)))?;
            outbounds.push(outbound);
        }
        for (index, tag) in self.uses.read().iter().enumerate() {
            let provider = self.router.outbound_provider(tag).ok_or_else(|| {
                Error::config(format!("outbound provider {} not found: {}", index, tag))
            })?;
            for outbound in provider.outbounds() {
                if self.filter.matches_outbound(outbound.as_ref()) {
                    outbounds.push(outbound);
                }
            }
        }
        if outbounds.is_empty() {
            outbounds.push(self.router.outboundless());
        }
        Ok(outbounds)
    }

    /// Lowest-latency capable member; within `tolerance` of the minimum the
    /// newer measurement wins. Members without history lose to any member
    /// with history.
    fn select(&self, network: Network) -> Option<Arc<dyn Outbound>> {
        let outbounds = self.outbounds.read();
        let history = self.router.history();
        let mut min_delay: u16 = 0;
        let mut min_time: Option<Instant> = None;
        let mut min_outbound: Option<Arc<dyn Outbound>> = None;
        for outbound in outbounds.iter() {
            if !outbound.networks().contains(&network) {
                continue;
            }
            let Some(entry) = history.load(&real_tag(outbound.as_ref())) else {
                continue;
            };
            let replace = match &min_outbound {
                None => true,
                Some(_) => {
                    min_delay > entry.delay.saturating_add(self.tolerance)
                        || (entry.delay < min_delay.saturating_add(self.tolerance)
                            && min_time.map(|t| t < entry.at).unwrap_or(false))
                }
            };
            if replace {
                min_delay = entry.delay;
                min_time = Some(entry.at);
                min_outbound = Some(outbound.clone());
            }
        }
        min_outbound
            .or_else(|| {
                outbounds
                    .iter()
                    .find(|outbound| outbound.networks().contains(&network))
                    .cloned()
            })
            .or_else(|| outbounds.first().cloned())
    }

    fn perform_update_check(&self) {
        let mut updated = false;
        let new_tcp = self.select(Network::Tcp);
        {
            let mut selected = self.selected_tcp.write();
            if !same_outbound(&selected, &new_tcp) {
                *selected = new_tcp;
                updated = true;
            }
        }
        let new_udp = self.select(Network::Udp);
        {
            let mut selected = self.selected_udp.write();
            if !same_outbound(&selected, &new_udp) {
                *selected = new_udp;
                updated = true;
            }
        }
        if updated {
            debug!("urltest {} selection changed to {}", self.tag, self.now());
            if self.interrupt_external {
                self.interrupt_group.interrupt(true);
            }
        }
    }

    /// One probe pass: every member with stale or missing history is tested,
    /// at most [`HEALTHCHECK_CONCURRENCY`] in flight.
    async fn run_check(&self, force: bool) {
        if self.checking.swap(true, Ordering::SeqCst) {
            return;
        }
        self.router.pause().wait_active().await;
        let history = self.router.history();
        let outbounds = self.outbounds.read().clone();
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        for outbound in outbounds {
            let tag = real_tag(outbound.as_ref());
            if !seen.insert(tag.clone()) {
                continue;
            }
            if !force {
                if let Some(entry) = history.load(&tag) {
                    if entry.at.elapsed() < self.interval {
                        continue;
                    }
                }
            }
            let Some(target) = self.router.outbound_with_provider(&tag) else {
                continue;
            };
            jobs.push((tag, target));
        }
        let mut futs: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>> =
            Vec::new();
        for (tag, target) in jobs.into_iter() {
            let link = self.link.clone();
            let history = history.clone();
            futs.push(Box::pin(async move {
                match url_test(target.as_ref(), &link, TCP_TIMEOUT).await {
                    Ok(delay) => {
                        debug!("outbound {} available: {}ms", tag, delay);
                        history.store(&tag, delay);
                    }
                    Err(err) => {
                        debug!("outbound {} unavailable: {}", tag, err);
                        history.delete(&tag);
                    }
                }
            }));
        }
        futures::stream::iter(futs)
        .buffer_unordered(HEALTHCHECK_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;
        self.perform_update_check();
        self.checking.store(false, Ordering::SeqCst);
    }

    /// The periodic ticker starts on first use, not at construction.
    fn ensure_ticker(&self) {
        if self.ticker_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.weak.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(group) = weak.upgrade() else { break };
                        group.run_check(false).await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn snapshot_selected(&self, network: Network) -> Result<Arc<dyn Outbound>> {
        let slot = match network {
            Network::Tcp => &self.selected_tcp,
            Network::Udp => &self.selected_udp,
        };
        if let Some(selected) = slot.read().clone() {
            return Ok(selected);
        }
        self.select(network)
            .ok_or_else(|| Error::start(format!("urltest {} not started", self.tag)))
    }
}

fn same_outbound(a: &Option<Arc<dyn Outbound>>, b: &Option<Arc<dyn Outbound>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

#[async_trait]
impl Outbound for UrlTest {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> OutboundType {
        OutboundType::UrlTest
    }

    fn networks(&self) -> Vec<Network> {
        match self.selected_tcp.read().as_ref() {
            Some(selected) => selected.networks(),
            None => vec![Network::Tcp, Network::Udp],
        }
    }

    async fn connect(
        &self,
        network: Network,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyStream>> {
        self.ensure_ticker();
        let outbound = self.snapshot_selected(network)?;
        match outbound.connect(network, destination).await {
            Ok(conn) => Ok(Box::new(self.interrupt_group.new_stream(conn, true))),
            Err(err) => {
                self.router.history().delete(&real_tag(outbound.as_ref()));
                Err(err)
            }
        }
    }

    async fn listen_packet(&self, destination: &Destination) -> Result<Box<dyn OutboundDatagram>> {
        self.ensure_ticker();
        let outbound = self.snapshot_selected(Network::Udp)?;
        match outbound.listen_packet(destination).await {
            Ok(conn) => Ok(Box::new(self.interrupt_group.new_datagram(conn, true))),
            Err(err) => {
                self.router.history().delete(&real_tag(outbound.as_ref()));
                Err(err)
            }
        }
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
        let outbounds = self.rebuild()?;
        *self.outbounds.write() = outbounds;
        Ok(())
    }

    async fn post_start(&self) -> Result<()> {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            if let Some(group) = weak.upgrade() {
                group.run_check(true).await;
            }
        });

        let weak = self.weak.clone();
        let mut updates = self.router.subscribe_interface_updates();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = updates.recv() => {
                        if result.is_err() {
                            break;
                        }
                        let Some(group) = weak.upgrade() else { break };
                        group.run_check(true).await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(());
        Ok(())
    }

    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        Some(self)
    }
}

#[async_trait]
impl OutboundGroup for UrlTest {
    fn group_type(&self) -> OutboundType {
        OutboundType::UrlTest
    }

    fn now(&self) -> String {
        self.selected_tcp
            .read()
            .as_ref()
            .map(|selected| selected.tag().to_string())
            .or_else(|| {
                self.select(Network::Tcp)
                    .map(|selected| selected.tag().to_string())
            })
            .unwrap_or_default()
    }

    fn all(&self) -> Vec<String> {
        self.outbounds
            .read()
            .iter()
            .map(|outbound| outbound.tag().to_string())
            .collect()
    }

    fn selected(&self, network: Network) -> Option<Arc<dyn Outbound>> {
        let slot = match network {
            Network::Tcp => &self.selected_tcp,
            Network::Udp => &self.selected_udp,
        };
        slot.read().clone().or_else(|| self.select(network))
    }

    async fn update_outbounds(&self, provider_tag: &str) -> Result<()> {
        if !self.uses.read().iter().any(|tag| tag == provider_tag) {
            return Ok(());
        }
        let outbounds = self
            .rebuild()
            .map_err(|err| Error::internal(format!("update outbounds failed: {}: {}", self.tag, err)))?;
        *self.outbounds.write() = outbounds;
        self.perform_update_check();
        Ok(())
    }

    async fn check_outbounds(&self, force: bool) {
        self.run_check(force).await;
    }

    fn refresh_selected(&self) {
        self.perform_update_check();
    }
}
