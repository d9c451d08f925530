//! Outbound providers: subscription-backed, hot-reloadable outbound sets.

mod file;
mod http;
pub mod parser;

pub use file::FileProvider;
pub use http::HttpProvider;
pub use parser::SubscriptionInfo;

use crate::common::urltest::url_test;
use crate::config::{OutboundOptions, OverrideDialerOptions, ProviderOptions};
use crate::constant::{
    DEFAULT_HEALTHCHECK_URL, DEFAULT_URLTEST_INTERVAL, HEALTHCHECK_CONCURRENCY, TCP_TIMEOUT,
};
use crate::group::GroupFilter;
use crate::outbound::{is_proxy_type, new_outbound, Outbound};
use crate::router::Router;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[async_trait]
pub trait OutboundProvider: Send + Sync {
    fn tag(&self) -> &str;

    /// `file` or `http`.
    fn provider_type(&self) -> &'static str;

    fn path(&self) -> &Path;

    fn update_time(&self) -> DateTime<Utc>;

    fn sub_info(&self) -> SubscriptionInfo;

    fn outbounds(&self) -> Vec<Arc<dyn Outbound>>;

    fn outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>>;

    /// Load from disk and start children.
    async fn start(&self) -> Result<()>;

    /// Mandatory: arms the one-minute tick loop that drives refresh and
    /// health checks.
    async fn post_start(&self) -> Result<()>;

    /// Refresh from the source. Without `force`, providers skip refreshes
    /// inside their configured interval.
    async fn update(&self, force: bool) -> Result<()>;

    async fn healthcheck(&self, link: Option<&str>, force: bool) -> Result<HashMap<String, u16>>;

    /// Interface change: re-probe immediately.
    fn interface_updated(&self);

    async fn close(&self) -> Result<()>;
}

pub fn new_provider(
    router: &Arc<Router>,
    options: &ProviderOptions,
) -> Result<Arc<dyn OutboundProvider>> {
    if options.path.is_empty() {
        return Err(Error::config("provider path missing"));
    }
    match options.provider_type.as_str() {
        "file" => Ok(FileProvider::new(router.clone(), options)?),
        "http" => Ok(HttpProvider::new(router.clone(), options)?),
        other => Err(Error::config(format!("invalid provider type: {}", other))),
    }
}

pub(crate) struct ProviderState {
    pub outbounds: Vec<Arc<dyn Outbound>>,
    pub by_tag: HashMap<String, Arc<dyn Outbound>>,
    pub last_options: Vec<OutboundOptions>,
    pub update_time: DateTime<Utc>,
    pub sub_info: SubscriptionInfo,
}

impl Default for ProviderState {
    fn default() -> Self {
        ProviderState {
            outbounds: Vec::new(),
            by_tag: HashMap::new(),
            last_options: Vec::new(),
            update_time: DateTime::<Utc>::UNIX_EPOCH,
            sub_info: SubscriptionInfo::default(),
        }
    }
}

/// State and behavior shared by the file and HTTP providers.
pub(crate) struct ProviderAdapter {
    pub tag: String,
    pub router: Arc<Router>,
    pub path: PathBuf,
    pub enable_healthcheck: bool,
    pub healthcheck_url: String,
    pub healthcheck_interval: Duration,
    filter: GroupFilter,
    override_dialer: Option<OverrideDialerOptions>,
    pub state: RwLock<ProviderState>,
    checking: AtomicBool,
    pub updating: AtomicBool,
    last_healthcheck: Mutex<Option<Instant>>,
    pub shutdown: broadcast::Sender<()>,
}

impl ProviderAdapter {
    pub fn new(router: Arc<Router>, options: &ProviderOptions) -> Result<Self> {
        let filter = GroupFilter::new(
            &options.includes,
            &options.excludes,
            &options.types,
            &options.ports,
        )?;
        let healthcheck_url = if options.healthcheck_url.is_empty() {
            DEFAULT_HEALTHCHECK_URL.to_string()
        } else {
            options.healthcheck_url.clone()
        };
        let healthcheck_interval = options
            .healthcheck_interval
            .map(|d| d.get())
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_URLTEST_INTERVAL);
        let (shutdown, _) = broadcast::channel(1);
        Ok(ProviderAdapter {
            tag: options.tag.clone(),
            router,
            path: PathBuf::from(&options.path),
            enable_healthcheck: options.enable_healthcheck,
            healthcheck_url,
            healthcheck_interval,
            filter,
            override_dialer: options.override_dialer.clone(),
            state: RwLock::new(ProviderState::default()),
            checking: AtomicBool::new(false),
            updating: AtomicBool::new(false),
            last_healthcheck: Mutex::new(None),
            shutdown,
        })
    }

    pub fn outbounds(&self) -> Vec<Arc<dyn Outbound>> {
        self.state.read().outbounds.clone()
    }

    pub fn outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        self.state.read().by_tag.get(tag).cloned()
    }

    pub fn update_time(&self) -> DateTime<Utc> {
        self.state.read().update_time
    }

    pub fn sub_info(&self) -> SubscriptionInfo {
        self.state.read().sub_info
    }

    /// Filter parsed records and compare with the previous successful parse.
    /// `None` means nothing changed and no rebuild is needed.
    fn prepare_options(&self, mut parsed: Vec<OutboundOptions>) -> Option<Vec<OutboundOptions>> {
        parser::apply_overrides(&mut parsed, self.override_dialer.as_ref());
        let filtered: Vec<OutboundOptions> = parsed
            .into_iter()
            .filter(|outbound| self.filter.matches_options(outbound))
            .collect();
        let state = self.state.read();
        if !options_changed(&state.last_options, &filtered) {
            return None;
        }
        drop(state);
        Some(filtered)
    }

    /// Tags already taken by static outbounds and other providers.
    fn taken_tags(&self) -> HashSet<String> {
        let mut taken: HashSet<String> = self
            .router
            .outbounds()
            .iter()
            .map(|outbound| outbound.tag().to_string())
            .collect();
        for provider in self.router.outbound_providers() {
            if provider.tag() == self.tag {
                continue;
            }
            for outbound in provider.outbounds() {
                taken.insert(outbound.tag().to_string());
            }
        }
        taken
    }

    /// Construct children with globally unique tags. Records whose type
    /// cannot be built are skipped with a warning, like any other partially
    /// valid subscription.
    fn create_outbounds(&self, options: &[OutboundOptions]) -> Vec<Arc<dyn Outbound>> {
        let mut taken = self.taken_tags();
        let mut outbounds: Vec<Arc<dyn Outbound>> = Vec::new();
        for (index, record) in options.iter().enumerate() {
            if !is_proxy_type(&record.outbound_type) {
                continue;
            }
            let mut record = record.clone();
            let mut tag = if record.tag.is_empty() {
                format!("[{}]{}", self.tag, index)
            } else {
                record.tag.clone()
            };
            if taken.contains(&tag) {
                let mut suffix = 1;
                loop {
                    let candidate = format!("{}[{}]", tag, suffix);
                    if !taken.contains(&candidate) {
                        tag = candidate;
                        break;
                    }
                    suffix += 1;
                }
            }
            taken.insert(tag.clone());
            record.tag = tag.clone();
            match new_outbound(&self.router, &tag, &record) {
                Ok(outbound) => outbounds.push(outbound),
                Err(err) => warn!(
                    "create provider[{}] outbound[{}]/{} failed: {}",
                    self.tag, tag, record.outbound_type, err
                ),
            }
        }
        if !options.is_empty() && outbounds.is_empty() {
            warn!("parse provider[{}] failed: missing valid outbound", self.tag);
        }
        outbounds
    }

    async fn start_outbounds(&self, outbounds: &[Arc<dyn Outbound>]) -> Result<()> {
        for (index, outbound) in outbounds.iter().enumerate() {
            if let Err(err) = outbound.start().await {
                for started in &outbounds[..index] {
                    let _ = started.close().await;
                }
                return Err(Error::start(format!(
                    "initialize outbound provider[{}] outbound/{}[{}]: {}",
                    self.tag,
                    outbound.outbound_type(),
                    outbound.tag(),
                    err
                )));
            }
        }
        Ok(())
    }

    /// Initial load: children built and recorded but not yet swapped live.
    pub async fn load_initial(&self, parsed: Vec<OutboundOptions>, update_time: DateTime<Utc>,
        sub_info: Option<SubscriptionInfo>) -> Result<()> {
        let Some(options) = self.prepare_options(parsed) else {
            return Ok(());
        };
        let outbounds = self.create_outbounds(&options);
        self.start_outbounds(&outbounds).await?;
        let by_tag = outbounds
            .iter()
            .map(|outbound| (outbound.tag().to_string(), outbound.clone()))
            .collect();
        let mut state = self.state.write();
        state.outbounds = outbounds;
        state.by_tag = by_tag;
        state.last_options = options;
        state.update_time = update_time;
        if let Some(sub_info) = sub_info {
            state.sub_info = sub_info;
        }
        Ok(())
    }

    /// Full refresh from already-decoded content. Returns whether the child
    /// set actually changed. The swap is atomic for consumers and rolled
    /// back when a new child fails to start or a group rejects the update.
    pub async fn update_from_content(&self, content: &str) -> Result<bool> {
        let parsed = parser::parse_subscription(content)?;
        let Some(options) = self.prepare_options(parsed) else {
            debug!("provider {} has no changes", self.tag);
            return Ok(false);
        };
        let outbounds = self.create_outbounds(&options);
        self.start_outbounds(&outbounds).await?;
        let by_tag: HashMap<String, Arc<dyn Outbound>> = outbounds
            .iter()
            .map(|outbound| (outbound.tag().to_string(), outbound.clone()))
            .collect();

        let (backup_outbounds, backup_by_tag) = {
            let mut state = self.state.write();
            let backup = (state.outbounds.clone(), state.by_tag.clone());
            state.outbounds = outbounds.clone();
            state.by_tag = by_tag;
            state.last_options = options;
            backup
        };

        if let Err(err) = self.update_groups().await {
            for outbound in &outbounds {
                let _ = outbound.close().await;
            }
            let mut state = self.state.write();
            state.outbounds = backup_outbounds;
            state.by_tag = backup_by_tag;
            return Err(err);
        }
        for outbound in backup_outbounds {
            let _ = outbound.close().await;
        }
        Ok(true)
    }

    async fn update_groups(&self) -> Result<()> {
        for outbound in self.router.outbounds() {
            if let Some(group) = outbound.as_group() {
                debug!(
                    "update outbound group[{}] with outbound provider[{}]",
                    outbound.tag(),
                    self.tag
                );
                group.update_outbounds(&self.tag).await.map_err(|err| {
                    Error::internal(format!(
                        "update outbound group[{}] with outbound provider[{}]: {}",
                        outbound.tag(),
                        self.tag,
                        err
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Probe every child, cap in-flight probes, write results to the shared
    /// history store, then let groups re-evaluate their selections.
    pub async fn healthcheck(&self, link: Option<&str>, force: bool) -> Result<HashMap<String, u16>> {
        let mut result = HashMap::new();
        if self.checking.swap(true, Ordering::SeqCst) {
            return Ok(result);
        }
        let run = async {
            {
                let mut last = self.last_healthcheck.lock();
                if !force {
                    if let Some(at) = *last {
                        if at.elapsed() < self.healthcheck_interval {
                            return;
                        }
                    }
                }
                *last = Some(Instant::now());
            }
            self.router.pause().wait_active().await;
            let link = link
                .filter(|link| !link.is_empty())
                .unwrap_or(&self.healthcheck_url)
                .to_string();
            let history = self.router.history();
            let outbounds = self.outbounds();
            let mut seen = HashSet::new();
            let jobs: Vec<_> = outbounds
                .into_iter()
                .filter(|outbound| seen.insert(outbound.tag().to_string()))
                .collect();
            let mut probe_futs: Vec<
                std::pin::Pin<Box<dyn std::future::Future<Output = Option<(String, u16)>> + Send>>,
            > = Vec::new();
            for outbound in jobs.into_iter() {
                let link = link.clone();
                let history = history.clone();
                probe_futs.push(Box::pin(async move {
                    let tag = outbound.tag().to_string();
                    match url_test(outbound.as_ref(), &link, TCP_TIMEOUT).await {
                        Ok(delay) => {
                            debug!("outbound {} available: {}ms", tag, delay);
                            history.store(&tag, delay);
                            Some((tag, delay))
                        }
                        Err(err) => {
                            debug!("outbound {} unavailable: {}", tag, err);
                            history.delete(&tag);
                            None
                        }
                    }
                }));
            }
            let probes = futures::stream::iter(probe_futs)
            .buffer_unordered(HEALTHCHECK_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
            for probe in probes.into_iter().flatten() {
                result.insert(probe.0, probe.1);
            }
            for outbound in self.router.outbounds() {
                if let Some(group) = outbound.as_group() {
                    group.refresh_selected();
                }
            }
        };
        run.await;
        self.checking.store(false, Ordering::SeqCst);
        Ok(result)
    }

    /// Probe then refresh group selections; used after updates and on
    /// interface changes.
    pub async fn check_outbounds(&self, force: bool) {
        let _ = self.healthcheck(None, force).await;
    }

    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(());
        for outbound in self.outbounds() {
            let _ = outbound.close().await;
        }
        Ok(())
    }
}

/// Deep comparison with the previous successful parse, keyed by tag.
fn options_changed(last: &[OutboundOptions], current: &[OutboundOptions]) -> bool {
    if last.len() != current.len() {
        return true;
    }
    let by_tag: HashMap<&str, &OutboundOptions> = last
        .iter()
        .map(|outbound| (outbound.tag.as_str(), outbound))
        .collect();
    !current.iter().all(|outbound| {
        by_tag
            .get(outbound.tag.as_str())
            .map(|previous| *previous == outbound)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tag: &str, port: u16) -> OutboundOptions {
        serde_json::from_str(&format!(
            r#"{{"type": "trojan", "tag": "{}", "server": "x.example", "server_port": {}, "password": "pw"}}"#,
            tag, port
        ))
        .unwrap()
    }

    #[test]
    fn test_options_changed() {
        let a = vec![record("a", 443), record("b", 443)];
        let same = vec![record("b", 443), record("a", 443)];
        // Order does not matter, content does.
        assert!(!options_changed(&a, &same));
        assert!(options_changed(&a, &[record("a", 443)]));
        assert!(options_changed(&a, &[record("a", 443), record("b", 8443)]));
        assert!(options_changed(&a, &[record("a", 443), record("c", 443)]));
    }
}
