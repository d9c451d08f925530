//! HTTP subscription provider: conditional GET through a detour outbound,
//! with the response body persisted to disk behind a subscription-info
//! comment line.

use super::parser::{self, SubscriptionInfo};
use super::{OutboundProvider, ProviderAdapter};
use crate::common::base64::decode_base64_safe;
use crate::common::http::{fetch, FetchRequest};
use crate::common::metadata::Network;
use crate::config::ProviderOptions;
use crate::constant::{default_user_agent, DEFAULT_DOWNLOAD_INTERVAL, PROVIDER_TICK_INTERVAL};
use crate::outbound::Outbound;
use crate::router::Router;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpProvider {
    adapter: ProviderAdapter,
    weak: Weak<HttpProvider>,
    url: String,
    user_agent: String,
    interval: Duration,
    detour: String,
    last_updated: Mutex<DateTime<Utc>>,
    last_etag: Mutex<String>,
}

impl HttpProvider {
    pub fn new(router: Arc<Router>, options: &ProviderOptions) -> Result<Arc<Self>> {
        if options.url.is_empty() {
            return Err(Error::config("missing url"));
        }
        let url = if options.url.contains("://") {
            options.url.clone()
        } else {
            format!("http://{}", options.url)
        };
        let user_agent = if options.user_agent.is_empty() {
            default_user_agent()
        } else {
            options.user_agent.clone()
        };
        let interval = options
            .interval
            .map(|d| d.get())
            .filter(|d| *d >= DEFAULT_DOWNLOAD_INTERVAL)
            .unwrap_or(DEFAULT_DOWNLOAD_INTERVAL);
        let adapter = ProviderAdapter::new(router, options)?;
        let detour = options.detour.clone();
        Ok(Arc::new_cyclic(|weak| HttpProvider {
            adapter,
            weak: weak.clone(),
            url,
            user_agent,
            interval,
            detour,
            last_updated: Mutex::new(DateTime::<Utc>::UNIX_EPOCH),
            last_etag: Mutex::new(String::new()),
        }))
    }

    fn download_detour(&self) -> Result<Arc<dyn Outbound>> {
        if !self.detour.is_empty() {
            return self
                .adapter
                .router
                .outbound_with_provider(&self.detour)
                .ok_or_else(|| Error::config(format!("download_detour not found: {}", self.detour)));
        }
        self.adapter.router.default_outbound(Network::Tcp)
    }

    /// Rewrite the cached file's subscription-info comment, bumping its
    /// modification time, without touching the member payload.
    fn update_cache_file(&self, sub_info: SubscriptionInfo) -> Result<()> {
        let raw = std::fs::read_to_string(&self.adapter.path).unwrap_or_default();
        let (_, content) = parser::decode_content(&raw);
        let body = format!("{}\n{}", sub_info.to_comment(), content);
        std::fs::write(&self.adapter.path, body)?;
        Ok(())
    }

    async fn fetch_once(&self) -> Result<()> {
        *self.last_updated.lock() = Utc::now();
        let detour = self.download_detour()?;

        let mut request = FetchRequest::new(&self.url, &self.user_agent)?;
        {
            let etag = self.last_etag.lock();
            if !etag.is_empty() {
                request.etag = Some(etag.clone());
            }
        }
        let response = tokio::time::timeout(FETCH_TIMEOUT, fetch(detour.as_ref(), &request))
            .await
            .map_err(Error::from)??;

        let header_info = response
            .subscription_userinfo
            .as_deref()
            .and_then(SubscriptionInfo::parse);

        match response.status {
            200 => {}
            304 => {
                info!("update outbound provider {}: not modified", self.adapter.tag);
                {
                    let mut state = self.adapter.state.write();
                    state.update_time = *self.last_updated.lock();
                    if let Some(sub_info) = header_info {
                        state.sub_info = sub_info;
                    }
                }
                if let Some(sub_info) = header_info {
                    self.update_cache_file(sub_info)?;
                }
                return Ok(());
            }
            status => return Err(Error::internal(format!("unexpected status: {}", status))),
        }

        if response.body.is_empty() {
            return Err(Error::internal("empty response"));
        }
        if let Some(etag) = response.etag {
            *self.last_etag.lock() = etag;
        }

        let raw = String::from_utf8_lossy(&response.body).to_string();
        let mut content = decode_base64_safe(raw.trim());
        let mut sub_info = header_info;
        if sub_info.is_none() {
            let (first, rest) = parser::first_line(&content);
            if let Some(parsed) = SubscriptionInfo::parse(first) {
                sub_info = Some(parsed);
                content = decode_base64_safe(rest);
            }
        }

        let updated = self.adapter.update_from_content(&content).await?;
        {
            let mut state = self.adapter.state.write();
            state.sub_info = sub_info.unwrap_or_default();
            state.update_time = *self.last_updated.lock();
        }
        info!("update outbound provider {} success", self.adapter.tag);

        let body = match sub_info {
            Some(sub_info) => format!("{}\n{}", sub_info.to_comment(), content),
            None => content,
        };
        std::fs::write(&self.adapter.path, body)?;

        if updated {
            self.adapter.check_outbounds(true).await;
        }
        Ok(())
    }

    async fn update_inner(&self, force: bool) -> Result<()> {
        if !force {
            let age = Utc::now() - *self.last_updated.lock();
            if age.to_std().unwrap_or_default() < self.interval {
                return Ok(());
            }
        }
        debug!(
            "update outbound provider {} from network",
            self.adapter.tag
        );
        self.fetch_once().await
    }
}

#[async_trait]
impl OutboundProvider for HttpProvider {
    fn tag(&self) -> &str {
        &self.adapter.tag
    }

    fn provider_type(&self) -> &'static str {
        "http"
    }

    fn path(&self) -> &Path {
        &self.adapter.path
    }

    fn update_time(&self) -> DateTime<Utc> {
        self.adapter.update_time()
    }

    fn sub_info(&self) -> SubscriptionInfo {
        self.adapter.sub_info()
    }

    fn outbounds(&self) -> Vec<Arc<dyn Outbound>> {
        self.adapter.outbounds()
    }

    fn outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        self.adapter.outbound(tag)
    }

    async fn start(&self) -> Result<()> {
        let metadata = match std::fs::metadata(&self.adapter.path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let modified = DateTime::<Utc>::from(metadata.modified()?);
        let raw = std::fs::read_to_string(&self.adapter.path)?;
        let (sub_info, content) = parser::decode_content(&raw);
        if content.is_empty() {
            return Ok(());
        }
        let parsed = parser::parse_subscription(&content)?;
        self.adapter.load_initial(parsed, modified, sub_info).await?;
        *self.last_updated.lock() = modified;
        Ok(())
    }

    async fn post_start(&self) -> Result<()> {
        let weak = self.weak.clone();
        let mut shutdown = self.adapter.shutdown.subscribe();
        tokio::spawn(async move {
            if let Some(provider) = weak.upgrade() {
                let never_loaded =
                    provider.update_time() == DateTime::<Utc>::UNIX_EPOCH;
                let _ = provider.update(never_loaded).await;
                provider.adapter.check_outbounds(true).await;
            }
            let mut ticker = tokio::time::interval(PROVIDER_TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(provider) = weak.upgrade() else { break };
                        provider.adapter.router.pause().wait_active().await;
                        let _ = provider.update(false).await;
                        if provider.adapter.enable_healthcheck {
                            provider.adapter.check_outbounds(false).await;
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
        Ok(())
    }

    async fn update(&self, force: bool) -> Result<()> {
        if self.adapter.updating.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("provider is updating"));
        }
        let span = tracing::debug_span!("provider", id = %uuid::Uuid::new_v4());
        let result = self.update_inner(force).instrument(span).await;
        self.adapter.updating.store(false, Ordering::SeqCst);
        if let Err(err) = &result {
            warn!(
                "update outbound provider {} failed: {}",
                self.adapter.tag, err
            );
        }
        result
    }

    async fn healthcheck(&self, link: Option<&str>, force: bool) -> Result<HashMap<String, u16>> {
        self.adapter.healthcheck(link, force).await
    }

    fn interface_updated(&self) {
        if !self.adapter.enable_healthcheck {
            return;
        }
        let weak = self.weak.clone();
        tokio::spawn(async move {
            if let Some(provider) = weak.upgrade() {
                provider.adapter.check_outbounds(true).await;
            }
        });
    }

    async fn close(&self) -> Result<()> {
        self.adapter.close().await
    }
}
