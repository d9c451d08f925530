//! File-backed provider: re-reads the subscription file when its
//! modification time moves.

use super::parser::{self, SubscriptionInfo};
use super::{OutboundProvider, ProviderAdapter};
use crate::config::ProviderOptions;
use crate::constant::PROVIDER_TICK_INTERVAL;
use crate::outbound::Outbound;
use crate::router::Router;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn, Instrument};

pub struct FileProvider {
    adapter: ProviderAdapter,
    weak: Weak<FileProvider>,
}

struct FileContent {
    sub_info: Option<SubscriptionInfo>,
    content: String,
    modified: DateTime<Utc>,
}

impl FileProvider {
    pub fn new(router: Arc<Router>, options: &ProviderOptions) -> Result<Arc<Self>> {
        let adapter = ProviderAdapter::new(router, options)?;
        Ok(Arc::new_cyclic(|weak| FileProvider {
            adapter,
            weak: weak.clone(),
        }))
    }

    fn read_file(&self) -> Result<Option<FileContent>> {
        let metadata = match std::fs::metadata(&self.adapter.path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let modified = DateTime::<Utc>::from(metadata.modified()?);
        let raw = std::fs::read_to_string(&self.adapter.path)?;
        let (sub_info, content) = parser::decode_content(&raw);
        Ok(Some(FileContent {
            sub_info,
            content,
            modified,
        }))
    }

    async fn update_inner(&self, force: bool) -> Result<()> {
        debug!(
            "updating outbound provider {} from local file",
            self.adapter.tag
        );
        let Some(file) = self.read_file()? else {
            return Ok(());
        };
        if !force && file.modified == self.adapter.update_time() {
            return Ok(());
        }
        if file.content.is_empty() {
            return Ok(());
        }
        let updated = self.adapter.update_from_content(&file.content).await?;
        {
            let mut state = self.adapter.state.write();
            if let Some(sub_info) = file.sub_info {
                state.sub_info = sub_info;
            }
            state.update_time = file.modified;
        }
        info!("update outbound provider {} success", self.adapter.tag);
        if updated {
            self.adapter.check_outbounds(true).await;
        }
        Ok(())
    }
}

#[async_trait]
impl OutboundProvider for FileProvider {
    fn tag(&self) -> &str {
        &self.adapter.tag
    }

    fn provider_type(&self) -> &'static str {
        "file"
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
        let Some(file) = self.read_file()? else {
            return Ok(());
        };
        if file.content.is_empty() {
            return Ok(());
        }
        let parsed = parser::parse_subscription(&file.content)?;
        self.adapter
            .load_initial(parsed, file.modified, file.sub_info)
            .await
    }

    async fn post_start(&self) -> Result<()> {
        let weak = self.weak.clone();
        let mut shutdown = self.adapter.shutdown.subscribe();
        tokio::spawn(async move {
            if let Some(provider) = weak.upgrade() {
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
                "updating outbound provider {} from local file: {}",
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
