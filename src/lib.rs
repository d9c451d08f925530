//! routebox - multi-protocol userspace proxy/router runtime
//!
//! The crate is organized around four subsystems behind a [`Gateway`]
//! lifecycle facade:
//!
//! ```text
//!                  +-------------+
//!                  |   Gateway   |  new -> pre_start -> start -> close
//!                  +------+------+
//!                         |
//!          +--------------+---------------+
//!          |              |               |
//!   +------v-----+ +------v------+ +------v------+
//!   |  provider/ | |   group/    | |    dns/     |
//!   | (file/http)| | (selector,  | | (rules,     |
//!   |            | |  urltest)   | |  transports)|
//!   +------+-----+ +------+------+ +------+------+
//!          |              |               |
//!          +--------------+---------------+
//!                         |
//!                  +------v------+
//!                  |   dialer/   |
//!                  +-------------+
//! ```
//!
//! Inbound listener protocols, sniffing, geodata loading and management
//! APIs are collaborator surfaces; see the traits on [`router::Router`].

pub mod common;
pub mod config;
pub mod constant;
pub mod dialer;
pub mod dns;
pub mod group;
pub mod outbound;
pub mod provider;
pub mod router;

pub use common::error::{Error, Result};
pub use common::metadata::{Destination, FlowMetadata, Network};
pub use config::Options;

use common::cachefile::JsonCacheFile;
use outbound::{new_outbound, Outbound};
use provider::{new_provider, OutboundProvider};
use router::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub const VERSION: &str = constant::VERSION;

const DEFAULT_CACHE_PATH: &str = "cache.json";

/// Top-level service owning the router, static outbounds, groups and
/// providers, and driving their shared lifecycle.
pub struct Gateway {
    router: Arc<Router>,
    outbounds: Vec<Arc<dyn Outbound>>,
    providers: Vec<Arc<dyn OutboundProvider>>,
    created_at: Instant,
    pre_started: AtomicBool,
    closed: AtomicBool,
}

impl Gateway {
    pub fn new(options: Options) -> Result<Self> {
        let created_at = Instant::now();
        let router = Router::new(&options)?;

        // Selection persistence is only consulted when both flags are on.
        if options.experimental.cache_file.enabled && options.experimental.cache_file.store_selected
        {
            let path = if options.experimental.cache_file.path.is_empty() {
                DEFAULT_CACHE_PATH
            } else {
                options.experimental.cache_file.path.as_str()
            };
            router.set_cache_file(Arc::new(JsonCacheFile::open(path)?));
            info!("cache file loaded from {}", path);
        }

        for inbound in &options.inbounds {
            router.register_inbound_tag(&inbound.tag);
        }

        let mut providers = Vec::with_capacity(options.outbound_providers.len());
        for (index, provider_options) in options.outbound_providers.iter().enumerate() {
            let mut provider_options = provider_options.clone();
            if provider_options.tag.is_empty() {
                provider_options.tag = index.to_string();
            }
            let provider = new_provider(&router, &provider_options)
                .map_err(|err| Error::config(format!("parse outbound provider[{}]: {}", index, err)))?;
            router.register_provider(provider.clone())?;
            providers.push(provider);
        }

        // The sentinel is installed before any configured outbound so a
        // group whose filter matches nothing always has a target.
        let outboundless: Arc<dyn Outbound> = Arc::new(outbound::Direct::new(
            &router,
            constant::OUTBOUNDLESS_TAG,
            Default::default(),
        )?);
        router.set_outboundless(outboundless.clone());
        router.register_outbound(outboundless.clone())?;
        let mut outbounds: Vec<Arc<dyn Outbound>> = vec![outboundless];

        for (index, outbound_options) in options.outbounds.iter().enumerate() {
            let tag = if outbound_options.tag.is_empty() {
                index.to_string()
            } else {
                outbound_options.tag.clone()
            };
            let outbound = new_outbound(&router, &tag, outbound_options)
                .map_err(|err| Error::config(format!("parse outbound[{}]: {}", index, err)))?;
            router.register_outbound(outbound.clone())?;
            outbounds.push(outbound);
        }

        Ok(Gateway {
            router,
            outbounds,
            providers,
            created_at,
            pre_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Compile DNS rules, then bring up providers and outbounds, in
    /// dependency order. Idempotent.
    pub async fn pre_start(&self) -> Result<()> {
        if self.pre_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.router.pre_start()?;
        for provider in &self.providers {
            provider.start().await.map_err(|err| {
                Error::start(format!(
                    "initialize outbound provider/{}[{}]: {}",
                    provider.provider_type(),
                    provider.tag(),
                    err
                ))
            })?;
        }
        for outbound in &self.outbounds {
            outbound.start().await.map_err(|err| {
                Error::start(format!(
                    "initialize outbound/{}[{}]: {}",
                    outbound.outbound_type(),
                    outbound.tag(),
                    err
                ))
            })?;
        }
        info!(
            "pre-started ({:.3}s)",
            self.created_at.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Full startup. On any failure the gateway closes what it already
    /// started and returns the first error.
    pub async fn start(&self) -> Result<()> {
        match self.start_inner().await {
            Ok(()) => {
                info!("started ({:.3}s)", self.created_at.elapsed().as_secs_f64());
                Ok(())
            }
            Err(err) => {
                let _ = self.close().await;
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        self.pre_start().await?;
        self.post_start().await
    }

    async fn post_start(&self) -> Result<()> {
        for outbound in &self.outbounds {
            outbound.post_start().await.map_err(|err| {
                Error::start(format!("post-start outbound/{}: {}", outbound.tag(), err))
            })?;
        }
        for provider in &self.providers {
            provider.post_start().await.map_err(|err| {
                Error::start(format!(
                    "post-start outbound provider/{}: {}",
                    provider.tag(),
                    err
                ))
            })?;
        }
        Ok(())
    }

    /// Tear everything down in reverse start order. The first call wins;
    /// later calls observe `AlreadyClosed`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        for outbound in self.outbounds.iter().rev() {
            if let Err(err) = outbound.close().await {
                warn!("close outbound/{}: {}", outbound.tag(), err);
            }
        }
        for provider in self.providers.iter().rev() {
            if let Err(err) = provider.close().await {
                warn!("close provider/{}: {}", provider.tag(), err);
            }
        }
        info!("closed");
        Ok(())
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        self.router.outbound_with_provider(tag)
    }

    pub fn provider(&self, tag: &str) -> Option<Arc<dyn OutboundProvider>> {
        self.router.outbound_provider(tag)
    }
}
