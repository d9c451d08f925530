//! Dialing core.
//!
//! [`DefaultDialer`] produces bound sockets with retry and optional
//! concurrent dial; [`ResolveDialer`] layers FQDN resolution, happy-eyeballs
//! and last-IP affinity on top. `new_dialer` wires the two the same way for
//! every outbound.

mod default;
mod resolve;
mod tfo;

pub use default::DefaultDialer;
pub use resolve::ResolveDialer;
pub use tfo::LazyConnect;

use crate::common::metadata::{Destination, Network};
use crate::config::{DialerOptions, DomainStrategy};
use crate::outbound::{OutboundDatagram, ProxyStream};
use crate::router::Router;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Global switch for the 3-way parallel retry chains.
static CONCURRENT_DIAL: AtomicBool = AtomicBool::new(false);

pub fn set_concurrent_dial(enabled: bool) {
    CONCURRENT_DIAL.store(enabled, Ordering::Relaxed);
}

pub(crate) fn concurrent_dial_enabled() -> bool {
    CONCURRENT_DIAL.load(Ordering::Relaxed)
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn connect(
        &self,
        network: Network,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyStream>>;

    async fn listen_packet(&self, destination: &Destination) -> Result<Box<dyn OutboundDatagram>>;
}

/// Dialer that forwards through another outbound, resolved by tag at dial
/// time so construction order does not matter.
pub struct DetourDialer {
    router: Arc<Router>,
    detour: String,
}

impl DetourDialer {
    pub fn new(router: Arc<Router>, detour: &str) -> Self {
        DetourDialer {
            router,
            detour: detour.to_string(),
        }
    }

    fn outbound(&self) -> Result<Arc<dyn crate::outbound::Outbound>> {
        self.router
            .outbound_with_provider(&self.detour)
            .ok_or_else(|| Error::config(format!("detour outbound not found: {}", self.detour)))
    }
}

#[async_trait]
impl Dialer for DetourDialer {
    async fn connect(
        &self,
        network: Network,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyStream>> {
        self.outbound()?.connect(network, destination).await
    }

    async fn listen_packet(&self, destination: &Destination) -> Result<Box<dyn OutboundDatagram>> {
        self.outbound()?.listen_packet(destination).await
    }
}

pub fn new_dialer(router: &Arc<Router>, options: &DialerOptions) -> Result<Arc<dyn Dialer>> {
    new(router, options, false)
}

/// Variant for direct outbounds: configured server addresses are ignored
/// and lookups use the default router path.
pub fn new_direct_dialer(router: &Arc<Router>, options: &DialerOptions) -> Result<Arc<dyn Dialer>> {
    new(router, options, true)
}

fn new(router: &Arc<Router>, options: &DialerOptions, is_direct: bool) -> Result<Arc<dyn Dialer>> {
    if options.is_wireguard_listener {
        return Ok(Arc::new(DefaultDialer::new(Some(router), options)?));
    }
    let dialer: Arc<dyn Dialer> = if options.detour.is_empty() {
        Arc::new(DefaultDialer::new(Some(router), options)?)
    } else {
        Arc::new(DetourDialer::new(router.clone(), &options.detour))
    };
    let strategy = options.domain_strategy;
    let needs_resolve = strategy != DomainStrategy::AsIs
        || options.detour.is_empty()
        || (!is_direct && !options.server_addresses.is_empty());
    if !needs_resolve {
        return Ok(dialer);
    }
    let parallel =
        options.detour.is_empty() && !options.tcp_fast_open && strategy != DomainStrategy::AsIs;
    Ok(Arc::new(ResolveDialer::new(
        router.clone(),
        dialer,
        options,
        parallel,
        is_direct,
    )))
}
