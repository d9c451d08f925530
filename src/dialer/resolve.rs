//! Resolve-then-dial wrapper.
//!
//! IP destinations pass straight through. FQDN destinations are resolved
//! through the DNS router (or the dialer's configured server addresses),
//! dialed serially or with happy-eyeballs, and the last working address is
//! remembered when `store_last_ip` is on.

use super::Dialer;
use crate::common::metadata::{Destination, Network};
use crate::config::{DialerOptions, DomainStrategy};
use crate::outbound::{OutboundDatagram, ProxyStream};
use crate::router::Router;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_millis(300);

pub struct ResolveDialer {
    router: Arc<Router>,
    dialer: Arc<dyn Dialer>,
    addresses: Vec<IpAddr>,
    parallel: bool,
    strategy: DomainStrategy,
    fallback_delay: Duration,
    is_direct: bool,
    store_last_ip: bool,
    dial_prefer: Mutex<Option<IpAddr>>,
    listen_prefer: Mutex<Option<IpAddr>>,
}

impl ResolveDialer {
    pub fn new(
        router: Arc<Router>,
        dialer: Arc<dyn Dialer>,
        options: &DialerOptions,
        parallel: bool,
        is_direct: bool,
    ) -> Self {
        let mut addresses = Vec::new();
        for address in &options.server_addresses {
            if !addresses.contains(address) {
                addresses.push(*address);
            }
        }
        ResolveDialer {
            router,
            dialer,
            addresses,
            parallel,
            strategy: options.domain_strategy,
            fallback_delay: options
                .fallback_delay
                .map(|d| d.get())
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_FALLBACK_DELAY),
            is_direct,
            store_last_ip: options.store_last_ip,
            dial_prefer: Mutex::new(None),
            listen_prefer: Mutex::new(None),
        }
    }

    async fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>> {
        self.router.lookup(domain, self.strategy).await
    }

    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>> {
        if !self.is_direct && !self.addresses.is_empty() {
            return Ok(self.addresses.clone());
        }
        self.lookup(domain).await
    }

    /// Interleave families, preferred one first, for staggered dialing.
    fn ordered(&self, addresses: &[IpAddr]) -> Vec<IpAddr> {
        let prefer_v6 = self.strategy == DomainStrategy::PreferIpv6;
        let (preferred, fallback): (Vec<IpAddr>, Vec<IpAddr>) = addresses
            .iter()
            .copied()
            .partition(|addr| addr.is_ipv6() == prefer_v6);
        let mut out = Vec::with_capacity(addresses.len());
        let mut a = preferred.into_iter();
        let mut b = fallback.into_iter();
        loop {
            match (a.next(), b.next()) {
                (None, None) => break,
                (first, second) => {
                    out.extend(first);
                    out.extend(second);
                }
            }
        }
        out
    }

    async fn dial_serial(
        &self,
        network: Network,
        destination: &Destination,
        addresses: &[IpAddr],
    ) -> Result<(Box<dyn ProxyStream>, IpAddr)> {
        let mut last_err = None;
        for addr in self.ordered(addresses) {
            match self
                .dialer
                .connect(network, &destination.with_ip(addr))
                .await
            {
                Ok(stream) => return Ok((stream, addr)),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::dns(format!("no addresses for {}", destination))))
    }

    /// Happy-eyeballs: attempts start `fallback_delay` apart in interleaved
    /// family order; the first success wins and the rest are dropped.
    async fn dial_parallel(
        &self,
        network: Network,
        destination: &Destination,
        addresses: &[IpAddr],
    ) -> Result<(Box<dyn ProxyStream>, IpAddr)> {
        let ordered = self.ordered(addresses);
        if ordered.is_empty() {
            return Err(Error::dns(format!("no addresses for {}", destination)));
        }
        let mut attempts = FuturesUnordered::new();
        for (index, addr) in ordered.into_iter().enumerate() {
            let dialer = self.dialer.clone();
            let target = destination.with_ip(addr);
            let delay = self.fallback_delay * index as u32;
            attempts.push(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                dialer
                    .connect(network, &target)
                    .await
                    .map(|stream| (stream, addr))
            });
        }
        let mut last_err = None;
        while let Some(result) = attempts.next().await {
            match result {
                Ok(win) => return Ok(win),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::connection("parallel dial failed")))
    }

    async fn dial_resolved(
        &self,
        network: Network,
        destination: &Destination,
        addresses: &[IpAddr],
    ) -> Result<(Box<dyn ProxyStream>, IpAddr)> {
        if self.parallel {
            self.dial_parallel(network, destination, addresses).await
        } else {
            self.dial_serial(network, destination, addresses).await
        }
    }
}

#[async_trait]
impl Dialer for ResolveDialer {
    async fn connect(
        &self,
        network: Network,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyStream>> {
        let Some(domain) = destination.fqdn().map(str::to_string) else {
            return self.dialer.connect(network, destination).await;
        };
        let mut addresses = self.resolve(&domain).await?;
        if self.is_direct || !self.store_last_ip {
            return Ok(self.dial_resolved(network, destination, &addresses).await?.0);
        }

        let prefer = *self.dial_prefer.lock();
        if let Some(prefer) = prefer {
            if addresses.contains(&prefer) {
                addresses.retain(|addr| *addr != prefer);
                match self
                    .dialer
                    .connect(network, &destination.with_ip(prefer))
                    .await
                {
                    Ok(stream) => return Ok(stream),
                    Err(err) if addresses.is_empty() => return Err(err),
                    Err(_) => {}
                }
            }
        }
        let (stream, addr) = self.dial_resolved(network, destination, &addresses).await?;
        *self.dial_prefer.lock() = Some(addr);
        Ok(stream)
    }

    async fn listen_packet(&self, destination: &Destination) -> Result<Box<dyn OutboundDatagram>> {
        let Some(domain) = destination.fqdn().map(str::to_string) else {
            return self.dialer.listen_packet(destination).await;
        };
        let mut addresses = self.resolve(&domain).await?;

        if !self.is_direct && self.store_last_ip {
            let prefer = *self.listen_prefer.lock();
            if let Some(prefer) = prefer {
                if addresses.contains(&prefer) {
                    addresses.retain(|addr| *addr != prefer);
                    match self
                        .dialer
                        .listen_packet(&destination.with_ip(prefer))
                        .await
                    {
                        Ok(conn) => {
                            return Ok(Box::new(NatDatagram::new(
                                conn,
                                destination.clone(),
                                destination.with_ip(prefer),
                            )))
                        }
                        Err(err) if addresses.is_empty() => return Err(err),
                        Err(_) => {}
                    }
                }
            }
        }

        let mut last_err = None;
        for addr in self.ordered(&addresses) {
            match self
                .dialer
                .listen_packet(&destination.with_ip(addr))
                .await
            {
                Ok(conn) => {
                    if !self.is_direct && self.store_last_ip {
                        *self.listen_prefer.lock() = Some(addr);
                    }
                    return Ok(Box::new(NatDatagram::new(
                        conn,
                        destination.clone(),
                        destination.with_ip(addr),
                    )));
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::dns(format!("no addresses for {}", destination))))
    }
}

/// Presents the FQDN as the peer while sending to its resolved address.
pub struct NatDatagram {
    inner: Box<dyn OutboundDatagram>,
    fqdn: Destination,
    resolved: Destination,
}

impl NatDatagram {
    pub fn new(inner: Box<dyn OutboundDatagram>, fqdn: Destination, resolved: Destination) -> Self {
        NatDatagram {
            inner,
            fqdn,
            resolved,
        }
    }
}

#[async_trait]
impl OutboundDatagram for NatDatagram {
    async fn send_to(&self, buf: &[u8], destination: &Destination) -> Result<usize> {
        if destination == &self.fqdn {
            return self.inner.send_to(buf, &self.resolved).await;
        }
        self.inner.send_to(buf, destination).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Destination)> {
        let (n, from) = self.inner.recv_from(buf).await?;
        if from == self.resolved {
            return Ok((n, self.fqdn.clone()));
        }
        Ok((n, from))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_interleaves_families() {
        let router = Router::for_tests();
        let dialer: Arc<dyn Dialer> = Arc::new(
            crate::dialer::DefaultDialer::new(None, &DialerOptions::default()).unwrap(),
        );
        let options = DialerOptions {
            domain_strategy: DomainStrategy::PreferIpv6,
            ..Default::default()
        };
        let resolve = ResolveDialer::new(router, dialer, &options, true, false);

        let v4a: IpAddr = "192.0.2.1".parse().unwrap();
        let v4b: IpAddr = "192.0.2.2".parse().unwrap();
        let v6a: IpAddr = "2001:db8::1".parse().unwrap();
        let ordered = resolve.ordered(&[v4a, v4b, v6a]);
        assert_eq!(ordered, vec![v6a, v4a, v4b]);
    }

    #[test]
    fn test_server_addresses_deduplicated() {
        let router = Router::for_tests();
        let dialer: Arc<dyn Dialer> = Arc::new(
            crate::dialer::DefaultDialer::new(None, &DialerOptions::default()).unwrap(),
        );
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let options = DialerOptions {
            server_addresses: vec![ip, ip],
            ..Default::default()
        };
        let resolve = ResolveDialer::new(router, dialer, &options, false, false);
        assert_eq!(resolve.addresses.len(), 1);
    }
}
