//! Outbound adapters.
//!
//! Every egress — leaf protocol or group — implements [`Outbound`]. Leaves
//! kept in-core are the plain-text set (direct, block, HTTP CONNECT,
//! SOCKS5); encrypted protocols live behind external adapters and are only
//! understood at the options level.

mod block;
mod direct;
mod http;
mod socks5;

pub use block::Block;
pub use direct::Direct;
pub use http::HttpOutbound;
pub use socks5::Socks5Outbound;

use crate::common::metadata::{Destination, FlowMetadata, Network};
use crate::config::OutboundOptions;
use crate::group::OutboundGroup;
use crate::router::Router;
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Outbound types constructible in-core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundType {
    Direct,
    Block,
    Http,
    Socks,
    Selector,
    UrlTest,
}

impl OutboundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundType::Direct => "direct",
            OutboundType::Block => "block",
            OutboundType::Http => "http",
            OutboundType::Socks => "socks",
            OutboundType::Selector => "selector",
            OutboundType::UrlTest => "urltest",
        }
    }
}

impl fmt::Display for OutboundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proxy protocol type names accepted by provider/group `types` filters.
/// Non-proxy types (direct, block, dns, groups) are never listed here.
pub fn is_proxy_type(name: &str) -> bool {
    matches!(
        name,
        "http"
            | "socks"
            | "shadowsocks"
            | "shadowsocksr"
            | "vmess"
            | "vless"
            | "trojan"
            | "shadowtls"
            | "hysteria"
            | "hysteria2"
            | "tuic"
            | "wireguard"
            | "ssh"
            | "tor"
    )
}

/// Stream handed out by outbounds and dialers.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// True while the underlying transport has not completed its handshake.
    fn needs_handshake(&self) -> bool {
        false
    }

    /// True when the first write is special (lazy dial carrying payload),
    /// letting upstream copiers front-load their first buffer.
    fn lazy_headroom(&self) -> bool {
        false
    }
}

impl ProxyStream for tokio::net::TcpStream {}
impl ProxyStream for tokio::io::DuplexStream {}
impl<S: ProxyStream> ProxyStream for tokio_rustls::client::TlsStream<S> {}

impl ProxyStream for Box<dyn ProxyStream> {
    fn needs_handshake(&self) -> bool {
        (**self).needs_handshake()
    }

    fn lazy_headroom(&self) -> bool {
        (**self).lazy_headroom()
    }
}

/// Datagram socket handed out by outbounds and dialers.
#[async_trait]
pub trait OutboundDatagram: Send + Sync {
    async fn send_to(&self, buf: &[u8], destination: &Destination) -> Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Destination)>;
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Plain UDP socket as an [`OutboundDatagram`].
pub struct UdpDatagram(pub Arc<tokio::net::UdpSocket>);

#[async_trait]
impl OutboundDatagram for UdpDatagram {
    async fn send_to(&self, buf: &[u8], destination: &Destination) -> Result<usize> {
        let addr = destination
            .socket_addr()
            .ok_or_else(|| Error::address(format!("unresolved destination: {}", destination)))?;
        Ok(self.0.send_to(buf, addr).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Destination)> {
        let (n, from) = self.0.recv_from(buf).await?;
        Ok((n, Destination::from(from)))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.0.local_addr()?)
    }
}

/// Uniform egress contract.
#[async_trait]
pub trait Outbound: Send + Sync {
    fn tag(&self) -> &str;

    fn outbound_type(&self) -> OutboundType;

    /// Networks this outbound can carry.
    fn networks(&self) -> Vec<Network>;

    /// Server port, for port filters. Zero means any.
    fn port(&self) -> u16 {
        0
    }

    async fn connect(
        &self,
        network: Network,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyStream>>;

    async fn listen_packet(&self, destination: &Destination) -> Result<Box<dyn OutboundDatagram>>;

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Runs after every outbound is registered, so groups can resolve
    /// member tags here.
    async fn post_start(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        None
    }

    /// Own an accepted inbound connection: connect upstream and copy bytes
    /// both ways until either side closes.
    async fn handle_connection(
        &self,
        conn: Box<dyn ProxyStream>,
        metadata: &FlowMetadata,
    ) -> Result<()> {
        let destination = metadata
            .destination
            .clone()
            .ok_or_else(|| Error::address("missing destination"))?;
        let upstream = self.connect(Network::Tcp, &destination).await?;
        let mut conn = conn;
        let mut upstream = upstream;
        tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
        Ok(())
    }
}

/// Shared identity record carried by every concrete outbound.
#[derive(Debug, Clone)]
pub struct OutboundAdapter {
    pub tag: String,
    pub outbound_type: OutboundType,
    pub networks: Vec<Network>,
    pub port: u16,
}

impl OutboundAdapter {
    pub fn new(tag: &str, outbound_type: OutboundType, networks: Vec<Network>) -> Self {
        OutboundAdapter {
            tag: tag.to_string(),
            outbound_type,
            networks,
            port: 0,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Tag of the leaf an outbound currently forwards through: groups report
/// their live selection, leaves report themselves.
pub fn real_tag(outbound: &dyn Outbound) -> String {
    match outbound.as_group() {
        Some(group) => group.now(),
        None => outbound.tag().to_string(),
    }
}

/// Construct a leaf or group outbound from options.
pub fn new_outbound(
    router: &Arc<Router>,
    tag: &str,
    options: &OutboundOptions,
) -> Result<Arc<dyn Outbound>> {
    match options.outbound_type.as_str() {
        "direct" => Ok(Arc::new(Direct::new(router, tag, options.dialer.clone())?)),
        "block" => Ok(Arc::new(Block::new(tag))),
        "http" => Ok(Arc::new(HttpOutbound::new(router, tag, options)?)),
        "socks" => Ok(Arc::new(Socks5Outbound::new(router, tag, options)?)),
        "selector" => Ok(Arc::new(crate::group::Selector::new(
            router.clone(),
            tag,
            options.group_options()?,
        )?)),
        "urltest" => Ok(crate::group::UrlTest::new(
            router.clone(),
            tag,
            options.group_options()?,
        )?),
        other => Err(Error::config(format!("unknown outbound type: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_type_filter() {
        assert!(is_proxy_type("vmess"));
        assert!(is_proxy_type("socks"));
        assert!(!is_proxy_type("direct"));
        assert!(!is_proxy_type("block"));
        assert!(!is_proxy_type("selector"));
        assert!(!is_proxy_type("urltest"));
        assert!(!is_proxy_type("dns"));
    }

    #[test]
    fn test_outbound_type_display() {
        assert_eq!(OutboundType::Selector.to_string(), "selector");
        assert_eq!(OutboundType::Http.to_string(), "http");
    }
}
