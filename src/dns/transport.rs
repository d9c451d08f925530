//! DNS transports.
//!
//! The rule walk only needs three concrete shapes in-core: plain UDP through
//! a dialer, a fixed-rcode responder, and the FakeIP synthesizer. Encrypted
//! transports plug in through the same trait from the outside.

use super::{fqdn_to_domain, synthesize_response};
use crate::common::metadata::Destination;
use crate::config::DnsServerOptions;
use crate::dialer::{new_dialer, DetourDialer, Dialer};
use crate::config::DialerOptions;
use crate::router::Router;
use crate::{Error, Result};
use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use ipnet::Ipv4Net;
use lru::LruCache;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Udp,
    Rcode,
    FakeIp,
}

#[async_trait]
pub trait DnsTransport: Send + Sync {
    fn tag(&self) -> &str;

    fn transport_type(&self) -> TransportType;

    fn is_fake_ip(&self) -> bool {
        self.transport_type() == TransportType::FakeIp
    }

    async fn exchange(&self, message: &Message) -> Result<Message>;
}

/// Build a transport from server options. The optional strategy rides along
/// in the router's strategy map, not here.
pub fn new_transport(
    router: &Arc<Router>,
    options: &DnsServerOptions,
) -> Result<Arc<dyn DnsTransport>> {
    let address = options.address.trim();
    if address.is_empty() {
        return Err(Error::config(format!(
            "dns server [{}] missing address",
            options.tag
        )));
    }
    if address == "fakeip" {
        return Ok(Arc::new(FakeIpTransport::new(&options.tag, None)?));
    }
    if let Some(rcode) = address.strip_prefix("rcode://") {
        return Ok(Arc::new(RcodeTransport::new(&options.tag, rcode)?));
    }
    let address = address.strip_prefix("udp://").unwrap_or(address);
    let server = parse_server_addr(address)
        .ok_or_else(|| Error::config(format!("invalid dns server address: {}", address)))?;
    let dialer: Arc<dyn Dialer> = if options.detour.is_empty() {
        new_dialer(router, &DialerOptions::default())?
    } else {
        Arc::new(DetourDialer::new(router.clone(), &options.detour))
    };
    Ok(Arc::new(UdpTransport::new(&options.tag, server, dialer)))
}

fn parse_server_addr(address: &str) -> Option<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, 53));
    }
    None
}

/// Plain DNS over UDP, dialed through the configured detour.
pub struct UdpTransport {
    tag: String,
    server: SocketAddr,
    dialer: Arc<dyn Dialer>,
}

impl UdpTransport {
    pub fn new(tag: &str, server: SocketAddr, dialer: Arc<dyn Dialer>) -> Self {
        UdpTransport {
            tag: tag.to_string(),
            server,
            dialer,
        }
    }
}

#[async_trait]
impl DnsTransport for UdpTransport {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Udp
    }

    async fn exchange(&self, message: &Message) -> Result<Message> {
        let destination = Destination::from(self.server);
        let socket = self.dialer.listen_packet(&destination).await?;

        let mut query = message.clone();
        let query_id: u16 = rand::random();
        query.set_id(query_id);
        let packet = query.to_vec()?;
        socket.send_to(&packet, &destination).await?;

        let mut buf = vec![0u8; 4096];
        loop {
            let (n, _) = socket.recv_from(&mut buf).await?;
            let mut response = Message::from_vec(&buf[..n])?;
            if response.id() != query_id {
                continue;
            }
            response.set_id(message.id());
            return Ok(response);
        }
    }
}

/// Terminal transport answering every query with a fixed response code.
pub struct RcodeTransport {
    tag: String,
    rcode: ResponseCode,
}

impl RcodeTransport {
    pub fn new(tag: &str, rcode: &str) -> Result<Self> {
        let rcode = match rcode {
            "success" => ResponseCode::NoError,
            "format_error" => ResponseCode::FormErr,
            "server_failure" => ResponseCode::ServFail,
            "name_error" => ResponseCode::NXDomain,
            "not_implemented" => ResponseCode::NotImp,
            "refused" => ResponseCode::Refused,
            other => return Err(Error::config(format!("unknown rcode: {}", other))),
        };
        Ok(RcodeTransport {
            tag: tag.to_string(),
            rcode,
        })
    }
}

#[async_trait]
impl DnsTransport for RcodeTransport {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Rcode
    }

    async fn exchange(&self, message: &Message) -> Result<Message> {
        let mut response = synthesize_response(message, &[], 0);
        response.set_response_code(self.rcode);
        Ok(response)
    }
}

const DEFAULT_FAKEIP_RANGE: &str = "198.18.0.0/15";

/// Synthesizes placeholder A answers from a private range and remembers the
/// mapping back to the queried domain.
pub struct FakeIpTransport {
    tag: String,
    range: Ipv4Net,
    state: Mutex<FakeIpState>,
}

struct FakeIpState {
    next: u32,
    by_ip: LruCache<IpAddr, String>,
    by_domain: LruCache<String, Ipv4Addr>,
}

impl FakeIpTransport {
    pub fn new(tag: &str, range: Option<Ipv4Net>) -> Result<Self> {
        let range = match range {
            Some(range) => range,
            None => DEFAULT_FAKEIP_RANGE.parse().expect("default fakeip range"),
        };
        let capacity = NonZeroUsize::new(65536).unwrap();
        Ok(FakeIpTransport {
            tag: tag.to_string(),
            range,
            state: Mutex::new(FakeIpState {
                // Skip the network address.
                next: u32::from(range.network()) + 1,
                by_ip: LruCache::new(capacity),
                by_domain: LruCache::new(capacity),
            }),
        })
    }

    fn allocate(&self, domain: &str) -> Ipv4Addr {
        let mut state = self.state.lock();
        if let Some(ip) = state.by_domain.get(domain) {
            return *ip;
        }
        let ip = Ipv4Addr::from(state.next);
        state.next += 1;
        if !self.range.contains(&ip) {
            // Wrapped around; restart the pool.
            state.next = u32::from(self.range.network()) + 2;
        }
        state.by_domain.put(domain.to_string(), ip);
        state.by_ip.put(IpAddr::V4(ip), domain.to_string());
        ip
    }

    /// Look a placeholder address back up to its domain.
    pub fn domain_for(&self, ip: IpAddr) -> Option<String> {
        self.state.lock().by_ip.get(&ip).cloned()
    }
}

#[async_trait]
impl DnsTransport for FakeIpTransport {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn transport_type(&self) -> TransportType {
        TransportType::FakeIp
    }

    async fn exchange(&self, message: &Message) -> Result<Message> {
        let Some(question) = message.queries().first() else {
            return Err(Error::dns("empty question"));
        };
        if question.query_type() != RecordType::A {
            // No pool for other types; empty success keeps resolvers moving.
            return Ok(synthesize_response(message, &[], 1));
        }
        let domain = fqdn_to_domain(question.name());
        let ip = self.allocate(&domain);
        Ok(synthesize_response(message, &[IpAddr::V4(ip)], 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::build_query;

    #[tokio::test]
    async fn test_rcode_transport() {
        let transport = RcodeTransport::new("block-dns", "refused").unwrap();
        let query = build_query("example.com", RecordType::A).unwrap();
        let response = transport.exchange(&query).await.unwrap();
        assert_eq!(response.response_code(), ResponseCode::Refused);
        assert!(RcodeTransport::new("x", "bogus").is_err());
    }

    #[tokio::test]
    async fn test_fakeip_allocates_stable_addresses() {
        let transport = FakeIpTransport::new("fake", None).unwrap();
        let query = build_query("example.com", RecordType::A).unwrap();

        let first = transport.exchange(&query).await.unwrap();
        let second = transport.exchange(&query).await.unwrap();
        let first_addrs = crate::dns::message_to_addresses(&first);
        assert_eq!(first_addrs, crate::dns::message_to_addresses(&second));

        let ip = first_addrs[0];
        assert_eq!(transport.domain_for(ip).as_deref(), Some("example.com"));
        assert!(transport.is_fake_ip());

        let other = build_query("other.org", RecordType::A).unwrap();
        let third = transport.exchange(&other).await.unwrap();
        assert_ne!(first_addrs, crate::dns::message_to_addresses(&third));
    }

    #[tokio::test]
    async fn test_fakeip_aaaa_empty_success() {
        let transport = FakeIpTransport::new("fake", None).unwrap();
        let query = build_query("example.com", RecordType::AAAA).unwrap();
        let response = transport.exchange(&query).await.unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
    }
}
