//! DNS routing pipeline.
//!
//! Questions flow through hosts, the exchange cache, then the ordered DNS
//! rules; each rule names a transport. Successful address answers feed the
//! reverse mapping used for destination rewriting.

mod client;
mod reverse;
mod rule;
mod router;
mod transport;

pub use client::{DnsClient, QueryContext};
pub use reverse::ReverseMapping;
pub use rule::{DnsRule, FallbackRule};
pub use router::DnsRouter;
pub use transport::{
    new_transport, DnsTransport, FakeIpTransport, RcodeTransport, TransportType, UdpTransport,
};

use crate::config::DomainStrategy;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use std::net::IpAddr;
use std::str::FromStr;

/// Strip the trailing root dot from a wire-format name.
pub fn fqdn_to_domain(name: &Name) -> String {
    let s = name.to_utf8();
    s.strip_suffix('.').unwrap_or(&s).to_string()
}

pub fn domain_to_fqdn(domain: &str) -> crate::Result<Name> {
    Name::from_str(&format!("{}.", domain.trim_end_matches('.')))
        .map_err(|e| crate::Error::dns(format!("invalid domain {:?}: {}", domain, e)))
}

pub fn is_address_query(message: &Message) -> bool {
    message
        .queries()
        .iter()
        .any(|q| q.query_type() == RecordType::A || q.query_type() == RecordType::AAAA)
}

/// Addresses carried in a response's answer section.
pub fn message_to_addresses(message: &Message) -> Vec<IpAddr> {
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

pub fn build_query(domain: &str, record_type: RecordType) -> crate::Result<Message> {
    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    let mut query = Query::query(domain_to_fqdn(domain)?, record_type);
    query.set_query_class(DNSClass::IN);
    message.add_query(query);
    Ok(message)
}

/// Build a success response answering `query` with the given addresses,
/// keeping only those matching the question's record type.
pub fn synthesize_response(query: &Message, addresses: &[IpAddr], ttl: u32) -> Message {
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    for question in query.queries() {
        response.add_query(question.clone());
    }
    if let Some(question) = query.queries().first() {
        for address in addresses {
            let rdata = match (address, question.query_type()) {
                (IpAddr::V4(ip), RecordType::A) => RData::A(A(*ip)),
                (IpAddr::V6(ip), RecordType::AAAA) => RData::AAAA(AAAA(*ip)),
                _ => continue,
            };
            response.add_answer(Record::from_rdata(question.name().clone(), ttl, rdata));
        }
    }
    response
}

/// Filter and order addresses per the domain strategy.
pub fn apply_strategy(addresses: Vec<IpAddr>, strategy: DomainStrategy) -> Vec<IpAddr> {
    match strategy {
        DomainStrategy::AsIs => addresses,
        DomainStrategy::Ipv4Only => addresses.into_iter().filter(IpAddr::is_ipv4).collect(),
        DomainStrategy::Ipv6Only => addresses.into_iter().filter(IpAddr::is_ipv6).collect(),
        DomainStrategy::PreferIpv4 | DomainStrategy::PreferIpv6 => {
            let prefer_v6 = strategy == DomainStrategy::PreferIpv6;
            let (mut preferred, other): (Vec<IpAddr>, Vec<IpAddr>) = addresses
                .into_iter()
                .partition(|addr| addr.is_ipv6() == prefer_v6);
            preferred.extend(other);
            preferred
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fqdn_round_trip() {
        let name = domain_to_fqdn("example.com").unwrap();
        assert_eq!(fqdn_to_domain(&name), "example.com");
    }

    #[test]
    fn test_synthesize_and_extract() {
        let query = build_query("example.com", RecordType::A).unwrap();
        let v4: IpAddr = "93.184.216.34".parse().unwrap();
        let v6: IpAddr = "2606:2800:220:1::1".parse().unwrap();
        let response = synthesize_response(&query, &[v4, v6], 600);
        // AAAA filtered out of an A answer.
        assert_eq!(message_to_addresses(&response), vec![v4]);
        assert_eq!(response.id(), query.id());
        assert!(is_address_query(&response));
    }

    #[test]
    fn test_apply_strategy() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(
            apply_strategy(vec![v4, v6], DomainStrategy::Ipv6Only),
            vec![v6]
        );
        assert_eq!(
            apply_strategy(vec![v4, v6], DomainStrategy::PreferIpv6),
            vec![v6, v4]
        );
        assert_eq!(
            apply_strategy(vec![v4, v6], DomainStrategy::AsIs),
            vec![v4, v6]
        );
    }
}
