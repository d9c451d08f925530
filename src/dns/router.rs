//! Question -> transport routing.
//!
//! The rule walk is sequential and resumable: an address-limited rule that
//! rejects its own answer sends the walk back in at the position after it,
//! so no rule is visited twice for one query.

use super::client::is_empty_success;
use super::{
    build_query, domain_to_fqdn, fqdn_to_domain, is_address_query, message_to_addresses,
    apply_strategy, DnsClient, DnsRule, DnsTransport, QueryContext, ReverseMapping, TransportType,
};
use crate::common::metadata::FlowMetadata;
use crate::config::DomainStrategy;
use crate::constant::DNS_TIMEOUT;
use crate::router::GeoReader;
use crate::{Error, Result};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::CNAME;
use hickory_proto::rr::{RData, Record, RecordType};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn, Instrument};

const CNAME_TTL: u32 = 600;

struct MatchedTransport<'a> {
    transport: Arc<dyn DnsTransport>,
    strategy: DomainStrategy,
    rule: Option<&'a DnsRule>,
    index: Option<usize>,
    is_fakeip: bool,
    ctx: QueryContext,
}

pub struct DnsRouter {
    client: DnsClient,
    transports: HashMap<String, Arc<dyn DnsTransport>>,
    strategies: HashMap<String, DomainStrategy>,
    default_transport: Arc<dyn DnsTransport>,
    default_strategy: DomainStrategy,
    rules: Vec<DnsRule>,
    reverse: Option<ReverseMapping>,
    geo: Option<Arc<dyn GeoReader>>,
}

impl DnsRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: DnsClient,
        transports: HashMap<String, Arc<dyn DnsTransport>>,
        strategies: HashMap<String, DomainStrategy>,
        default_transport: Arc<dyn DnsTransport>,
        default_strategy: DomainStrategy,
        rules: Vec<DnsRule>,
        reverse_mapping: bool,
        geo: Option<Arc<dyn GeoReader>>,
    ) -> Self {
        DnsRouter {
            client,
            transports,
            strategies,
            default_transport,
            default_strategy,
            rules,
            reverse: reverse_mapping.then(ReverseMapping::new),
            geo,
        }
    }

    pub fn reverse_query(&self, ip: IpAddr) -> Option<String> {
        self.reverse.as_ref()?.query(ip)
    }

    pub fn clear_cache(&self) {
        self.client.clear_cache();
    }

    fn geo(&self) -> Option<&dyn GeoReader> {
        self.geo.as_deref()
    }

    fn strategy_for(&self, transport: &Arc<dyn DnsTransport>) -> DomainStrategy {
        self.strategies
            .get(transport.tag())
            .copied()
            .unwrap_or(self.default_strategy)
    }

    fn match_dns(
        &self,
        meta: &mut FlowMetadata,
        allow_fake_ip: bool,
        after: Option<usize>,
    ) -> MatchedTransport<'_> {
        let start = after.map(|index| index + 1).unwrap_or(0);
        if start <= self.rules.len() {
            for (offset, rule) in self.rules[start.min(self.rules.len())..].iter().enumerate() {
                meta.reset_rule_cache();
                if !rule.matches(meta, self.geo()) {
                    continue;
                }
                let Some(transport) = self.transports.get(rule.server()) else {
                    warn!("transport not found: {}", rule.server());
                    continue;
                };
                let is_fakeip = transport.is_fake_ip();
                if is_fakeip && !allow_fake_ip {
                    continue;
                }
                let index = start + offset;
                debug!("match[{}] {} => {}", index, rule, rule.server());
                let mut ctx = rule.query_context();
                if is_fakeip {
                    ctx.disable_cache = true;
                    ctx.rewrite_ttl = Some(1);
                }
                return MatchedTransport {
                    transport: transport.clone(),
                    strategy: self.strategy_for(transport),
                    rule: Some(rule),
                    index: Some(index),
                    is_fakeip,
                    ctx,
                };
            }
        }
        MatchedTransport {
            transport: self.default_transport.clone(),
            strategy: self.strategy_for(&self.default_transport),
            rule: None,
            index: None,
            is_fakeip: false,
            ctx: QueryContext::default(),
        }
    }

    /// Route one DNS message.
    pub async fn exchange(&self, message: &Message, meta: &mut FlowMetadata) -> Result<Message> {
        let span = tracing::debug_span!("dns", id = %uuid::Uuid::new_v4());
        self.exchange_inner(message, meta).instrument(span).await
    }

    async fn exchange_inner(&self, message: &Message, meta: &mut FlowMetadata) -> Result<Message> {
        let Some(question) = message.queries().first() else {
            return Err(Error::dns("empty query"));
        };
        let query_type = question.query_type();
        let raw_domain = fqdn_to_domain(question.name());
        debug!("exchange {} {:?}", raw_domain, query_type);

        let (domain, chain) = self.client.rewrite_cname(&raw_domain);
        let work = if chain.is_empty() {
            message.clone()
        } else {
            let mut rewritten = build_query(&domain, query_type)?;
            rewritten.set_id(message.id());
            rewritten.set_recursion_desired(message.recursion_desired());
            rewritten
        };

        if matches!(query_type, RecordType::A | RecordType::AAAA) {
            if let Some(addrs) = self.client.hosts_addresses(&domain, self.default_strategy) {
                let response = super::synthesize_response(&work, &addrs, CNAME_TTL);
                return Ok(finalize(message, response, &chain)?);
            }
        }
        if let Some(cached) = self.client.exchange_cache(&work) {
            return Ok(finalize(message, cached, &chain)?);
        }

        meta.query_type = Some(u16::from(query_type));
        meta.ip_version = match query_type {
            RecordType::A => Some(4),
            RecordType::AAAA => Some(6),
            _ => None,
        };
        meta.domain = domain.clone();

        let mut index: Option<usize> = None;
        let outcome: Result<(Message, bool)> = loop {
            meta.reset_rule_cache();
            meta.destination_addresses = Vec::new();
            let matched = self.match_dns(meta, true, index);
            index = matched.index;

            let is_addr_query = is_address_query(&work);
            let address_limit = is_addr_query
                && matched
                    .rule
                    .map(|rule| rule.with_address_limit())
                    .unwrap_or(false);

            let result: Result<Message> = {
                let attempt = async {
                    if address_limit {
                        let rule = matched.rule.expect("address limit without rule");
                        let geo = self.geo();
                        self.client
                            .exchange_with_response_check(
                                &matched.transport,
                                &work,
                                matched.ctx,
                                |response| {
                                    meta.destination_addresses = message_to_addresses(response);
                                    rule.match_address_limit(meta, geo)
                                },
                            )
                            .await
                    } else {
                        self.client
                            .exchange(&matched.transport, &work, matched.ctx)
                            .await
                    }
                };
                match tokio::time::timeout(DNS_TIMEOUT, attempt).await {
                    Ok(result) => result,
                    Err(elapsed) => Err(elapsed.into()),
                }
            };

            let rejected = matches!(&result, Err(err) if err.is_rejected());
            if let Err(err) = &result {
                if rejected {
                    debug!("response rejected for {}: {}", domain, err);
                } else {
                    warn!("exchange failed for {}: {}", domain, err);
                }
            }

            let terminal = matched.rule.is_none()
                || !is_addr_query
                || matched.is_fakeip
                || matched.transport.transport_type() == TransportType::Rcode;
            if terminal {
                break result.map(|response| (response, matched.is_fakeip));
            }
            if address_limit && rejected {
                continue;
            }
            let response = match result {
                Ok(response) => response,
                Err(err) => break Err(err),
            };
            if response.response_code() != ResponseCode::NoError {
                break Ok((response, false));
            }
            let addrs = message_to_addresses(&response);
            if addrs.is_empty() {
                break Ok((response, false));
            }
            let rule = matched.rule.expect("terminal check");
            if rule.fallback_rules().is_empty() {
                break Ok((response, false));
            }
            let Some(fallback) = rule
                .fallback_rules()
                .iter()
                .find(|fallback| fallback.matches(&addrs, self.geo()))
            else {
                break Ok((response, false));
            };
            debug!("match fallback_rule => {}", fallback.server());
            if fallback.server().is_empty() {
                // Condition-only fallback: resume the walk past this rule.
                continue;
            }
            let Some(fb_transport) = self.transports.get(fallback.server()) else {
                warn!("transport not found: {}", fallback.server());
                break Ok((response, false));
            };
            let fb_fakeip = fb_transport.is_fake_ip();
            let mut ctx = fallback.query_context();
            if fb_fakeip {
                ctx.disable_cache = true;
                ctx.rewrite_ttl = Some(1);
            }
            let fb_result =
                match tokio::time::timeout(DNS_TIMEOUT, self.client.exchange(fb_transport, &work, ctx))
                    .await
                {
                    Ok(result) => result,
                    Err(elapsed) => Err(elapsed.into()),
                };
            break match fb_result {
                Ok(response) => Ok((response, fb_fakeip)),
                Err(err) => {
                    warn!("exchange failed for {}: {}", domain, err);
                    Err(err)
                }
            };
        };

        let (response, is_fakeip) = outcome?;
        if !is_fakeip {
            if let Some(reverse) = &self.reverse {
                save_reverse_mapping(reverse, &response);
            }
        }
        finalize(message, response, &chain)
    }

    /// Resolve a domain to addresses with the given strategy.
    pub async fn lookup(&self, domain: &str, strategy: DomainStrategy) -> Result<Vec<IpAddr>> {
        let mut meta = FlowMetadata::new();
        self.lookup_with_metadata(domain, strategy, &mut meta).await
    }

    pub async fn lookup_with_metadata(
        &self,
        domain: &str,
        strategy: DomainStrategy,
        meta: &mut FlowMetadata,
    ) -> Result<Vec<IpAddr>> {
        let span = tracing::debug_span!("dns", id = %uuid::Uuid::new_v4());
        self.lookup_inner(domain, strategy, meta).instrument(span).await
    }

    async fn lookup_inner(
        &self,
        domain: &str,
        strategy: DomainStrategy,
        meta: &mut FlowMetadata,
    ) -> Result<Vec<IpAddr>> {
        let (domain, _) = self.client.rewrite_cname(&domain.to_lowercase());
        if let Some(addrs) = self.client.hosts_addresses(&domain, strategy) {
            return Ok(addrs);
        }
        debug!("lookup domain {}", domain);
        meta.domain = domain.clone();

        let mut index: Option<usize> = None;
        loop {
            meta.reset_rule_cache();
            meta.destination_addresses = Vec::new();
            let matched = self.match_dns(meta, false, index);
            index = matched.index;
            let effective = if strategy == DomainStrategy::AsIs {
                matched.strategy
            } else {
                strategy
            };
            let address_limit = matched
                .rule
                .map(|rule| rule.with_address_limit())
                .unwrap_or(false);

            let result = self
                .lookup_via_transport(&matched, &domain, effective, address_limit, meta)
                .await;

            let rejected = matches!(&result, Err(err) if err.is_rejected());
            match &result {
                Err(err) if rejected => debug!("response rejected for {}: {}", domain, err),
                Err(err) => warn!("lookup failed for {}: {}", domain, err),
                Ok(addrs) => debug!("lookup succeed for {}: {:?}", domain, addrs),
            }

            if matched.rule.is_none() {
                return result;
            }
            if address_limit && rejected {
                continue;
            }
            let addrs = result?;
            let rule = matched.rule.expect("checked above");
            if rule.fallback_rules().is_empty() {
                return Ok(addrs);
            }
            let Some(fallback) = rule
                .fallback_rules()
                .iter()
                .find(|fallback| fallback.matches(&addrs, self.geo()))
            else {
                return Ok(addrs);
            };
            if fallback.server().is_empty() {
                continue;
            }
            let Some(fb_transport) = self.transports.get(fallback.server()) else {
                warn!("transport not found: {}", fallback.server());
                return Ok(addrs);
            };
            let fb_matched = MatchedTransport {
                transport: fb_transport.clone(),
                strategy: effective,
                rule: None,
                index: None,
                is_fakeip: fb_transport.is_fake_ip(),
                ctx: fallback.query_context(),
            };
            return self
                .lookup_via_transport(&fb_matched, &domain, effective, false, meta)
                .await;
        }
    }

    async fn lookup_via_transport(
        &self,
        matched: &MatchedTransport<'_>,
        domain: &str,
        strategy: DomainStrategy,
        address_limit: bool,
        meta: &mut FlowMetadata,
    ) -> Result<Vec<IpAddr>> {
        let mut record_types = Vec::new();
        if strategy != DomainStrategy::Ipv6Only {
            record_types.push(RecordType::A);
        }
        if strategy != DomainStrategy::Ipv4Only {
            record_types.push(RecordType::AAAA);
        }

        let mut addrs = Vec::new();
        let mut last_err = None;
        for record_type in record_types {
            let query = build_query(domain, record_type)?;
            if let Some(cached) = self.client.exchange_cache(&query) {
                addrs.extend(message_to_addresses(&cached));
                continue;
            }
            let attempt = async {
                if address_limit {
                    let rule = matched.rule.expect("address limit without rule");
                    let geo = self.geo();
                    self.client
                        .exchange_with_response_check(
                            &matched.transport,
                            &query,
                            matched.ctx,
                            |response| {
                                meta.destination_addresses = message_to_addresses(response);
                                rule.match_address_limit(meta, geo)
                            },
                        )
                        .await
                } else {
                    self.client.exchange(&matched.transport, &query, matched.ctx).await
                }
            };
            let result = match tokio::time::timeout(DNS_TIMEOUT, attempt).await {
                Ok(result) => result,
                Err(elapsed) => Err(elapsed.into()),
            };
            match result {
                Ok(response) => {
                    if !is_empty_success(&response) {
                        addrs.extend(message_to_addresses(&response));
                    }
                }
                Err(err) => last_err = Some(err),
            }
        }

        if addrs.is_empty() {
            return Err(last_err.unwrap_or_else(|| Error::dns(format!("{}: empty result", domain))));
        }
        Ok(apply_strategy(addrs, strategy))
    }
}

fn save_reverse_mapping(reverse: &ReverseMapping, response: &Message) {
    for record in response.answers() {
        let domain = fqdn_to_domain(record.name());
        match record.data() {
            Some(RData::A(a)) => reverse.save(IpAddr::V4(a.0), &domain, record.ttl()),
            Some(RData::AAAA(aaaa)) => reverse.save(IpAddr::V6(aaaa.0), &domain, record.ttl()),
            _ => {}
        }
    }
}

/// Rebuild the response against the caller's original question, prepending
/// the CNAME-hosts chain.
fn finalize(original: &Message, response: Message, chain: &[(String, String)]) -> Result<Message> {
    let mut out = Message::new();
    out.set_id(original.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(original.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(response.response_code());
    for question in original.queries() {
        out.add_query(question.clone());
    }
    for (from, to) in chain {
        out.add_answer(Record::from_rdata(
            domain_to_fqdn(from)?,
            CNAME_TTL,
            RData::CNAME(CNAME(domain_to_fqdn(to)?)),
        ));
    }
    for answer in response.answers() {
        out.add_answer(answer.clone());
    }
    Ok(out)
}
