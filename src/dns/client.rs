//! DNS client plumbing: static hosts, the exchange cache, and the
//! rejected-response cache backing address-limit retries.

use super::{apply_strategy, fqdn_to_domain, message_to_addresses, DnsTransport};
use crate::config::{DnsOptions, DomainStrategy};
#[cfg(test)]
use crate::config::HostsEntry;
use crate::{Error, Result};
use hickory_proto::op::{Edns, Message, ResponseCode};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use hickory_proto::rr::RecordType;
use ipnet::IpNet;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

const CACHE_CAPACITY: usize = 4096;
const REJECTED_CACHE_TTL: Duration = Duration::from_secs(30);
/// Cache lifetime for answers without records.
const EMPTY_ANSWER_TTL: u32 = 60;

/// Per-rule exchange context.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryContext {
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<IpNet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    name: String,
    query_type: RecordType,
}

impl CacheKey {
    fn from_message(message: &Message) -> Option<Self> {
        let question = message.queries().first()?;
        Some(CacheKey {
            name: fqdn_to_domain(question.name()).to_lowercase(),
            query_type: question.query_type(),
        })
    }
}

struct CachedAnswer {
    message: Message,
    expires: Instant,
}

pub struct DnsClient {
    cname_hosts: HashMap<String, String>,
    ip_hosts: HashMap<String, Vec<IpAddr>>,
    disable_cache: bool,
    cache: Mutex<LruCache<CacheKey, CachedAnswer>>,
    rejected: Mutex<LruCache<(CacheKey, String), Instant>>,
}

impl DnsClient {
    pub fn new(options: &DnsOptions) -> Self {
        let mut cname_hosts = HashMap::new();
        let mut ip_hosts: HashMap<String, Vec<IpAddr>> = HashMap::new();
        for (domain, entry) in &options.hosts {
            let domain = domain.to_lowercase();
            for value in entry.values() {
                match value.parse::<IpAddr>() {
                    Ok(ip) => ip_hosts.entry(domain.clone()).or_default().push(ip),
                    Err(_) => {
                        cname_hosts.insert(domain.clone(), value.to_lowercase());
                    }
                }
            }
        }
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap();
        DnsClient {
            cname_hosts,
            ip_hosts,
            disable_cache: options.disable_cache,
            cache: Mutex::new(LruCache::new(capacity)),
            rejected: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Follow CNAME hosts to the final name, returning the rewrite chain.
    pub fn rewrite_cname(&self, domain: &str) -> (String, Vec<(String, String)>) {
        let mut current = domain.to_lowercase();
        let mut chain = Vec::new();
        while let Some(target) = self.cname_hosts.get(&current) {
            // A hosts cycle would loop forever; stop at the first revisit.
            if chain
                .iter()
                .any(|(from, _): &(String, String)| from == target)
                || *target == current
            {
                break;
            }
            chain.push((current.clone(), target.clone()));
            current = target.clone();
        }
        (current, chain)
    }

    pub fn hosts_addresses(&self, domain: &str, strategy: DomainStrategy) -> Option<Vec<IpAddr>> {
        let addrs = self.ip_hosts.get(&domain.to_lowercase())?.clone();
        let addrs = apply_strategy(addrs, strategy);
        if addrs.is_empty() {
            return None;
        }
        Some(addrs)
    }

    pub fn exchange_cache(&self, message: &Message) -> Option<Message> {
        if self.disable_cache {
            return None;
        }
        let key = CacheKey::from_message(message)?;
        let mut cache = self.cache.lock();
        match cache.get(&key) {
            Some(answer) if answer.expires > Instant::now() => {
                let mut response = answer.message.clone();
                response.set_id(message.id());
                Some(response)
            }
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        }
    }

    fn store_cache(&self, message: &Message, response: &Message, ctx: QueryContext) {
        if self.disable_cache || ctx.disable_cache {
            return;
        }
        let Some(key) = CacheKey::from_message(message) else {
            return;
        };
        let ttl = ctx.rewrite_ttl.unwrap_or_else(|| {
            response
                .answers()
                .iter()
                .map(|record| record.ttl())
                .min()
                .unwrap_or(EMPTY_ANSWER_TTL)
        });
        self.cache.lock().put(
            key,
            CachedAnswer {
                message: response.clone(),
                expires: Instant::now() + Duration::from_secs(u64::from(ttl)),
            },
        );
    }

    fn prepare_query(&self, message: &Message, ctx: QueryContext) -> Message {
        let mut query = message.clone();
        if let Some(subnet) = ctx.client_subnet {
            let edns = query.extensions_mut().get_or_insert_with(Edns::new);
            edns.options_mut().insert(EdnsOption::Unknown(
                u16::from(EdnsCode::Subnet),
                encode_client_subnet(&subnet),
            ));
        }
        query
    }

    fn apply_rewrite_ttl(response: &mut Message, ctx: QueryContext) {
        if let Some(ttl) = ctx.rewrite_ttl {
            let mut answers = response.take_answers();
            for record in &mut answers {
                record.set_ttl(ttl);
            }
            response.insert_answers(answers);
        }
    }

    /// One exchange through a transport, honoring the per-rule context.
    pub async fn exchange(
        &self,
        transport: &Arc<dyn DnsTransport>,
        message: &Message,
        ctx: QueryContext,
    ) -> Result<Message> {
        let query = self.prepare_query(message, ctx);
        let mut response = transport.exchange(&query).await?;
        Self::apply_rewrite_ttl(&mut response, ctx);
        self.store_cache(message, &response, ctx);
        Ok(response)
    }

    /// Exchange, then let the caller veto the answer. Vetoed answers are
    /// remembered so an identical retry short-circuits as rejected-cached.
    pub async fn exchange_with_response_check<F>(
        &self,
        transport: &Arc<dyn DnsTransport>,
        message: &Message,
        ctx: QueryContext,
        mut check: F,
    ) -> Result<Message>
    where
        F: FnMut(&Message) -> bool + Send,
    {
        let rejected_key =
            CacheKey::from_message(message).map(|key| (key, transport.tag().to_string()));
        if let Some(key) = &rejected_key {
            let mut rejected = self.rejected.lock();
            match rejected.get(key) {
                Some(expires) if *expires > Instant::now() => {
                    return Err(Error::ResponseRejected { cached: true });
                }
                Some(_) => {
                    rejected.pop(key);
                }
                None => {}
            }
        }

        let query = self.prepare_query(message, ctx);
        let mut response = transport.exchange(&query).await?;
        if !check(&response) {
            if let Some(key) = rejected_key {
                self.rejected
                    .lock()
                    .put(key, Instant::now() + REJECTED_CACHE_TTL);
            }
            return Err(Error::ResponseRejected { cached: false });
        }
        Self::apply_rewrite_ttl(&mut response, ctx);
        self.store_cache(message, &response, ctx);
        Ok(response)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
        self.rejected.lock().clear();
    }
}

/// EDNS0 client-subnet payload: family, source prefix, scope, address bytes.
fn encode_client_subnet(subnet: &IpNet) -> Vec<u8> {
    let (family, octets): (u16, Vec<u8>) = match subnet.addr() {
        IpAddr::V4(ip) => (1, ip.octets().to_vec()),
        IpAddr::V6(ip) => (2, ip.octets().to_vec()),
    };
    let prefix = subnet.prefix_len();
    let significant = usize::from(prefix).div_ceil(8);
    let mut out = Vec::with_capacity(4 + significant);
    out.extend_from_slice(&family.to_be_bytes());
    out.push(prefix);
    out.push(0);
    out.extend_from_slice(&octets[..significant]);
    out
}

/// Whether a response carries usable addresses.
pub fn is_empty_success(response: &Message) -> bool {
    response.response_code() == ResponseCode::NoError && message_to_addresses(response).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::transport::RcodeTransport;
    use crate::dns::{build_query, synthesize_response, FakeIpTransport};

    fn client_with_hosts() -> DnsClient {
        let mut options = DnsOptions::default();
        options.hosts.insert(
            "router.local".to_string(),
            HostsEntry::Single("192.168.1.1".to_string()),
        );
        options.hosts.insert(
            "alias.example".to_string(),
            HostsEntry::Single("real.example".to_string()),
        );
        DnsClient::new(&options)
    }

    #[test]
    fn test_hosts_split() {
        let client = client_with_hosts();
        let addrs = client
            .hosts_addresses("router.local", DomainStrategy::AsIs)
            .unwrap();
        assert_eq!(addrs, vec!["192.168.1.1".parse::<IpAddr>().unwrap()]);

        let (resolved, chain) = client.rewrite_cname("alias.example");
        assert_eq!(resolved, "real.example");
        assert_eq!(chain.len(), 1);

        let (unchanged, chain) = client.rewrite_cname("other.example");
        assert_eq!(unchanged, "other.example");
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn test_exchange_caches_responses() {
        let client = DnsClient::new(&DnsOptions::default());
        let transport: Arc<dyn DnsTransport> = Arc::new(FakeIpTransport::new("fake", None).unwrap());
        let query = build_query("cache.example", RecordType::A).unwrap();

        assert!(client.exchange_cache(&query).is_none());
        let response = client
            .exchange(&transport, &query, QueryContext::default())
            .await
            .unwrap();
        let cached = client.exchange_cache(&query).expect("cached");
        assert_eq!(
            message_to_addresses(&cached),
            message_to_addresses(&response)
        );
    }

    #[tokio::test]
    async fn test_disable_cache_context() {
        let client = DnsClient::new(&DnsOptions::default());
        let transport: Arc<dyn DnsTransport> = Arc::new(FakeIpTransport::new("fake", None).unwrap());
        let query = build_query("nocache.example", RecordType::A).unwrap();
        let ctx = QueryContext {
            disable_cache: true,
            ..Default::default()
        };
        client.exchange(&transport, &query, ctx).await.unwrap();
        assert!(client.exchange_cache(&query).is_none());
    }

    #[tokio::test]
    async fn test_rewrite_ttl() {
        let client = DnsClient::new(&DnsOptions::default());
        let transport: Arc<dyn DnsTransport> = Arc::new(FakeIpTransport::new("fake", None).unwrap());
        let query = build_query("ttl.example", RecordType::A).unwrap();
        let ctx = QueryContext {
            rewrite_ttl: Some(42),
            ..Default::default()
        };
        let response = client.exchange(&transport, &query, ctx).await.unwrap();
        assert!(response.answers().iter().all(|r| r.ttl() == 42));
    }

    #[tokio::test]
    async fn test_response_check_rejects_then_serves_cached_rejection() {
        let client = DnsClient::new(&DnsOptions::default());
        let transport: Arc<dyn DnsTransport> = Arc::new(FakeIpTransport::new("fake", None).unwrap());
        let query = build_query("limited.example", RecordType::A).unwrap();

        let err = client
            .exchange_with_response_check(&transport, &query, QueryContext::default(), |_| false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResponseRejected { cached: false }));

        let err = client
            .exchange_with_response_check(&transport, &query, QueryContext::default(), |_| false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResponseRejected { cached: true }));
    }

    #[tokio::test]
    async fn test_empty_success_helper() {
        let transport = RcodeTransport::new("reject", "refused").unwrap();
        let query = build_query("x.example", RecordType::A).unwrap();
        let refused = transport.exchange(&query).await.unwrap();
        assert!(!is_empty_success(&refused));

        let empty = synthesize_response(&query, &[], 0);
        assert!(is_empty_success(&empty));
    }
}
