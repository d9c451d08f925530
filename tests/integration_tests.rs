//! End-to-end scenarios: group selection, provider refresh, DNS rule
//! fallback. Everything runs against loopback listeners; no external
//! network is touched.

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use routebox::common::metadata::{Destination, FlowMetadata, Network};
use routebox::config::{DnsOptions, DnsRuleOptions, DomainStrategy, Options};
use routebox::dns::{
    build_query, message_to_addresses, synthesize_response, DnsClient, DnsRouter, DnsRule,
    DnsTransport, FakeIpTransport, TransportType,
};
use routebox::group::OutboundGroup;
use routebox::outbound::Outbound;
use routebox::provider::{HttpProvider, OutboundProvider};
use routebox::router::Router;
use routebox::{Gateway, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "routebox-test-{}-{}-{}",
        name,
        std::process::id(),
        rand_suffix()
    ))
}

fn rand_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos() as u64
}

/// Minimal SOCKS5 server: accepts one connection, completes the handshake,
/// acknowledges CONNECT, then writes `marker`.
async fn spawn_socks5_stub(marker: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            let marker = marker.to_vec();
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                conn.read_exact(&mut greeting).await.ok()?;
                let mut methods = vec![0u8; usize::from(greeting[1])];
                conn.read_exact(&mut methods).await.ok()?;
                conn.write_all(&[0x05, 0x00]).await.ok()?;

                let mut head = [0u8; 4];
                conn.read_exact(&mut head).await.ok()?;
                match head[3] {
                    0x01 => {
                        let mut skip = [0u8; 6];
                        conn.read_exact(&mut skip).await.ok()?;
                    }
                    0x03 => {
                        let mut len = [0u8; 1];
                        conn.read_exact(&mut len).await.ok()?;
                        let mut skip = vec![0u8; usize::from(len[0]) + 2];
                        conn.read_exact(&mut skip).await.ok()?;
                    }
                    _ => return None,
                }
                conn.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .ok()?;
                conn.write_all(&marker).await.ok()?;
                Some(())
            });
        }
    });
    addr
}

/// Selector resolves the persisted cache-file choice and dials through it.
#[tokio::test]
async fn test_selector_picks_persisted_tag() {
    let socks_b = spawn_socks5_stub(b"via-b").await;

    let sub_path = temp_path("sub");
    std::fs::write(
        &sub_path,
        format!(
            "socks5://127.0.0.1:19999#proxy-a\nsocks5://{}#proxy-b\nsocks5://127.0.0.1:19998#proxy-c\n",
            socks_b
        ),
    )
    .unwrap();

    let cache_path = temp_path("cache");
    std::fs::write(
        &cache_path,
        r#"{"selected": {"grp": "proxy-b"}}"#,
    )
    .unwrap();

    let options = Options::parse_str(&format!(
        r#"{{
            "experimental": {{"cache_file": {{"enabled": true, "path": "{cache}", "store_selected": true}}}},
            "outbound_providers": [
                {{"tag": "sub", "type": "file", "path": "{sub}"}}
            ],
            "outbounds": [
                {{"type": "selector", "tag": "grp", "providers": ["sub"]}}
            ]
        }}"#,
        cache = cache_path.display(),
        sub = sub_path.display(),
    ))
    .unwrap();

    let gateway = Gateway::new(options).unwrap();
    gateway.pre_start().await.unwrap();

    let group_outbound = gateway.outbound("grp").unwrap();
    let group = group_outbound.as_group().unwrap();
    assert_eq!(group.now(), "proxy-b");
    assert_eq!(
        group.all(),
        vec!["proxy-a", "proxy-b", "proxy-c"]
    );

    let destination = Destination::new_fqdn("example.com", 80);
    let mut stream = group_outbound
        .connect(Network::Tcp, &destination)
        .await
        .unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"via-b");

    // select_by_tag succeeds exactly for members.
    assert!(group.select_by_tag("proxy-c").await);
    assert_eq!(group.now(), "proxy-c");
    assert!(!group.select_by_tag("not-a-member").await);
    assert_eq!(group.now(), "proxy-c");

    let _ = std::fs::remove_file(&sub_path);
    let _ = std::fs::remove_file(&cache_path);
}

/// URLTest picks the lowest-latency member; when that member fails its
/// history entry is deleted and the next best takes over.
#[tokio::test]
async fn test_urltest_prefers_lower_latency() {
    let options = Options::parse_str(
        r#"{
            "outbounds": [
                {"type": "direct", "tag": "A"},
                {"type": "direct", "tag": "B"},
                {"type": "direct", "tag": "C"},
                {"type": "urltest", "tag": "auto", "outbounds": ["A", "B", "C"], "tolerance": 50}
            ]
        }"#,
    )
    .unwrap();
    let gateway = Gateway::new(options).unwrap();
    gateway.pre_start().await.unwrap();

    let history = gateway.router().history();
    history.store("A", 200);
    history.store("C", 120);
    history.store("B", 80);

    let group_outbound = gateway.outbound("auto").unwrap();
    let group = group_outbound.as_group().unwrap();
    assert_eq!(group.selected(Network::Tcp).unwrap().tag(), "B");

    history.delete("B");
    group.refresh_selected();
    assert_eq!(group.selected(Network::Tcp).unwrap().tag(), "C");
}

struct StaticTransport {
    tag: String,
    addrs: Vec<IpAddr>,
    exchanges: AtomicUsize,
}

impl StaticTransport {
    fn new(tag: &str, addrs: Vec<IpAddr>) -> Arc<Self> {
        Arc::new(StaticTransport {
            tag: tag.to_string(),
            addrs,
            exchanges: AtomicUsize::new(0),
        })
    }

    fn count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DnsTransport for StaticTransport {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Udp
    }

    async fn exchange(&self, message: &Message) -> Result<Message> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        Ok(synthesize_response(message, &self.addrs, 600))
    }
}

fn dns_rule(raw: &str) -> DnsRule {
    let options: DnsRuleOptions = serde_json::from_str(raw).unwrap();
    DnsRule::new(&options, true).unwrap()
}

/// An address-limited rule that rejects its own answer resumes the walk at
/// the next rule, which serves the same addresses to the caller. No rule is
/// visited twice.
#[tokio::test]
async fn test_address_limit_rejection_drives_next_rule() {
    let us_ip: IpAddr = "93.184.216.34".parse().unwrap();
    let clean = StaticTransport::new("clean", vec![us_ip]);
    let fallback = StaticTransport::new("fallback", vec![us_ip]);
    let default = StaticTransport::new("default", vec![us_ip]);

    let mut transports: HashMap<String, Arc<dyn DnsTransport>> = HashMap::new();
    transports.insert("clean".to_string(), clean.clone());
    transports.insert("fallback".to_string(), fallback.clone());

    let rules = vec![
        // Only answers inside 10.0.0.0/8 are acceptable from "clean".
        dns_rule(r#"{"ip_cidr": ["10.0.0.0/8"], "server": "clean"}"#),
        dns_rule(r#"{"query_type": ["A"], "server": "fallback"}"#),
    ];
    let router = DnsRouter::new(
        DnsClient::new(&DnsOptions::default()),
        transports,
        HashMap::new(),
        default.clone(),
        DomainStrategy::AsIs,
        rules,
        true,
        None,
    );

    let query = build_query("example.com", RecordType::A).unwrap();
    let mut meta = FlowMetadata::new();
    let response = router.exchange(&query, &mut meta).await.unwrap();
    assert_eq!(message_to_addresses(&response), vec![us_ip]);

    assert_eq!(clean.count(), 1);
    assert_eq!(fallback.count(), 1);
    assert_eq!(default.count(), 0);

    // Successful non-fakeip answers populate the reverse mapping.
    assert_eq!(router.reverse_query(us_ip).as_deref(), Some("example.com"));
}

/// FakeIP answers never reach the reverse mapping.
#[tokio::test]
async fn test_fakeip_not_reverse_mapped() {
    let fake = Arc::new(FakeIpTransport::new("fake", None).unwrap());
    let mut transports: HashMap<String, Arc<dyn DnsTransport>> = HashMap::new();
    transports.insert("fake".to_string(), fake.clone());

    let rules = vec![dns_rule(
        r#"{"domain_suffix": ["fake.example"], "server": "fake"}"#,
    )];
    let default = StaticTransport::new("default", vec![]);
    let router = DnsRouter::new(
        DnsClient::new(&DnsOptions::default()),
        transports,
        HashMap::new(),
        default,
        DomainStrategy::AsIs,
        rules,
        true,
        None,
    );

    let query = build_query("www.fake.example", RecordType::A).unwrap();
    let mut meta = FlowMetadata::new();
    let response = router.exchange(&query, &mut meta).await.unwrap();
    let addrs = message_to_addresses(&response);
    assert_eq!(addrs.len(), 1);
    assert!(router.reverse_query(addrs[0]).is_none());
}

async fn spawn_subscription_server(
    body: &'static str,
    etag: &'static str,
) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            let hit = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = conn.read(&mut buf).await.ok()?;
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let not_modified = request.contains(&format!("If-None-Match: {}", etag));
                let response = if hit == 0 || !not_modified {
                    format!(
                        "HTTP/1.1 200 OK\r\nETag: {}\r\nsubscription-userinfo: upload=10; download=20; total=100; expire=4102444800\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        etag,
                        body.len(),
                        body
                    )
                } else {
                    format!(
                        "HTTP/1.1 304 Not Modified\r\nETag: {}\r\nsubscription-userinfo: upload=11; download=21; total=100; expire=4102444800\r\nConnection: close\r\n\r\n",
                        etag
                    )
                };
                conn.write_all(response.as_bytes()).await.ok()?;
                conn.shutdown().await.ok()?;
                Some(())
            });
        }
    });
    (addr, hits)
}

/// A 304 refresh leaves the outbound set untouched (pointer-equal), bumps
/// the cached file's timestamp, and refreshes the subscription counters.
#[tokio::test]
async fn test_http_provider_not_modified() {
    let body = "socks5://127.0.0.1:18081#node-a\nsocks5://127.0.0.1:18082#node-b\n";
    let (server, hits) = spawn_subscription_server(body, "\"v1\"").await;

    let cache_path = temp_path("http-sub");
    let router = Router::new(&Options::default()).unwrap();
    let provider_options = serde_json::from_value(serde_json::json!({
        "tag": "remote",
        "type": "http",
        "path": cache_path.display().to_string(),
        "url": format!("http://{}/sub", server),
        "detour": "d",
    }))
    .unwrap();

    let direct: Arc<dyn Outbound> = Arc::new(
        routebox::outbound::Direct::new(&router, "d", Default::default()).unwrap(),
    );
    router.register_outbound(direct).unwrap();

    let provider = HttpProvider::new(router.clone(), &provider_options).unwrap();
    router
        .register_provider(provider.clone() as Arc<dyn OutboundProvider>)
        .unwrap();

    provider.start().await.unwrap();
    provider.update(true).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let outbounds = provider.outbounds();
    assert_eq!(outbounds.len(), 2);
    assert_eq!(provider.sub_info().upload, 10);
    let first_update = provider.update_time();
    let first_mtime = std::fs::metadata(&cache_path).unwrap().modified().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    provider.update(true).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // Same children, newer update time, refreshed counters, bumped mtime.
    let after = provider.outbounds();
    assert_eq!(after.len(), 2);
    assert!(Arc::ptr_eq(&outbounds[0], &after[0]));
    assert!(Arc::ptr_eq(&outbounds[1], &after[1]));
    assert!(provider.update_time() > first_update);
    assert_eq!(provider.sub_info().upload, 11);
    let second_mtime = std::fs::metadata(&cache_path).unwrap().modified().unwrap();
    assert!(second_mtime > first_mtime);

    let _ = std::fs::remove_file(&cache_path);
}

/// Provider child tags colliding with static outbounds get `[n]` suffixes,
/// and groups see the suffixed members.
#[tokio::test]
async fn test_tag_collision_on_provider_load() {
    let sub_path = temp_path("collision");
    std::fs::write(
        &sub_path,
        "socks5://127.0.0.1:18091#proxy-a\nsocks5://127.0.0.1:18092#proxy-x\n",
    )
    .unwrap();

    let options = Options::parse_str(&format!(
        r#"{{
            "outbound_providers": [
                {{"tag": "sub", "type": "file", "path": "{}"}}
            ],
            "outbounds": [
                {{"type": "direct", "tag": "proxy-a"}},
                {{"type": "selector", "tag": "grp", "providers": ["sub"]}}
            ]
        }}"#,
        sub_path.display()
    ))
    .unwrap();
    let gateway = Gateway::new(options).unwrap();
    gateway.pre_start().await.unwrap();

    let provider = gateway.provider("sub").unwrap();
    let tags: Vec<String> = provider
        .outbounds()
        .iter()
        .map(|outbound| outbound.tag().to_string())
        .collect();
    assert_eq!(tags, vec!["proxy-a[1]", "proxy-x"]);

    let group_outbound = gateway.outbound("grp").unwrap();
    let group = group_outbound.as_group().unwrap();
    assert_eq!(group.all(), vec!["proxy-a[1]", "proxy-x"]);

    let _ = std::fs::remove_file(&sub_path);
}

/// Re-reading identical subscription content is a no-op: the child set
/// stays pointer-equal.
#[tokio::test]
async fn test_unchanged_refresh_keeps_children() {
    let sub_path = temp_path("unchanged");
    let body = "socks5://127.0.0.1:18093#node-a\n";
    std::fs::write(&sub_path, body).unwrap();

    let options = Options::parse_str(&format!(
        r#"{{
            "outbound_providers": [
                {{"tag": "sub", "type": "file", "path": "{}"}}
            ]
        }}"#,
        sub_path.display()
    ))
    .unwrap();
    let gateway = Gateway::new(options).unwrap();
    gateway.pre_start().await.unwrap();

    let provider = gateway.provider("sub").unwrap();
    let before = provider.outbounds();
    assert_eq!(before.len(), 1);

    // Rewrite the same content so only the mtime moves.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    std::fs::write(&sub_path, body).unwrap();
    provider.update(true).await.unwrap();

    let after = provider.outbounds();
    assert!(Arc::ptr_eq(&before[0], &after[0]));

    let _ = std::fs::remove_file(&sub_path);
}

/// A group whose filter matches nothing falls back to the sentinel.
#[tokio::test]
async fn test_empty_group_falls_back_to_sentinel() {
    let sub_path = temp_path("filtered");
    std::fs::write(&sub_path, "socks5://127.0.0.1:18094#node-a\n").unwrap();

    let options = Options::parse_str(&format!(
        r#"{{
            "outbound_providers": [
                {{"tag": "sub", "type": "file", "path": "{}"}}
            ],
            "outbounds": [
                {{"type": "selector", "tag": "grp", "providers": ["sub"], "includes": ["nothing-matches-this"]}}
            ]
        }}"#,
        sub_path.display()
    ))
    .unwrap();
    let gateway = Gateway::new(options).unwrap();
    gateway.pre_start().await.unwrap();

    let group_outbound = gateway.outbound("grp").unwrap();
    let group = group_outbound.as_group().unwrap();
    assert_eq!(group.now(), "OUTBOUNDLESS");
    assert_eq!(group.all(), vec!["OUTBOUNDLESS"]);

    let _ = std::fs::remove_file(&sub_path);
}
