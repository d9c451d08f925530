//! Reverse mapping of answered addresses back to the queried domain.

use lru::LruCache;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

const DEFAULT_CAPACITY: usize = 4096;

pub struct ReverseMapping {
    cache: Mutex<LruCache<IpAddr, (String, Instant)>>,
}

impl ReverseMapping {
    pub fn new() -> Self {
        ReverseMapping {
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap())),
        }
    }

    /// Remember `ip -> domain` for `ttl` seconds.
    pub fn save(&self, ip: IpAddr, domain: &str, ttl: u32) {
        let expires = Instant::now() + Duration::from_secs(u64::from(ttl));
        self.cache.lock().put(ip, (domain.to_string(), expires));
    }

    pub fn query(&self, ip: IpAddr) -> Option<String> {
        let mut cache = self.cache.lock();
        match cache.get(&ip) {
            Some((domain, expires)) if *expires > Instant::now() => Some(domain.clone()),
            Some(_) => {
                cache.pop(&ip);
                None
            }
            None => None,
        }
    }
}

impl Default for ReverseMapping {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_query_expire() {
        let mapping = ReverseMapping::new();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert!(mapping.query(ip).is_none());

        mapping.save(ip, "example.com", 60);
        assert_eq!(mapping.query(ip).as_deref(), Some("example.com"));

        // Zero TTL entries are immediately stale.
        mapping.save(ip, "example.com", 0);
        assert!(mapping.query(ip).is_none());
    }
}
