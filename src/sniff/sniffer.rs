//! Port-hinted sniffer with a short-lived result cache

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use super::http::{extract_http_host, looks_like_http};
use super::result::{SniffProtocol, SniffResult};
use super::tls::{extract_tls_host, looks_like_tls};

/// Default lifetime of a cached sniff result
pub const DEFAULT_SNIFF_CACHE_TTL: Duration = Duration::from_secs(10);

/// Default number of cached sniff results
pub const DEFAULT_SNIFF_CACHE_CAPACITY: usize = 1024;

/// Ports where plain HTTP is expected
const HTTP_PORTS: [u16; 4] = [80, 8080, 8000, 3128];

/// Ports where TLS is expected
const TLS_PORTS: [u16; 2] = [443, 8443];

/// Sniff the first bytes of a flow
///
/// The port picks which extractor runs first; the other one runs if the
/// first finds nothing. Pure function, no caching.
///
/// # Example
///
/// ```
/// use routing_core::sniff::{sniff_payload, SniffProtocol};
///
/// let result = sniff_payload(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", 443);
/// assert!(result.success);
/// assert_eq!(result.protocol, SniffProtocol::Http);
/// assert_eq!(result.host.as_deref(), Some("example.com"));
/// ```
#[must_use]
pub fn sniff_payload(data: &[u8], port: u16) -> SniffResult {
    if data.is_empty() {
        return SniffResult::unknown();
    }

    let tls_first = if TLS_PORTS.contains(&port) {
        true
    } else if HTTP_PORTS.contains(&port) {
        false
    } else {
        looks_like_tls(data)
    };

    let order = if tls_first {
        [SniffProtocol::Tls, SniffProtocol::Http]
    } else {
        [SniffProtocol::Http, SniffProtocol::Tls]
    };

    for protocol in order {
        let host = match protocol {
            SniffProtocol::Tls => extract_tls_host(data),
            _ => extract_http_host(data),
        };
        if let Some(host) = host {
            return SniffResult::found(protocol, host);
        }
    }

    if looks_like_tls(data) {
        SniffResult::failed(SniffProtocol::Tls)
    } else if looks_like_http(data) {
        SniffResult::failed(SniffProtocol::Http)
    } else {
        SniffResult::unknown()
    }
}

/// Sniffer statistics
#[derive(Debug, Default)]
pub struct SnifferStats {
    /// Calls to [`TrafficSniffer::sniff`]
    pub requests: AtomicU64,
    /// Payloads actually parsed (cache misses)
    pub parses: AtomicU64,
    /// Results served from the cache
    pub cache_hits: AtomicU64,
    /// Parses that extracted a host
    pub hosts_found: AtomicU64,
}

impl SnifferStats {
    /// Get a snapshot of current stats
    #[must_use]
    pub fn snapshot(&self) -> SnifferStatsSnapshot {
        SnifferStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            parses: self.parses.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            hosts_found: self.hosts_found.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sniffer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnifferStatsSnapshot {
    /// Calls to `sniff`
    pub requests: u64,
    /// Cache misses that ran the parsers
    pub parses: u64,
    /// Cache hits
    pub cache_hits: u64,
    /// Parses that extracted a host
    pub hosts_found: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SniffKey {
    content_hash: u64,
    len: usize,
    port: u16,
}

#[derive(Debug, Clone)]
struct CachedSniff {
    result: SniffResult,
    expires_at: Instant,
}

/// Traffic sniffer with a content-keyed result cache
///
/// Retransmitted or repeated first packets are answered from the cache for
/// a short TTL so the parsers run once per distinct payload.
#[derive(Debug)]
pub struct TrafficSniffer {
    cache: DashMap<SniffKey, CachedSniff>,
    ttl: Duration,
    capacity: usize,
    hasher: ahash::RandomState,
    stats: SnifferStats,
}

impl Default for TrafficSniffer {
    fn default() -> Self {
        Self::new(DEFAULT_SNIFF_CACHE_TTL, DEFAULT_SNIFF_CACHE_CAPACITY)
    }
}

impl TrafficSniffer {
    /// Create a sniffer with the given cache TTL and capacity
    ///
    /// A zero capacity disables the cache.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            cache: DashMap::with_capacity(capacity.min(DEFAULT_SNIFF_CACHE_CAPACITY)),
            ttl,
            capacity,
            hasher: ahash::RandomState::new(),
            stats: SnifferStats::default(),
        }
    }

    /// Sniff the first bytes of a flow to port `port`
    pub fn sniff(&self, data: &[u8], port: u16) -> SniffResult {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        if data.is_empty() {
            return SniffResult::unknown();
        }

        let key = SniffKey {
            content_hash: self.hasher.hash_one(data),
            len: data.len(),
            port,
        };

        if let Some(cached) = self.cache.get(&key) {
            if cached.expires_at > Instant::now() {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return cached.result.clone();
            }
        }

        self.stats.parses.fetch_add(1, Ordering::Relaxed);
        let result = sniff_payload(data, port);
        if result.success {
            self.stats.hosts_found.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            port,
            protocol = %result.protocol,
            host = result.host.as_deref().unwrap_or("-"),
            "sniffed flow"
        );

        if self.capacity > 0 {
            self.make_room();
            self.cache.insert(
                key,
                CachedSniff {
                    result: result.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }

        result
    }

    /// Evict expired entries, then arbitrary ones, until one slot is free
    fn make_room(&self) {
        if self.cache.len() < self.capacity {
            return;
        }
        let now = Instant::now();
        self.cache.retain(|_, entry| entry.expires_at > now);

        let excess = (self.cache.len() + 1).saturating_sub(self.capacity);
        if excess > 0 {
            let victims: Vec<SniffKey> = self
                .cache
                .iter()
                .take(excess)
                .map(|entry| *entry.key())
                .collect();
            for key in victims {
                self.cache.remove(&key);
            }
        }
    }

    /// Drop every cached result
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of cached results (including expired ones not yet evicted)
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> &SnifferStats {
        &self.stats
    }
}
