//! Time-bounded route decision cache
//!
//! Repeated flows to the same destination skip sniffing and rule
//! evaluation for up to `ttl`. The map is a [`DashMap`], so lookups on
//! different shards never contend.
//!
//! # Eviction
//!
//! When a `put` finds the cache at capacity:
//!
//! 1. expired entries are dropped;
//! 2. if it is still full, the least-recently-accessed `eviction_percent`
//!    (default 20%) of entries are removed in one batch.
//!
//! Only one thread evicts at a time; concurrent writers skip eviction and
//! insert, so the bound can be overshot briefly under contention.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use routing_core::cache::{CacheKey, DecisionCache};
//! use routing_core::rules::FlowProtocol;
//!
//! let cache = DecisionCache::new(100, Duration::from_secs(30));
//! let key = CacheKey::host("Example.COM.", 443, FlowProtocol::Tcp);
//! assert!(cache.get(&key).is_none());
//! assert_eq!(key, CacheKey::host("example.com", 443, FlowProtocol::Tcp));
//! ```

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::rules::types::{normalize_domain, FlowProtocol, FlowTime, NetworkType, RouteDecision};

/// Default maximum number of cached decisions
pub const DEFAULT_CACHE_CAPACITY: usize = 5000;

/// Default decision lifetime
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Default share of entries removed by one eviction batch
pub const DEFAULT_EVICTION_PERCENT: u8 = 20;

/// What identifies the destination of a cached flow
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheTarget {
    /// Normalized host name known before sniffing
    Host(String),
    /// Hash of the buffered first bytes
    Payload(u64),
    /// Destination address
    Ip(IpAddr),
}

/// Decision cache key
///
/// Besides the destination it carries every flow attribute a matcher can
/// decide on: port, protocol, network class and package. The hour and
/// weekday are only part of the key when the table has time-window rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Destination identity
    pub target: CacheTarget,
    /// Destination port
    pub port: u16,
    /// Transport/application protocol
    pub protocol: FlowProtocol,
    /// Network class the flow was seen on
    pub network_type: NetworkType,
    /// Originating package
    pub package_id: Option<String>,
    /// Local hour and weekday
    pub time: Option<FlowTime>,
}

impl CacheKey {
    fn new(target: CacheTarget, port: u16, protocol: FlowProtocol) -> Self {
        Self {
            target,
            port,
            protocol,
            network_type: NetworkType::default(),
            package_id: None,
            time: None,
        }
    }

    /// Key for a flow whose host is known (normalized here)
    pub fn host(host: &str, port: u16, protocol: FlowProtocol) -> Self {
        Self::new(CacheTarget::Host(normalize_domain(host)), port, protocol)
    }

    /// Key for a flow identified by a hash of its first bytes
    #[must_use]
    pub fn payload(hash: u64, port: u16, protocol: FlowProtocol) -> Self {
        Self::new(CacheTarget::Payload(hash), port, protocol)
    }

    /// Key for a flow identified by its destination address
    #[must_use]
    pub fn ip(ip: IpAddr, port: u16, protocol: FlowProtocol) -> Self {
        Self::new(CacheTarget::Ip(ip), port, protocol)
    }

    /// Set the originating package.
    #[must_use]
    pub fn with_package(mut self, package_id: Option<&str>) -> Self {
        self.package_id = package_id.map(str::to_string);
        self
    }

    /// Set the network class.
    #[must_use]
    pub const fn with_network(mut self, network_type: NetworkType) -> Self {
        self.network_type = network_type;
        self
    }

    /// Set the hour and weekday.
    #[must_use]
    pub const fn with_time(mut self, time: FlowTime) -> Self {
        self.time = Some(time);
        self
    }
}

/// Cached decision with its bookkeeping
#[derive(Debug)]
struct CacheEntry {
    decision: RouteDecision,
    inserted_at: Instant,
    /// Logical access clock value of the last hit
    last_access: AtomicU64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.inserted_at) >= ttl
    }
}

/// Decision cache statistics
#[derive(Debug, Default)]
pub struct DecisionCacheStats {
    /// Lookups answered from the cache
    pub hits: AtomicU64,
    /// Lookups that found nothing usable
    pub misses: AtomicU64,
    /// Decisions stored
    pub insertions: AtomicU64,
    /// Entries dropped because their TTL ran out
    pub expirations: AtomicU64,
    /// Entries dropped by capacity eviction
    pub evictions: AtomicU64,
    /// Entries dropped by explicit invalidation
    pub invalidations: AtomicU64,
}

impl DecisionCacheStats {
    /// Get a snapshot of current stats
    #[must_use]
    pub fn snapshot(&self) -> DecisionCacheStatsSnapshot {
        DecisionCacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of decision cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionCacheStatsSnapshot {
    /// Cache hits
    pub hits: u64,
    /// Cache misses
    pub misses: u64,
    /// Decisions stored
    pub insertions: u64,
    /// TTL expirations
    pub expirations: u64,
    /// Capacity evictions
    pub evictions: u64,
    /// Explicit invalidations
    pub invalidations: u64,
}

impl DecisionCacheStatsSnapshot {
    /// Hit ratio over all lookups (0.0 when there were none)
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Concurrent decision cache with TTL and batched LRU eviction
#[derive(Debug)]
pub struct DecisionCache {
    entries: DashMap<CacheKey, CacheEntry>,
    capacity: usize,
    ttl: Duration,
    eviction_percent: u8,
    /// Monotonic access clock; higher is more recent
    clock: AtomicU64,
    evicting: Mutex<()>,
    stats: DecisionCacheStats,
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

impl DecisionCache {
    /// Create a cache holding at most `capacity` decisions for `ttl` each
    ///
    /// A zero capacity disables caching.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity.min(DEFAULT_CACHE_CAPACITY)),
            capacity,
            ttl,
            eviction_percent: DEFAULT_EVICTION_PERCENT,
            clock: AtomicU64::new(0),
            evicting: Mutex::new(()),
            stats: DecisionCacheStats::default(),
        }
    }

    /// Set the share of entries removed per eviction batch (1-100)
    #[must_use]
    pub fn with_eviction_percent(mut self, percent: u8) -> Self {
        self.eviction_percent = percent.clamp(1, 100);
        self
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a decision
    ///
    /// An expired entry is removed and reported as absent.
    pub fn get(&self, key: &CacheKey) -> Option<RouteDecision> {
        let now = Instant::now();
        {
            let Some(entry) = self.entries.get(key) else {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            if !entry.is_expired(now, self.ttl) {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.decision.clone());
            }
        }

        let ttl = self.ttl;
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now, ttl))
            .is_some()
        {
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a decision, evicting first if the cache is full
    pub fn put(&self, key: CacheKey, decision: RouteDecision) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.evict();
        }

        let entry = CacheEntry {
            decision,
            inserted_at: Instant::now(),
            last_access: AtomicU64::new(self.tick()),
        };
        self.entries.insert(key, entry);
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one decision
    ///
    /// Returns true if an entry was removed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every decision
    pub fn invalidate_all(&self) {
        let count = self.entries.len();
        self.entries.clear();
        if count > 0 {
            self.stats
                .invalidations
                .fetch_add(count as u64, Ordering::Relaxed);
            debug!(count, "decision cache invalidated");
        }
    }

    /// Remove expired entries
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if entry.is_expired(now, ttl) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            self.stats
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    fn evict(&self) {
        let Some(_guard) = self.evicting.try_lock() else {
            return;
        };

        if self.cleanup_expired() > 0 && self.entries.len() < self.capacity {
            return;
        }

        // Concurrent writers may have overshot; always get back under capacity
        let overshoot = (self.entries.len() + 1).saturating_sub(self.capacity);
        let batch = (self.capacity * usize::from(self.eviction_percent) / 100)
            .max(overshoot)
            .max(1);
        let mut by_age: Vec<(u64, CacheKey)> = self
            .entries
            .iter()
            .map(|e| (e.value().last_access.load(Ordering::Relaxed), e.key().clone()))
            .collect();
        if batch < by_age.len() {
            by_age.select_nth_unstable_by_key(batch, |(access, _)| *access);
            by_age.truncate(batch);
        }

        let mut evicted = 0u64;
        for (_, key) in by_age {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!(evicted, remaining = self.entries.len(), "decision cache eviction");
    }

    /// Number of cached decisions (including expired ones not yet removed)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Decision lifetime
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> &DecisionCacheStats {
        &self.stats
    }
}
