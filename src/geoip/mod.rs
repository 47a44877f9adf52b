//! Lazily loaded IP geolocation
//!
//! [`GeoIpLookup`] answers "which country is this address in" for `GeoIp`
//! rule matchers. The database is loaded from its [`GeoIpSource`] on the
//! first query, not at startup. If loading fails, the failure is logged once
//! and every lookup returns `None` until [`GeoIpLookup::reload`] re-arms
//! loading.
//!
//! Answers, including negative ones, are kept in a small insertion-ordered
//! query cache.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use routing_core::geoip::{CountryDatabase, GeoIpLookup, StaticSource};
//!
//! let mut db = CountryDatabase::new();
//! db.insert("203.0.113.0/24".parse().unwrap(), "jp").unwrap();
//!
//! let geoip = GeoIpLookup::new(Arc::new(StaticSource(Arc::new(db))), 100);
//! assert_eq!(geoip.lookup_country("203.0.113.5".parse().unwrap()), Some("JP".to_string()));
//! assert_eq!(geoip.lookup_country("198.51.100.1".parse().unwrap()), None);
//! ```

mod database;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub use database::{CountryDatabase, GeoIpSource, JsonFileSource, StaticSource};

/// Default number of cached query answers
pub const DEFAULT_QUERY_CACHE_SIZE: usize = 100;

/// Database load state
#[derive(Clone)]
enum LoadState {
    NotLoaded,
    Loaded(Arc<CountryDatabase>),
    Unavailable,
}

/// Externally visible load status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoIpStatus {
    /// No query has needed the database yet
    NotLoaded,
    /// Database in memory
    Loaded {
        /// Number of ranges
        ranges: usize,
    },
    /// Loading failed or no source is configured
    Unavailable,
}

/// Bounded map of answers, evicting in insertion order
///
/// `generation` is bumped on every clear; an answer computed under an older
/// generation came from a database that has since been dropped.
#[derive(Debug, Default)]
struct QueryCache {
    answers: HashMap<IpAddr, Option<String>>,
    order: VecDeque<IpAddr>,
    generation: u64,
}

impl QueryCache {
    fn get(&self, ip: &IpAddr) -> Option<Option<String>> {
        self.answers.get(ip).cloned()
    }

    fn insert(&mut self, ip: IpAddr, answer: Option<String>, generation: u64, capacity: usize) {
        if capacity == 0 || generation != self.generation {
            return;
        }
        if self.answers.insert(ip, answer).is_none() {
            self.order.push_back(ip);
        }
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.answers.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.answers.clear();
        self.order.clear();
        self.generation += 1;
    }

    fn len(&self) -> usize {
        self.answers.len()
    }
}

/// `GeoIP` statistics
#[derive(Debug, Default)]
pub struct GeoIpStats {
    /// Country lookups
    pub queries: AtomicU64,
    /// Lookups answered from the query cache
    pub cache_hits: AtomicU64,
    /// Successful database loads
    pub loads: AtomicU64,
    /// Failed database loads
    pub load_failures: AtomicU64,
}

impl GeoIpStats {
    /// Get a snapshot of current stats
    #[must_use]
    pub fn snapshot(&self) -> GeoIpStatsSnapshot {
        GeoIpStatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of `GeoIP` statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeoIpStatsSnapshot {
    /// Country lookups
    pub queries: u64,
    /// Query cache hits
    pub cache_hits: u64,
    /// Successful loads
    pub loads: u64,
    /// Failed loads
    pub load_failures: u64,
}

/// Lazily loaded country lookup with a query cache
pub struct GeoIpLookup {
    source: Option<Arc<dyn GeoIpSource>>,
    state: RwLock<LoadState>,
    cache: Mutex<QueryCache>,
    cache_size: usize,
    stats: GeoIpStats,
}

impl fmt::Debug for GeoIpLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoIpLookup")
            .field("source", &self.source.as_ref().map(|s| s.describe()))
            .field("status", &self.status())
            .field("cached", &self.cache.lock().len())
            .field("cache_size", &self.cache_size)
            .finish()
    }
}

impl GeoIpLookup {
    /// Create a lookup backed by `source`
    #[must_use]
    pub fn new(source: Arc<dyn GeoIpSource>, cache_size: usize) -> Self {
        Self {
            source: Some(source),
            state: RwLock::new(LoadState::NotLoaded),
            cache: Mutex::new(QueryCache::default()),
            cache_size,
            stats: GeoIpStats::default(),
        }
    }

    /// Create a lookup reading the JSON database at `path`
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>, cache_size: usize) -> Self {
        Self::new(Arc::new(JsonFileSource::new(path)), cache_size)
    }

    /// Create a lookup with no database; every query answers `None`
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            source: None,
            state: RwLock::new(LoadState::Unavailable),
            cache: Mutex::new(QueryCache::default()),
            cache_size: 0,
            stats: GeoIpStats::default(),
        }
    }

    /// Country code (uppercase ISO 3166 alpha-2) of `ip`
    ///
    /// Loads the database on first use. Returns `None` when the address is
    /// not covered or the database is unavailable.
    pub fn lookup_country(&self, ip: IpAddr) -> Option<String> {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);

        let generation = {
            let cache = self.cache.lock();
            if let Some(answer) = cache.get(&ip) {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return answer;
            }
            cache.generation
        };

        let db = self.database()?;
        let answer = db.lookup(ip).map(str::to_string);
        debug!(%ip, country = answer.as_deref().unwrap_or("-"), "GeoIP lookup");
        // Dropped if reload() ran since the generation was read
        self.cache
            .lock()
            .insert(ip, answer.clone(), generation, self.cache_size);
        answer
    }

    /// Loaded database, loading it if this is the first use
    fn database(&self) -> Option<Arc<CountryDatabase>> {
        match &*self.state.read() {
            LoadState::Loaded(db) => return Some(Arc::clone(db)),
            LoadState::Unavailable => return None,
            LoadState::NotLoaded => {}
        }

        let mut state = self.state.write();
        // Another thread may have loaded while we waited for the write lock
        match &*state {
            LoadState::Loaded(db) => return Some(Arc::clone(db)),
            LoadState::Unavailable => return None,
            LoadState::NotLoaded => {}
        }

        let Some(source) = &self.source else {
            *state = LoadState::Unavailable;
            return None;
        };

        match source.load() {
            Ok(db) => {
                info!(
                    source = %source.describe(),
                    countries = db.country_count(),
                    ranges = db.range_count(),
                    "GeoIP database loaded"
                );
                self.stats.loads.fetch_add(1, Ordering::Relaxed);
                *state = LoadState::Loaded(Arc::clone(&db));
                Some(db)
            }
            Err(e) => {
                // Logged once: the state stays Unavailable until reload()
                warn!(
                    source = %source.describe(),
                    error = %e,
                    "GeoIP database unavailable, country rules will not match"
                );
                self.stats.load_failures.fetch_add(1, Ordering::Relaxed);
                *state = LoadState::Unavailable;
                None
            }
        }
    }

    /// Drop the database and query cache; the next query loads again
    pub fn reload(&self) {
        if self.source.is_none() {
            return;
        }
        *self.state.write() = LoadState::NotLoaded;
        self.cache.lock().clear();
        debug!("GeoIP lookup re-armed");
    }

    /// Current load status
    #[must_use]
    pub fn status(&self) -> GeoIpStatus {
        match &*self.state.read() {
            LoadState::NotLoaded => GeoIpStatus::NotLoaded,
            LoadState::Loaded(db) => GeoIpStatus::Loaded {
                ranges: db.range_count(),
            },
            LoadState::Unavailable => GeoIpStatus::Unavailable,
        }
    }

    /// Number of cached answers
    #[must_use]
    pub fn cached_queries(&self) -> usize {
        self.cache.lock().len()
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> &GeoIpStats {
        &self.stats
    }
}
