//! Country CIDR database and its loaders
//!
//! The on-device database is a JSON document listing each country with its
//! IPv4 and IPv6 ranges:
//!
//! ```json
//! {
//!   "countries": [
//!     { "code": "jp", "name": "Japan",
//!       "ipv4_ranges": ["203.0.113.0/24"], "ipv6_ranges": ["2001:db8::/32"] }
//!   ]
//! }
//! ```
//!
//! Lookups use longest-prefix match: ranges are bucketed by prefix length
//! and probed from the most specific length down.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ipnet::IpNet;
use serde::Deserialize;
use tracing::debug;

use crate::error::GeoIpError;

#[derive(Debug, Deserialize)]
struct DatabaseFile {
    countries: Vec<CountryData>,
}

/// Country entry of the database file
#[derive(Debug, Deserialize)]
struct CountryData {
    code: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    ipv4_ranges: Vec<String>,
    #[serde(default)]
    ipv6_ranges: Vec<String>,
}

/// Prefix-length buckets for one address family
#[derive(Debug)]
struct PrefixTable<A> {
    /// `buckets[len]` maps masked network addresses of that length to a
    /// country index
    buckets: Vec<HashMap<A, u16>>,
    /// Non-empty prefix lengths, most specific first
    lengths: Vec<u8>,
}

impl<A> PrefixTable<A>
where
    A: Copy + Eq + std::hash::Hash,
{
    fn with_width(bits: usize) -> Self {
        Self {
            buckets: (0..=bits).map(|_| HashMap::new()).collect(),
            lengths: Vec::new(),
        }
    }

    fn insert(&mut self, prefix_len: u8, network: A, country: u16) {
        let bucket = &mut self.buckets[usize::from(prefix_len)];
        // First definition of a range wins
        bucket.entry(network).or_insert(country);
        if !self.lengths.contains(&prefix_len) {
            self.lengths.push(prefix_len);
            self.lengths.sort_unstable_by(|a, b| b.cmp(a));
        }
    }

    fn lookup(&self, mask: impl Fn(u8) -> A) -> Option<u16> {
        self.lengths
            .iter()
            .find_map(|&len| self.buckets[usize::from(len)].get(&mask(len)).copied())
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(HashMap::len).sum()
    }
}

fn mask_v4(addr: u32, len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        addr & (u32::MAX << (32 - u32::from(len)))
    }
}

fn mask_v6(addr: u128, len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        addr & (u128::MAX << (128 - u32::from(len)))
    }
}

/// In-memory country database
#[derive(Debug)]
pub struct CountryDatabase {
    /// Uppercase ISO codes, indexed by the prefix tables
    codes: Vec<String>,
    names: HashMap<String, String>,
    v4: PrefixTable<u32>,
    v6: PrefixTable<u128>,
}

impl Default for CountryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl CountryDatabase {
    /// Create an empty database
    #[must_use]
    pub fn new() -> Self {
        Self {
            codes: Vec::new(),
            names: HashMap::new(),
            v4: PrefixTable::with_width(32),
            v6: PrefixTable::with_width(128),
        }
    }

    /// Parse the JSON database format
    ///
    /// # Errors
    ///
    /// Returns `GeoIpError::Malformed` if the document does not parse, a
    /// country code is not two letters, or a range is not a valid CIDR.
    pub fn from_json(json: &str) -> Result<Self, GeoIpError> {
        let file: DatabaseFile =
            serde_json::from_str(json).map_err(|e| GeoIpError::Malformed(e.to_string()))?;

        let mut db = Self::new();
        for country in file.countries {
            let code = country.code.trim();
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(GeoIpError::Malformed(format!(
                    "invalid country code: {code:?}"
                )));
            }
            for range in country.ipv4_ranges.iter().chain(&country.ipv6_ranges) {
                let net: IpNet = range.trim().parse().map_err(|_| {
                    GeoIpError::Malformed(format!("invalid CIDR for {code}: {range}"))
                })?;
                db.insert(net, code)?;
            }
            if !country.name.is_empty() {
                db.names
                    .insert(code.to_ascii_uppercase(), country.name.clone());
            }
        }
        Ok(db)
    }

    /// Add a range for a country
    ///
    /// # Errors
    ///
    /// Returns `GeoIpError::Malformed` if more than `u16::MAX` countries are
    /// added.
    pub fn insert(&mut self, net: IpNet, country: &str) -> Result<(), GeoIpError> {
        let code = country.trim().to_ascii_uppercase();
        let index = match self.codes.iter().position(|c| *c == code) {
            Some(i) => i,
            None => {
                self.codes.push(code);
                self.codes.len() - 1
            }
        };
        let index = u16::try_from(index)
            .map_err(|_| GeoIpError::Malformed("too many countries".into()))?;

        let net = net.trunc();
        match net {
            IpNet::V4(v4) => self
                .v4
                .insert(v4.prefix_len(), u32::from(v4.network()), index),
            IpNet::V6(v6) => self
                .v6
                .insert(v6.prefix_len(), u128::from(v6.network()), index),
        }
        Ok(())
    }

    /// Country code (uppercase) of the most specific range containing `ip`
    #[must_use]
    pub fn lookup(&self, ip: IpAddr) -> Option<&str> {
        let index = match ip {
            IpAddr::V4(v4) => {
                let addr = u32::from(v4);
                self.v4.lookup(|len| mask_v4(addr, len))
            }
            IpAddr::V6(v6) => {
                // IPv4-mapped addresses are looked up as IPv4
                if let Some(v4) = v6.to_ipv4_mapped() {
                    return self.lookup(IpAddr::V4(v4));
                }
                let addr = u128::from(v6);
                self.v6.lookup(|len| mask_v6(addr, len))
            }
        }?;
        self.codes.get(usize::from(index)).map(String::as_str)
    }

    /// Country name for a code, if the database carries one
    #[must_use]
    pub fn country_name(&self, code: &str) -> Option<&str> {
        self.names
            .get(&code.to_ascii_uppercase())
            .map(String::as_str)
    }

    /// Number of countries
    #[must_use]
    pub fn country_count(&self) -> usize {
        self.codes.len()
    }

    /// Number of ranges across both families
    #[must_use]
    pub fn range_count(&self) -> usize {
        self.v4.len() + self.v6.len()
    }
}

/// Where a [`CountryDatabase`] comes from
///
/// Loading happens on first use, and again after a reload.
pub trait GeoIpSource: Send + Sync {
    /// Load the database
    ///
    /// # Errors
    ///
    /// Returns `GeoIpError` if the database is missing or malformed.
    fn load(&self) -> Result<Arc<CountryDatabase>, GeoIpError>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Loads the JSON database from a file
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    /// Create a source for the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Database file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl GeoIpSource for JsonFileSource {
    fn load(&self) -> Result<Arc<CountryDatabase>, GeoIpError> {
        if !self.path.exists() {
            return Err(GeoIpError::NotFound {
                path: self.path.display().to_string(),
            });
        }
        let content = fs::read_to_string(&self.path)?;
        let db = CountryDatabase::from_json(&content)?;
        debug!(
            path = %self.path.display(),
            countries = db.country_count(),
            ranges = db.range_count(),
            "GeoIP database parsed"
        );
        Ok(Arc::new(db))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Serves an already-built database
#[derive(Debug, Clone)]
pub struct StaticSource(pub Arc<CountryDatabase>);

impl GeoIpSource for StaticSource {
    fn load(&self) -> Result<Arc<CountryDatabase>, GeoIpError> {
        Ok(Arc::clone(&self.0))
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}
