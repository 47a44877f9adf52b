//! Immutable route table with copy-on-write updates
//!
//! A [`RouteTable`] is never mutated once built. Every edit (`with_rule_added`,
//! `with_rule_removed`, ...) validates the change and returns a new table with
//! its `version` bumped, so readers holding an `Arc` to the old table keep a
//! consistent view.
//!
//! # Example
//!
//! ```
//! use routing_core::rules::{Action, Matcher, RouteTable, RoutingRule};
//!
//! let table = RouteTable::builder()
//!     .rule(RoutingRule::new("r1", vec![Matcher::domain_suffix(["example.com"])], Action::Proxy))
//!     .build()
//!     .unwrap();
//!
//! let next = table
//!     .with_rule_removed("r1")
//!     .unwrap();
//! assert_eq!(table.len(), 1);
//! assert_eq!(next.len(), 0);
//! assert_eq!(next.version(), table.version() + 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::types::{Action, Matcher, RoutingRule, TAG_DIRECT, TAG_PROXY};
use crate::error::RuleError;

/// Default fallback chain when none is configured
#[must_use]
pub fn default_fallback_chain() -> Vec<String> {
    vec![TAG_DIRECT.to_string(), TAG_PROXY.to_string()]
}

/// Immutable routing configuration
///
/// Rules are kept in declaration order; `evaluation_order` holds the indices
/// of enabled rules sorted by priority descending, ties kept in declaration
/// order.
///
/// Deserialization goes through [`RouteTableBuilder::build`], so a table read
/// from JSON is validated and indexed like one built in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RouteTableRepr")]
pub struct RouteTable {
    rules: Vec<RoutingRule>,
    outbound_tags: HashMap<String, String>,
    sniff_enabled: bool,
    fallback_chain: Vec<String>,
    geosite: Arc<HashMap<String, Vec<String>>>,
    version: u64,
    #[serde(skip)]
    evaluation_order: Vec<usize>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            outbound_tags: HashMap::new(),
            sniff_enabled: true,
            fallback_chain: default_fallback_chain(),
            geosite: Arc::new(HashMap::new()),
            version: 0,
            evaluation_order: Vec::new(),
        }
    }
}

impl RouteTable {
    /// Create a new builder
    #[must_use]
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::new()
    }

    /// Table with no rules and the default fallback chain
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// All rules in declaration order
    #[must_use]
    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Enabled rules in evaluation order (priority descending, stable)
    pub fn rules_by_priority(&self) -> impl Iterator<Item = &RoutingRule> {
        self.evaluation_order.iter().map(|&i| &self.rules[i])
    }

    /// Look up a rule by id
    #[must_use]
    pub fn rule(&self, id: &str) -> Option<&RoutingRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Number of rules (enabled or not)
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check if the table has no rules
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Tag to outbound id mapping
    #[must_use]
    pub fn outbound_tags(&self) -> &HashMap<String, String> {
        &self.outbound_tags
    }

    /// Whether pre-DNS sniffing is enabled
    #[must_use]
    pub const fn sniff_enabled(&self) -> bool {
        self.sniff_enabled
    }

    /// Ordered fallback tags; never empty
    #[must_use]
    pub fn fallback_chain(&self) -> &[String] {
        &self.fallback_chain
    }

    /// Suffix list of a geosite category
    #[must_use]
    pub fn geosite(&self, category: &str) -> Option<&[String]> {
        self.geosite.get(category).map(Vec::as_slice)
    }

    /// Monotonic table version, bumped on every copy-on-write edit
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Whether any enabled rule needs a `GeoIP` country
    #[must_use]
    pub fn has_geoip_rules(&self) -> bool {
        self.rules_by_priority().any(RoutingRule::needs_geoip)
    }

    /// Whether any enabled rule has a time-window matcher
    #[must_use]
    pub fn has_time_rules(&self) -> bool {
        self.rules_by_priority()
            .any(|r| r.matchers.iter().any(|m| matches!(m, Matcher::Time { .. })))
    }

    /// Resolve the fallback chain to the first usable action
    ///
    /// Returns the action and the tag it came from. Construction guarantees
    /// at least one entry resolves.
    #[must_use]
    pub fn resolve_fallback(&self) -> Option<(Action, &str)> {
        self.fallback_chain.iter().find_map(|tag| {
            Action::from_tag(tag, &self.outbound_tags).map(|action| (action, tag.as_str()))
        })
    }

    /// Outbound tag an action maps to
    ///
    /// Built-in actions map to their built-in tags; custom outbounds map back
    /// to the tag registered for their id.
    #[must_use]
    pub fn outbound_tag_for(&self, action: &Action) -> Option<String> {
        match action {
            Action::CustomProxy(id) => self
                .outbound_tags
                .iter()
                .filter(|(_, v)| *v == id)
                .map(|(tag, _)| tag)
                .min()
                .cloned(),
            other => Some(other.to_string()),
        }
    }

    /// New table with one more rule appended
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if the rule is invalid or its id already exists.
    pub fn with_rule_added(&self, rule: RoutingRule) -> Result<Self, RuleError> {
        let mut rules = self.rules.clone();
        rules.push(rule);
        self.derive(|b| b.rules = rules)
    }

    /// New table with the rule of the same id replaced in place
    ///
    /// # Errors
    ///
    /// Returns `RuleError::NotFound` if no rule has that id, or a validation
    /// error for the new rule.
    pub fn with_rule_updated(&self, rule: RoutingRule) -> Result<Self, RuleError> {
        let index = self
            .rules
            .iter()
            .position(|r| r.id == rule.id)
            .ok_or_else(|| RuleError::NotFound(rule.id.clone()))?;
        let mut rules = self.rules.clone();
        rules[index] = rule;
        self.derive(|b| b.rules = rules)
    }

    /// New table without the rule of that id
    ///
    /// # Errors
    ///
    /// Returns `RuleError::NotFound` if no rule has that id.
    pub fn with_rule_removed(&self, id: &str) -> Result<Self, RuleError> {
        if self.rule(id).is_none() {
            return Err(RuleError::NotFound(id.to_string()));
        }
        let rules = self.rules.iter().filter(|r| r.id != id).cloned().collect();
        self.derive(|b| b.rules = rules)
    }

    /// New table with the whole rule list replaced
    ///
    /// # Errors
    ///
    /// Returns the first `RuleError` found in the new rule list.
    pub fn with_rules(&self, rules: Vec<RoutingRule>) -> Result<Self, RuleError> {
        self.derive(|b| b.rules = rules)
    }

    /// New table with no rules
    #[must_use]
    pub fn cleared(&self) -> Self {
        let mut next = self.clone();
        next.rules.clear();
        next.evaluation_order.clear();
        next.version = self.version + 1;
        next
    }

    /// New table with sniffing switched on or off
    #[must_use]
    pub fn with_sniff_enabled(&self, enabled: bool) -> Self {
        let mut next = self.clone();
        next.sniff_enabled = enabled;
        next.version = self.version + 1;
        next
    }

    /// New table with a different fallback chain
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidFallback` if the chain is empty or has an
    /// unresolvable entry.
    pub fn with_fallback_chain(&self, chain: Vec<String>) -> Result<Self, RuleError> {
        self.derive(|b| b.fallback_chain = chain)
    }

    /// New table with a different outbound tag map
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if existing rules or the fallback chain reference
    /// tags that the new map drops.
    pub fn with_outbound_tags(&self, tags: HashMap<String, String>) -> Result<Self, RuleError> {
        self.derive(|b| b.outbound_tags = tags)
    }

    /// Rebuild through the builder so every edit is fully revalidated
    fn derive(&self, edit: impl FnOnce(&mut RouteTableBuilder)) -> Result<Self, RuleError> {
        let mut builder = self.to_builder().version(self.version + 1);
        edit(&mut builder);
        builder.build()
    }

    /// Revalidate this table under another version
    pub(crate) fn rebuilt_as(&self, version: u64) -> Result<Self, RuleError> {
        self.to_builder().version(version).build()
    }

    fn to_builder(&self) -> RouteTableBuilder {
        RouteTableBuilder {
            rules: self.rules.clone(),
            outbound_tags: self.outbound_tags.clone(),
            sniff_enabled: self.sniff_enabled,
            fallback_chain: self.fallback_chain.clone(),
            geosite: (*self.geosite).clone(),
            version: self.version,
        }
    }
}

impl PartialEq for RouteTable {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.rules == other.rules
            && self.outbound_tags == other.outbound_tags
            && self.sniff_enabled == other.sniff_enabled
            && self.fallback_chain == other.fallback_chain
            && self.geosite == other.geosite
    }
}

/// Wire form of [`RouteTable`]
#[derive(Deserialize)]
struct RouteTableRepr {
    rules: Vec<RoutingRule>,
    outbound_tags: HashMap<String, String>,
    sniff_enabled: bool,
    fallback_chain: Vec<String>,
    geosite: HashMap<String, Vec<String>>,
    version: u64,
}

impl TryFrom<RouteTableRepr> for RouteTable {
    type Error = RuleError;

    fn try_from(repr: RouteTableRepr) -> Result<Self, Self::Error> {
        RouteTableBuilder {
            rules: repr.rules,
            outbound_tags: repr.outbound_tags,
            sniff_enabled: repr.sniff_enabled,
            fallback_chain: repr.fallback_chain,
            geosite: repr.geosite,
            version: repr.version,
        }
        .build()
    }
}

fn evaluation_order(rules: &[RoutingRule]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..rules.len()).filter(|&i| rules[i].enabled).collect();
    // sort_by_key is stable: equal priorities keep declaration order
    order.sort_by_key(|&i| std::cmp::Reverse(rules[i].priority));
    order
}

/// Builder for [`RouteTable`]
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use routing_core::rules::{Action, Matcher, RouteTable, RoutingRule};
///
/// let table = RouteTable::builder()
///     .outbound_tag("jp", "wg-tokyo")
///     .fallback_chain(vec!["jp".into(), "direct".into()])
///     .rule(RoutingRule::new("games", vec![Matcher::domain_suffix(["game.example"])], Action::CustomProxy("wg-tokyo".into())))
///     .version(3)
///     .build()
///     .unwrap();
///
/// assert_eq!(table.version(), 3);
/// assert_eq!(table.fallback_chain()[0], "jp");
/// ```
#[derive(Debug, Clone)]
pub struct RouteTableBuilder {
    rules: Vec<RoutingRule>,
    outbound_tags: HashMap<String, String>,
    sniff_enabled: bool,
    fallback_chain: Vec<String>,
    geosite: HashMap<String, Vec<String>>,
    version: u64,
}

impl Default for RouteTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTableBuilder {
    /// Create a new builder with default settings
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            outbound_tags: HashMap::new(),
            sniff_enabled: true,
            fallback_chain: default_fallback_chain(),
            geosite: HashMap::new(),
            version: 0,
        }
    }

    /// Append a rule
    #[must_use]
    pub fn rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Append several rules
    #[must_use]
    pub fn rules(mut self, rules: impl IntoIterator<Item = RoutingRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Register an outbound tag
    #[must_use]
    pub fn outbound_tag(mut self, tag: impl Into<String>, outbound_id: impl Into<String>) -> Self {
        self.outbound_tags.insert(tag.into(), outbound_id.into());
        self
    }

    /// Replace the outbound tag map
    #[must_use]
    pub fn outbound_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.outbound_tags = tags;
        self
    }

    /// Enable or disable sniffing
    #[must_use]
    pub const fn sniff_enabled(mut self, enabled: bool) -> Self {
        self.sniff_enabled = enabled;
        self
    }

    /// Set the fallback chain
    #[must_use]
    pub fn fallback_chain(mut self, chain: Vec<String>) -> Self {
        self.fallback_chain = chain;
        self
    }

    /// Add a geosite category (list of domain suffixes)
    #[must_use]
    pub fn geosite_category<I, S>(mut self, category: impl Into<String>, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let suffixes = suffixes
            .into_iter()
            .map(|s| {
                let s: String = s.into();
                super::types::normalize_domain(&s)
            })
            .filter(|s| !s.is_empty())
            .collect();
        self.geosite
            .insert(category.into().trim().to_ascii_lowercase(), suffixes);
        self
    }

    /// Set the table version
    #[must_use]
    pub const fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Validate everything and build the table
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if:
    /// - Any rule fails validation (including rules with zero matchers)
    /// - Two rules share an id
    /// - A `CustomProxy` action references an unregistered outbound id
    /// - A rule references an unknown geosite category
    /// - The fallback chain is empty or has an unresolvable entry
    pub fn build(self) -> Result<RouteTable, RuleError> {
        let mut seen_ids: HashSet<String> = HashSet::with_capacity(self.rules.len());
        let known_outbounds: HashSet<&String> = self.outbound_tags.values().collect();

        let mut rules = Vec::with_capacity(self.rules.len());
        for rule in self.rules {
            let rule = rule.into_normalized()?;

            if !seen_ids.insert(rule.id.clone()) {
                return Err(RuleError::DuplicateId(rule.id));
            }

            if let Action::CustomProxy(outbound) = &rule.action {
                if !known_outbounds.contains(outbound) {
                    return Err(RuleError::UnknownOutbound {
                        id: rule.id.clone(),
                        outbound: outbound.clone(),
                    });
                }
            }

            for matcher in &rule.matchers {
                if let Matcher::Domain { geosite, .. } = matcher {
                    if let Some(category) = geosite.iter().find(|c| !self.geosite.contains_key(*c)) {
                        return Err(RuleError::UnknownGeosite {
                            id: rule.id.clone(),
                            category: category.clone(),
                        });
                    }
                }
            }

            rules.push(rule);
        }

        if self.fallback_chain.is_empty() {
            return Err(RuleError::InvalidFallback("fallback chain is empty".into()));
        }
        if let Some(bad) = self
            .fallback_chain
            .iter()
            .find(|tag| Action::from_tag(tag, &self.outbound_tags).is_none())
        {
            return Err(RuleError::InvalidFallback(format!(
                "unknown fallback tag: {bad}"
            )));
        }

        let evaluation_order = evaluation_order(&rules);

        Ok(RouteTable {
            rules,
            outbound_tags: self.outbound_tags,
            sniff_enabled: self.sniff_enabled,
            fallback_chain: self.fallback_chain,
            geosite: Arc::new(self.geosite),
            version: self.version,
            evaluation_order,
        })
    }
}
