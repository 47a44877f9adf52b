//! Routing rules and the lookup engine
//!
//! This module provides:
//! - Rule, matcher and decision types
//! - The immutable, versioned [`RouteTable`]
//! - Matcher evaluation
//! - The [`RouteLookupEngine`] that turns a flow into a [`RouteDecision`]
//!
//! # Architecture
//!
//! Rules are evaluated by priority, highest first, with ties kept in
//! declaration order. The first rule whose matchers all match decides the
//! flow. Rules that need a destination country are only tried after every
//! other rule missed, so `GeoIP` is queried at most once per lookup and only
//! when it can change the outcome.
//!
//! # Example
//!
//! ```
//! use routing_core::rules::{Action, Matcher, RouteTable, RoutingRule};
//!
//! let table = RouteTable::builder()
//!     .rule(
//!         RoutingRule::new("ads", vec![Matcher::domain_suffix(["ads.example"])], Action::Block)
//!             .with_priority(100),
//!     )
//!     .build()
//!     .unwrap();
//!
//! // Edits return a new table with the next version
//! let next = table.with_rule_removed("ads").unwrap();
//! assert_eq!(next.version(), table.version() + 1);
//! assert!(next.is_empty());
//! ```

pub mod engine;
pub mod matcher;
pub mod table;
pub mod types;

// Re-exports
pub use engine::{EngineStats, EngineStatsSnapshot, FlowDescriptor, RouteLookupEngine};
pub use matcher::{domain_has_suffix, match_rule, FlowContext};
pub use table::{default_fallback_chain, RouteTable, RouteTableBuilder};
pub use types::*;
