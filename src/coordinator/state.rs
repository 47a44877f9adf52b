//! Coordinator state and published snapshots

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::rules::{RouteDecision, RouteTable};

/// Lifecycle state of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// `initialize()` not called yet (or `cleanup()` done)
    Uninitialized,
    /// Connecting to the background service
    Binding,
    /// Linked to the background service
    Active,
    /// Link lost, reconnect pending
    Disconnected,
    /// Connection refused for good; only a resume retries
    Error,
}

impl CoordinatorState {
    /// Status reported in snapshots for this state
    #[must_use]
    pub const fn snapshot_status(&self) -> SnapshotStatus {
        match self {
            Self::Active => SnapshotStatus::Active,
            Self::Error => SnapshotStatus::Error,
            Self::Uninitialized | Self::Binding | Self::Disconnected => SnapshotStatus::Disconnected,
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Binding => "binding",
            Self::Active => "active",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Service link status carried by a [`RouteSnapshot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Active,
    Disconnected,
    Error,
}

/// Point-in-time view of the routing state
///
/// Built fresh for every publication and never modified afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct RouteSnapshot {
    /// When the snapshot was built
    pub timestamp: DateTime<Utc>,
    /// Route table in effect
    pub route_table: Arc<RouteTable>,
    /// Last decision applied per host
    pub active_routes: Arc<HashMap<String, RouteDecision>>,
    /// Service link status
    pub status: SnapshotStatus,
    /// Error message when `status` is `Error` or the link just dropped
    pub error: Option<String>,
}

impl RouteSnapshot {
    /// Version of the table in this snapshot
    #[must_use]
    pub fn table_version(&self) -> u64 {
        self.route_table.version()
    }
}
