//! Routing coordinator
//!
//! Owns the live [`RouteTable`] and the [`RouteLookupEngine`], supervises the
//! link to the background service, and publishes [`RouteSnapshot`]s.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::broadcast::{SnapshotBroadcaster, SnapshotSubscription, DEFAULT_BUFFER, DEFAULT_REPLAY};
use super::service::{EventSender, ServiceConnector, ServiceEvent};
use super::state::{CoordinatorState, RouteSnapshot};
use crate::error::{RuleError, ServiceError};
use crate::rules::{normalize_domain, FlowDescriptor, RouteDecision, RouteLookupEngine, RouteTable, RoutingRule};

/// Default wait between reconnect attempts
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Default number of hosts tracked in `active_routes`
pub const DEFAULT_MAX_ACTIVE_ROUTES: usize = 256;

/// Default capacity of the service event channel
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Default bound on one connect-and-register attempt
pub const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordinator tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Wait between reconnect attempts
    pub reconnect_backoff: Duration,
    /// Snapshots replayed to new subscribers
    pub replay: usize,
    /// Live snapshot buffer per subscriber
    pub buffer: usize,
    /// Hosts tracked in `active_routes`
    pub max_active_routes: usize,
    /// Service event channel capacity
    pub event_buffer: usize,
    /// Longest one connect-and-register attempt may take
    pub link_timeout: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            replay: DEFAULT_REPLAY,
            buffer: DEFAULT_BUFFER,
            max_active_routes: DEFAULT_MAX_ACTIVE_ROUTES,
            event_buffer: DEFAULT_EVENT_BUFFER,
            link_timeout: DEFAULT_LINK_TIMEOUT,
        }
    }
}

/// Last decision per host, bounded, oldest host evicted first
#[derive(Debug, Default)]
struct ActiveRoutes {
    routes: HashMap<String, RouteDecision>,
    order: VecDeque<String>,
}

impl ActiveRoutes {
    /// Record a decision; returns true if the host's route changed
    fn record(&mut self, host: String, decision: &RouteDecision, max: usize) -> bool {
        if max == 0 {
            return false;
        }
        if let Some(existing) = self.routes.get_mut(&host) {
            let changed = existing.action != decision.action
                || existing.matched_rule_id != decision.matched_rule_id
                || existing.outbound_tag != decision.outbound_tag;
            if changed {
                *existing = decision.clone();
            }
            return changed;
        }
        while self.routes.len() >= max {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.routes.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(host.clone());
        self.routes.insert(host, decision.clone());
        true
    }

    fn clear(&mut self) {
        self.routes.clear();
        self.order.clear();
    }
}

/// State shared with the background tasks
struct Shared {
    table: ArcSwap<RouteTable>,
    engine: RouteLookupEngine,
    broadcaster: SnapshotBroadcaster,
    state: RwLock<CoordinatorState>,
    active_routes: Mutex<ActiveRoutes>,
    connector: Option<Arc<dyn ServiceConnector>>,
    options: CoordinatorOptions,
    linked: AtomicBool,
    /// Cuts a reconnect wait short
    wake: Notify,
    /// Held while a snapshot is assembled and sent, so snapshots go out in
    /// the order their state was read
    publishing: Mutex<()>,
}

impl Shared {
    fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    fn set_state(&self, next: CoordinatorState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev != next {
            info!(from = %prev, to = %next, "coordinator state changed");
        }
    }

    fn publish(&self, error: Option<String>) {
        let _publishing = self.publishing.lock();
        let snapshot = RouteSnapshot {
            timestamp: Utc::now(),
            route_table: self.table.load_full(),
            active_routes: Arc::new(self.active_routes.lock().routes.clone()),
            status: self.state().snapshot_status(),
            error,
        };
        debug!(
            version = snapshot.table_version(),
            status = ?snapshot.status,
            routes = snapshot.active_routes.len(),
            "publishing route snapshot"
        );
        self.broadcaster.publish(snapshot);
    }

    /// Drop cached decisions and the routes derived from them
    fn invalidate_decisions(&self) {
        self.engine.cache().invalidate_all();
        self.active_routes.lock().clear();
    }

    fn on_resume(&self) {
        info!("resumed");
        self.invalidate_decisions();
        self.publish(None);
        if self.connector.is_some() && !self.linked.load(Ordering::Acquire) {
            debug!(state = %self.state(), "service link down on resume, reconnecting now");
            self.wake.notify_one();
        }
    }

    fn on_network_change(&self) {
        info!("network changed");
        self.invalidate_decisions();
        self.publish(None);
    }

    fn on_config_reload(&self) {
        info!("configuration reloaded");
        self.invalidate_decisions();
        self.engine.sniffer().clear_cache();
        self.engine.geoip().reload();
        self.publish(None);
    }

    fn on_binder_reconnected(&self) {
        info!(version = self.table.load().version(), "background service reconnected");
        self.invalidate_decisions();
        self.publish(None);
    }

    fn handle_event(&self, event: ServiceEvent) {
        debug!(?event, "service event received");
        match event {
            ServiceEvent::NetworkChanged { .. } => self.on_network_change(),
            ServiceEvent::ConfigReloaded => self.on_config_reload(),
        }
    }
}

/// Handles of the running background tasks
struct Tasks {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

/// Coordinates route table edits, lookups, lifecycle events and the link to
/// the background service
///
/// Lookups and table reads never block: the table is one atomic load, and
/// edits are compare-and-swap loops that retry when another writer won.
///
/// # Example
///
/// ```
/// use routing_core::coordinator::{CoordinatorState, RoutingCoordinator};
/// use routing_core::rules::{Action, FlowDescriptor, FlowProtocol, Matcher, RouteTable, RoutingRule};
///
/// # tokio_test_block_on(async {
/// let coordinator = RoutingCoordinator::standalone(RouteTable::empty());
/// coordinator.initialize().await;
/// assert_eq!(coordinator.state(), CoordinatorState::Active);
///
/// coordinator
///     .add_rule(RoutingRule::new("ex", vec![Matcher::domain_suffix(["example.com"])], Action::Proxy))
///     .unwrap();
///
/// let flow = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("www.example.com");
/// assert_eq!(coordinator.route(&flow).action, Action::Proxy);
///
/// coordinator.cleanup().await;
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
pub struct RoutingCoordinator {
    shared: Arc<Shared>,
    tasks: Mutex<Option<Tasks>>,
}

impl fmt::Debug for RoutingCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingCoordinator")
            .field("state", &self.shared.state())
            .field("version", &self.shared.table.load().version())
            .field("linked", &self.shared.linked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RoutingCoordinator {
    /// Create a coordinator
    ///
    /// Without a connector the coordinator runs standalone and goes straight
    /// to `Active` on `initialize()`.
    #[must_use]
    pub fn new(
        table: RouteTable,
        engine: RouteLookupEngine,
        connector: Option<Arc<dyn ServiceConnector>>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: ArcSwap::from_pointee(table),
                engine,
                broadcaster: SnapshotBroadcaster::new(options.replay, options.buffer),
                state: RwLock::new(CoordinatorState::Uninitialized),
                active_routes: Mutex::new(ActiveRoutes::default()),
                connector,
                options,
                linked: AtomicBool::new(false),
                wake: Notify::new(),
                publishing: Mutex::new(()),
            }),
            tasks: Mutex::new(None),
        }
    }

    /// Standalone coordinator with a default engine and no service link
    #[must_use]
    pub fn standalone(table: RouteTable) -> Self {
        Self::new(table, RouteLookupEngine::default(), None, CoordinatorOptions::default())
    }

    /// Start the coordinator
    ///
    /// Publishes the first snapshot and, when a connector is configured,
    /// starts the supervised service link. Calling it again while running is
    /// a no-op.
    pub async fn initialize(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            debug!("coordinator already initialized");
            return;
        }

        let Some(connector) = self.shared.connector.clone() else {
            self.shared.set_state(CoordinatorState::Active);
            self.shared.publish(None);
            *tasks = Some(Tasks {
                shutdown_tx: broadcast::channel(1).0,
                handles: Vec::new(),
            });
            return;
        };

        info!(service = %connector.describe(), "initializing routing coordinator");
        self.shared.set_state(CoordinatorState::Binding);
        self.shared.publish(None);

        let (shutdown_tx, _) = broadcast::channel(1);
        let (events_tx, events_rx) = mpsc::channel(self.shared.options.event_buffer.max(1));

        let supervisor = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            connector,
            events_tx,
            shutdown_tx.subscribe(),
        ));
        let pump = tokio::spawn(pump_events(
            Arc::clone(&self.shared),
            events_rx,
            shutdown_tx.subscribe(),
        ));

        *tasks = Some(Tasks {
            shutdown_tx,
            handles: vec![supervisor, pump],
        });
    }

    /// Stop background tasks and drop cached state
    pub async fn cleanup(&self) {
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            let _ = tasks.shutdown_tx.send(());
            for handle in tasks.handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "coordinator task ended abnormally");
                }
            }
        }
        self.shared.linked.store(false, Ordering::Release);
        self.shared.engine.invalidate_cache();
        self.shared.active_routes.lock().clear();
        self.shared.set_state(CoordinatorState::Uninitialized);
        self.shared.publish(None);
        info!("routing coordinator stopped");
    }

    /// Decide the route for a flow against the current table
    ///
    /// A decision that changes the route of its host is recorded in
    /// `active_routes` and published.
    pub fn route(&self, flow: &FlowDescriptor) -> RouteDecision {
        let table = self.shared.table.load_full();
        let decision = self.shared.engine.lookup(flow, &table);

        let host = decision
            .sniffed_host
            .clone()
            .or_else(|| flow.host.as_deref().map(normalize_domain))
            .filter(|h| !h.is_empty());
        if let Some(host) = host {
            let changed = self.shared.active_routes.lock().record(
                host,
                &decision,
                self.shared.options.max_active_routes,
            );
            if changed {
                self.shared.publish(None);
            }
        }
        decision
    }

    /// Current route table (one atomic load)
    #[must_use]
    pub fn current_route_table(&self) -> Arc<RouteTable> {
        self.shared.table.load_full()
    }

    /// Subscribe to snapshots: recent history first, then live updates
    #[must_use]
    pub fn subscribe(&self) -> SnapshotSubscription {
        self.shared.broadcaster.subscribe()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        self.shared.state()
    }

    /// Whether the service link is up
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.shared.linked.load(Ordering::Acquire)
    }

    /// Lookup engine
    #[must_use]
    pub fn engine(&self) -> &RouteLookupEngine {
        &self.shared.engine
    }

    /// Replace the whole rule list
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if the new rule list is invalid; the table is left
    /// unchanged.
    pub fn apply_rules(&self, rules: Vec<RoutingRule>) -> Result<Arc<RouteTable>, RuleError> {
        self.update_table("apply_rules", |t| t.with_rules(rules.clone()))
    }

    /// Append a rule
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if the rule is invalid or its id is taken.
    pub fn add_rule(&self, rule: RoutingRule) -> Result<Arc<RouteTable>, RuleError> {
        self.update_table("add_rule", |t| t.with_rule_added(rule.clone()))
    }

    /// Replace the rule with the same id
    ///
    /// # Errors
    ///
    /// Returns `RuleError::NotFound` if no such rule exists, or a validation
    /// error.
    pub fn update_rule(&self, rule: RoutingRule) -> Result<Arc<RouteTable>, RuleError> {
        self.update_table("update_rule", |t| t.with_rule_updated(rule.clone()))
    }

    /// Remove a rule by id
    ///
    /// # Errors
    ///
    /// Returns `RuleError::NotFound` if no such rule exists.
    pub fn remove_rule(&self, id: &str) -> Result<Arc<RouteTable>, RuleError> {
        self.update_table("remove_rule", |t| t.with_rule_removed(id))
    }

    /// Remove every rule
    pub fn clear_rules(&self) -> Arc<RouteTable> {
        // cleared() cannot fail
        match self.update_table("clear_rules", |t| Ok(t.cleared())) {
            Ok(table) => table,
            Err(_) => self.current_route_table(),
        }
    }

    /// Switch sniffing on or off
    pub fn set_sniff_enabled(&self, enabled: bool) -> Arc<RouteTable> {
        match self.update_table("set_sniff_enabled", |t| Ok(t.with_sniff_enabled(enabled))) {
            Ok(table) => table,
            Err(_) => self.current_route_table(),
        }
    }

    /// Replace the fallback chain
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidFallback` if the chain is empty or has an
    /// unresolvable entry.
    pub fn set_fallback_chain(&self, chain: Vec<String>) -> Result<Arc<RouteTable>, RuleError> {
        self.update_table("set_fallback_chain", |t| t.with_fallback_chain(chain.clone()))
    }

    /// Replace the outbound tag map
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if a rule or the fallback chain references a tag
    /// the new map drops.
    pub fn set_outbound_tags(&self, tags: HashMap<String, String>) -> Result<Arc<RouteTable>, RuleError> {
        self.update_table("set_outbound_tags", |t| t.with_outbound_tags(tags.clone()))
    }

    /// Swap in a whole new table
    ///
    /// The table is revalidated and stamped with the next version so cached
    /// decisions from the old table are never served.
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if the incoming table is invalid; the current
    /// table is left unchanged.
    pub fn replace_table(&self, table: RouteTable) -> Result<Arc<RouteTable>, RuleError> {
        self.update_table("replace_table", |t| table.rebuilt_as(t.version() + 1))
    }

    /// Device resumed from the background
    pub fn on_resume(&self) {
        self.shared.on_resume();
    }

    /// Device switched networks
    pub fn on_network_change(&self) {
        self.shared.on_network_change();
    }

    /// Configuration was reloaded
    pub fn on_config_reload(&self) {
        self.shared.on_config_reload();
    }

    /// The background service link came back
    pub fn on_binder_reconnected(&self) {
        self.shared.on_binder_reconnected();
    }

    /// Compare-and-swap loop around a table edit
    fn update_table<F>(&self, op: &'static str, edit: F) -> Result<Arc<RouteTable>, RuleError>
    where
        F: Fn(&RouteTable) -> Result<RouteTable, RuleError>,
    {
        loop {
            let current = self.shared.table.load_full();
            let next = Arc::new(edit(&current)?);
            let prev = self.shared.table.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&*prev, &current) {
                info!(op, version = next.version(), rules = next.len(), "route table updated");
                self.shared.invalidate_decisions();
                self.shared.publish(None);
                return Ok(next);
            }
            debug!(op, "route table changed concurrently, retrying");
        }
    }
}

impl Drop for RoutingCoordinator {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().take() {
            let _ = tasks.shutdown_tx.send(());
            for handle in tasks.handles {
                handle.abort();
            }
        }
    }
}

/// Keep the service link up until shutdown
async fn supervise(
    shared: Arc<Shared>,
    connector: Arc<dyn ServiceConnector>,
    events: EventSender,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut linked_before = false;

    loop {
        shared.set_state(CoordinatorState::Binding);

        let link_timeout = shared.options.link_timeout;
        let attempt = tokio::select! {
            result = tokio::time::timeout(link_timeout, connect_and_register(connector.as_ref(), events.clone())) => {
                result.unwrap_or_else(|_| {
                    Err(ServiceError::ConnectionFailed(format!("link not established within {link_timeout:?}")))
                })
            }
            // Resume abandons a hung attempt and starts over
            () = shared.wake.notified() => continue,
            _ = shutdown_rx.recv() => break,
        };

        match attempt {
            Ok(mut handle) => {
                shared.linked.store(true, Ordering::Release);
                shared.set_state(CoordinatorState::Active);
                if linked_before {
                    shared.on_binder_reconnected();
                } else {
                    info!(service = %connector.describe(), "linked to background service");
                    shared.publish(None);
                }
                linked_before = true;

                let reason = tokio::select! {
                    reason = handle.closed() => reason,
                    _ = shutdown_rx.recv() => {
                        shared.linked.store(false, Ordering::Release);
                        break;
                    }
                };

                shared.linked.store(false, Ordering::Release);
                warn!(error = %reason, "background service link lost");
                shared.set_state(CoordinatorState::Disconnected);
                shared.publish(Some(reason.to_string()));
            }
            Err(e) if !e.is_recoverable() => {
                warn!(error = %e, "background service refused the link");
                shared.set_state(CoordinatorState::Error);
                shared.publish(Some(e.to_string()));

                // Only an explicit resume retries
                tokio::select! {
                    () = shared.wake.notified() => continue,
                    _ = shutdown_rx.recv() => break,
                }
            }
            Err(e) => {
                debug!(error = %e, "background service connect failed");
                shared.set_state(CoordinatorState::Disconnected);
                shared.publish(Some(e.to_string()));
            }
        }

        tokio::select! {
            () = tokio::time::sleep(shared.options.reconnect_backoff) => {}
            () = shared.wake.notified() => {}
            _ = shutdown_rx.recv() => break,
        }
    }

    debug!("service supervisor stopped");
}

async fn connect_and_register(
    connector: &dyn ServiceConnector,
    events: EventSender,
) -> Result<Box<dyn super::service::ServiceHandle>, ServiceError> {
    let mut handle = connector.connect().await?;
    handle.register(events).await?;
    Ok(handle)
}

/// Translate service events into lifecycle signals
async fn pump_events(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<ServiceEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => shared.handle_event(event),
                None => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("service event pump stopped");
}
