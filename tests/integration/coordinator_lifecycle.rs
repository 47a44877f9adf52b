//! Coordinator lifecycle integration tests
//!
//! Drives the supervised service link with a scripted connector: each
//! connect attempt pops the next scripted outcome, and linked handles stay up
//! until the test kills them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use routing_core::coordinator::{
    CoordinatorOptions, CoordinatorState, EventSender, RoutingCoordinator, ServiceConnector,
    ServiceEvent, ServiceHandle, SnapshotStatus,
};
use routing_core::error::ServiceError;
use routing_core::rules::{Action, FlowDescriptor, FlowProtocol, RouteLookupEngine, RouteTable};

use super::{client_hello, suffix_rule, wait_for_snapshot, wait_until};

// ============================================================================
// Scripted Connector
// ============================================================================

/// Test side of a scripted link
struct LinkControl {
    kill: mpsc::UnboundedSender<ServiceError>,
    events: Arc<Mutex<Option<EventSender>>>,
}

impl LinkControl {
    fn kill(&self, reason: &str) {
        let _ = self.kill.send(ServiceError::Disconnected(reason.into()));
    }

    async fn push(&self, event: ServiceEvent) {
        let sender = self.events.lock().clone().expect("link registered");
        sender.send(event).await.expect("event pump running");
    }
}

enum Attempt {
    Refuse(ServiceError),
    Link(ScriptedHandle),
    /// Connects, then never answers the registration
    Hang,
}

struct HangingHandle;

#[async_trait]
impl ServiceHandle for HangingHandle {
    async fn register(&mut self, _events: EventSender) -> Result<(), ServiceError> {
        std::future::pending().await
    }

    async fn closed(&mut self) -> ServiceError {
        std::future::pending().await
    }
}

struct ScriptedHandle {
    death: mpsc::UnboundedReceiver<ServiceError>,
    events: Arc<Mutex<Option<EventSender>>>,
}

#[async_trait]
impl ServiceHandle for ScriptedHandle {
    async fn register(&mut self, events: EventSender) -> Result<(), ServiceError> {
        *self.events.lock() = Some(events);
        Ok(())
    }

    async fn closed(&mut self) -> ServiceError {
        self.death
            .recv()
            .await
            .unwrap_or_else(|| ServiceError::Disconnected("control dropped".into()))
    }
}

#[derive(Default)]
struct ScriptedConnector {
    attempts: Mutex<VecDeque<Attempt>>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    fn refuse(&self, error: ServiceError) {
        self.attempts.lock().push_back(Attempt::Refuse(error));
    }

    fn hang(&self) {
        self.attempts.lock().push_back(Attempt::Hang);
    }

    fn link(&self) -> LinkControl {
        let (kill, death) = mpsc::unbounded_channel();
        let events = Arc::new(Mutex::new(None));
        self.attempts.lock().push_back(Attempt::Link(ScriptedHandle {
            death,
            events: Arc::clone(&events),
        }));
        LinkControl { kill, events }
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn ServiceHandle>, ServiceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.attempts.lock().pop_front() {
            Some(Attempt::Link(handle)) => Ok(Box::new(handle)),
            Some(Attempt::Hang) => Ok(Box::new(HangingHandle)),
            Some(Attempt::Refuse(error)) => Err(error),
            None => Err(ServiceError::ConnectionFailed("service not running".into())),
        }
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

fn coordinator(connector: &Arc<ScriptedConnector>) -> RoutingCoordinator {
    coordinator_with(
        connector,
        CoordinatorOptions {
            reconnect_backoff: Duration::from_millis(10),
            ..CoordinatorOptions::default()
        },
    )
}

fn coordinator_with(connector: &Arc<ScriptedConnector>, options: CoordinatorOptions) -> RoutingCoordinator {
    let table = RouteTable::builder()
        .rule(suffix_rule("ex", "example.com", Action::Proxy))
        .build()
        .unwrap();
    RoutingCoordinator::new(
        table,
        RouteLookupEngine::default(),
        Some(Arc::clone(connector) as Arc<dyn ServiceConnector>),
        options,
    )
}

fn flow() -> FlowDescriptor {
    FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("www.example.com")
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_link_comes_up() {
    let connector = Arc::new(ScriptedConnector::default());
    let _link = connector.link();
    let coordinator = coordinator(&connector);
    let mut snapshots = coordinator.subscribe();

    assert_eq!(coordinator.state(), CoordinatorState::Uninitialized);
    coordinator.initialize().await;

    let first = wait_for_snapshot(&mut snapshots, |_| true).await;
    assert_eq!(first.status, SnapshotStatus::Disconnected);

    wait_for_snapshot(&mut snapshots, |s| s.status == SnapshotStatus::Active).await;
    assert_eq!(coordinator.state(), CoordinatorState::Active);
    assert!(coordinator.is_linked());
    assert_eq!(connector.connects(), 1);

    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_initialize_twice_is_noop() {
    let connector = Arc::new(ScriptedConnector::default());
    let _link = connector.link();
    let coordinator = coordinator(&connector);

    coordinator.initialize().await;
    coordinator.initialize().await;
    wait_until(|| coordinator.is_linked()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(connector.connects(), 1);
    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_reconnects_after_service_death() {
    let connector = Arc::new(ScriptedConnector::default());
    let first = connector.link();
    let _second = connector.link();
    let coordinator = coordinator(&connector);
    let mut snapshots = coordinator.subscribe();

    coordinator.initialize().await;
    wait_for_snapshot(&mut snapshots, |s| s.status == SnapshotStatus::Active).await;

    assert_eq!(coordinator.route(&flow()).action, Action::Proxy);
    assert_eq!(coordinator.engine().cache().len(), 1);
    let table = coordinator.current_route_table();

    first.kill("service process died");

    let lost = wait_for_snapshot(&mut snapshots, |s| s.status == SnapshotStatus::Disconnected).await;
    assert!(lost.error.as_deref().unwrap_or("").contains("service process died"));

    // Lookups keep working against the last table while the link is down
    assert_eq!(coordinator.route(&flow()).action, Action::Proxy);

    let back = wait_for_snapshot(&mut snapshots, |s| s.status == SnapshotStatus::Active).await;
    assert!(back.active_routes.is_empty());
    assert!(coordinator.engine().cache().is_empty());
    assert!(Arc::ptr_eq(&table, &coordinator.current_route_table()));
    assert_eq!(connector.connects(), 2);

    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_connect_failures_retry_with_backoff() {
    let connector = Arc::new(ScriptedConnector::default());
    let coordinator = coordinator(&connector);
    let mut snapshots = coordinator.subscribe();

    coordinator.initialize().await;

    let failed = wait_for_snapshot(&mut snapshots, |s| s.error.is_some()).await;
    assert_eq!(failed.status, SnapshotStatus::Disconnected);
    assert!(failed.error.as_deref().unwrap_or("").contains("service not running"));

    wait_until(|| connector.connects() >= 3).await;
    assert!(!coordinator.is_linked());

    // Once the service shows up the link is established
    let _link = connector.link();
    wait_until(|| coordinator.is_linked()).await;
    assert_eq!(coordinator.state(), CoordinatorState::Active);

    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_rejection_waits_for_resume() {
    let connector = Arc::new(ScriptedConnector::default());
    connector.refuse(ServiceError::Rejected("client not allowed".into()));
    let _link = connector.link();
    let coordinator = coordinator(&connector);
    let mut snapshots = coordinator.subscribe();

    coordinator.initialize().await;

    let refused = wait_for_snapshot(&mut snapshots, |s| s.status == SnapshotStatus::Error).await;
    assert!(refused.error.as_deref().unwrap_or("").contains("client not allowed"));
    assert_eq!(coordinator.state(), CoordinatorState::Error);

    // Well past several backoff periods: no retry on its own
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.connects(), 1);
    assert_eq!(coordinator.state(), CoordinatorState::Error);

    coordinator.on_resume();

    wait_for_snapshot(&mut snapshots, |s| s.status == SnapshotStatus::Active).await;
    assert_eq!(connector.connects(), 2);
    assert!(coordinator.is_linked());

    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_hung_registration_times_out() {
    let connector = Arc::new(ScriptedConnector::default());
    connector.hang();
    let _link = connector.link();
    let coordinator = coordinator_with(
        &connector,
        CoordinatorOptions {
            reconnect_backoff: Duration::from_millis(10),
            link_timeout: Duration::from_millis(50),
            ..CoordinatorOptions::default()
        },
    );
    let mut snapshots = coordinator.subscribe();

    coordinator.initialize().await;

    let stalled = wait_for_snapshot(&mut snapshots, |s| s.error.is_some()).await;
    assert_eq!(stalled.status, SnapshotStatus::Disconnected);
    assert!(stalled.error.as_deref().unwrap_or("").contains("not established"));

    wait_until(|| coordinator.is_linked()).await;
    assert_eq!(connector.connects(), 2);

    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_resume_abandons_hung_registration() {
    let connector = Arc::new(ScriptedConnector::default());
    connector.hang();
    let _link = connector.link();
    let coordinator = coordinator_with(
        &connector,
        CoordinatorOptions {
            reconnect_backoff: Duration::from_millis(10),
            link_timeout: Duration::from_secs(60),
            ..CoordinatorOptions::default()
        },
    );

    coordinator.initialize().await;
    wait_until(|| connector.connects() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(coordinator.state(), CoordinatorState::Binding);

    coordinator.on_resume();

    wait_until(|| coordinator.is_linked()).await;
    assert_eq!(connector.connects(), 2);

    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_network_change_event_invalidates_cache() {
    let connector = Arc::new(ScriptedConnector::default());
    let link = connector.link();
    let coordinator = coordinator(&connector);

    coordinator.initialize().await;
    wait_until(|| coordinator.is_linked()).await;

    coordinator.route(&flow());
    assert_eq!(coordinator.engine().cache().len(), 1);

    link.push(ServiceEvent::NetworkChanged {
        network: Some("cellular".into()),
    })
    .await;

    wait_until(|| coordinator.engine().cache().is_empty()).await;
    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_config_reload_event_clears_sniff_cache() {
    let connector = Arc::new(ScriptedConnector::default());
    let link = connector.link();
    let coordinator = coordinator(&connector);

    coordinator.initialize().await;
    wait_until(|| coordinator.is_linked()).await;

    let sniffed =
        FlowDescriptor::new(443, FlowProtocol::Tls).with_sniff_bytes(client_hello("game.example.com"));
    let decision = coordinator.route(&sniffed);
    assert_eq!(decision.sniffed_host.as_deref(), Some("game.example.com"));
    assert!(coordinator.engine().sniffer().cached_len() > 0);

    link.push(ServiceEvent::ConfigReloaded).await;

    wait_until(|| {
        coordinator.engine().sniffer().cached_len() == 0 && coordinator.engine().cache().is_empty()
    })
    .await;
    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_route_changes_published() {
    let connector = Arc::new(ScriptedConnector::default());
    let _link = connector.link();
    let coordinator = coordinator(&connector);
    let mut snapshots = coordinator.subscribe();

    coordinator.initialize().await;
    wait_for_snapshot(&mut snapshots, |s| s.status == SnapshotStatus::Active).await;

    coordinator.route(&flow());
    let snapshot = wait_for_snapshot(&mut snapshots, |s| !s.active_routes.is_empty()).await;
    assert_eq!(snapshot.active_routes["www.example.com"].action, Action::Proxy);

    coordinator
        .update_rule(suffix_rule("ex", "example.com", Action::Block))
        .unwrap();
    let snapshot = wait_for_snapshot(&mut snapshots, |s| s.table_version() == 1).await;
    assert!(snapshot.active_routes.is_empty());

    coordinator.route(&flow());
    let snapshot = wait_for_snapshot(&mut snapshots, |s| !s.active_routes.is_empty()).await;
    assert_eq!(snapshot.active_routes["www.example.com"].action, Action::Block);

    coordinator.cleanup().await;
}

#[tokio::test]
async fn test_cleanup_stops_link() {
    let connector = Arc::new(ScriptedConnector::default());
    let _link = connector.link();
    let coordinator = coordinator(&connector);
    let mut snapshots = coordinator.subscribe();

    coordinator.initialize().await;
    wait_until(|| coordinator.is_linked()).await;
    coordinator.route(&flow());

    coordinator.cleanup().await;

    assert_eq!(coordinator.state(), CoordinatorState::Uninitialized);
    assert!(!coordinator.is_linked());
    assert!(coordinator.engine().cache().is_empty());

    let mut last = None;
    while let Some(snapshot) = snapshots.try_recv() {
        last = Some(snapshot);
    }
    let last = last.expect("cleanup publishes a snapshot");
    assert_eq!(last.status, SnapshotStatus::Disconnected);
    assert!(last.active_routes.is_empty());
    assert_eq!(last.table_version(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.connects(), 1);
}
