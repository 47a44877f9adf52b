//! Unix socket service link integration tests
//!
//! A local `UnixListener` plays the background service, speaking the
//! length-prefixed JSON frames the connector expects.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use routing_core::coordinator::unix::{read_frame, write_frame, ClientFrame, ServiceFrame};
use routing_core::coordinator::{
    CoordinatorOptions, CoordinatorState, RoutingCoordinator, ServiceConnector, ServiceEvent,
    ServiceHandle, SnapshotStatus, UnixServiceConnector,
};
use routing_core::error::ServiceError;
use routing_core::rules::{Action, FlowDescriptor, FlowProtocol, RouteLookupEngine, RouteTable};

use super::{suffix_rule, wait_for_snapshot, wait_until, WAIT};

// ============================================================================
// Test Service
// ============================================================================

/// Accept one client and complete its registration
async fn accept_registered(listener: &UnixListener) -> UnixStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let frame: ClientFrame = read_frame(&mut stream).await.unwrap();
    let ClientFrame::Register { client, .. } = frame;
    assert_eq!(client, "routing-core");
    write_frame(&mut stream, &ServiceFrame::Registered).await.unwrap();
    stream
}

fn bind(dir: &Path) -> (UnixListener, UnixServiceConnector) {
    let path = dir.join("service.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let connector = UnixServiceConnector::new(&path).with_connect_timeout(Duration::from_secs(1));
    (listener, connector)
}

// ============================================================================
// Connector
// ============================================================================

#[tokio::test]
async fn test_register_and_receive_events() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, connector) = bind(dir.path());

    let server = tokio::spawn(async move {
        let mut stream = accept_registered(&listener).await;
        let event = ServiceFrame::Event {
            event: ServiceEvent::NetworkChanged {
                network: Some("wifi".into()),
            },
        };
        write_frame(&mut stream, &event).await.unwrap();
        write_frame(&mut stream, &ServiceFrame::Event {
            event: ServiceEvent::ConfigReloaded,
        })
        .await
        .unwrap();
        // Dropping the stream ends the link
    });

    let (tx, mut rx) = mpsc::channel(8);
    let mut handle = connector.connect().await.unwrap();
    handle.register(tx).await.unwrap();

    let reason = tokio::time::timeout(WAIT, handle.closed()).await.unwrap();
    assert!(matches!(reason, ServiceError::Disconnected(_)));
    assert!(reason.is_recoverable());

    assert_eq!(
        rx.recv().await,
        Some(ServiceEvent::NetworkChanged {
            network: Some("wifi".into())
        })
    );
    assert_eq!(rx.recv().await, Some(ServiceEvent::ConfigReloaded));

    server.await.unwrap();
}

#[tokio::test]
async fn test_rejected_registration() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, connector) = bind(dir.path());

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _: ClientFrame = read_frame(&mut stream).await.unwrap();
        write_frame(
            &mut stream,
            &ServiceFrame::Rejected {
                reason: "unsupported client version".into(),
            },
        )
        .await
        .unwrap();
    });

    let (tx, _rx) = mpsc::channel(8);
    let mut handle = connector.connect().await.unwrap();
    let err = handle.register(tx).await.unwrap_err();

    assert!(matches!(err, ServiceError::Rejected(ref reason) if reason.contains("unsupported")));
    assert!(!err.is_recoverable());

    server.await.unwrap();
}

#[tokio::test]
async fn test_event_before_registration_is_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, connector) = bind(dir.path());

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _: ClientFrame = read_frame(&mut stream).await.unwrap();
        write_frame(
            &mut stream,
            &ServiceFrame::Event {
                event: ServiceEvent::ConfigReloaded,
            },
        )
        .await
        .unwrap();
    });

    let (tx, _rx) = mpsc::channel(8);
    let mut handle = connector.connect().await.unwrap();
    let err = handle.register(tx).await.unwrap_err();
    assert!(matches!(err, ServiceError::ProtocolError(_)));

    server.await.unwrap();
}

#[tokio::test]
async fn test_silent_service_times_out_registration() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("service.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let connector = UnixServiceConnector::new(&path).with_connect_timeout(Duration::from_millis(100));

    // Accepts and reads the registration, never answers
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _: ClientFrame = read_frame(&mut stream).await.unwrap();
        let _ = release_rx.await;
    });

    let (tx, _rx) = mpsc::channel(8);
    let mut handle = connector.connect().await.unwrap();
    let err = tokio::time::timeout(WAIT, handle.register(tx))
        .await
        .expect("registration is bounded")
        .unwrap_err();
    assert!(matches!(err, ServiceError::ConnectionFailed(_)));
    assert!(err.is_recoverable());

    let _ = release_tx.send(());
    server.await.unwrap();
}

#[tokio::test]
async fn test_coordinator_retries_after_silent_service() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("service.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let connector = UnixServiceConnector::new(&path).with_connect_timeout(Duration::from_millis(100));

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        // First client is left hanging, the retry gets registered
        let (silent, _) = listener.accept().await.unwrap();
        let _second = accept_registered(&listener).await;
        let _ = stop_rx.await;
        drop(silent);
    });

    let coordinator = RoutingCoordinator::new(
        RouteTable::empty(),
        RouteLookupEngine::default(),
        Some(Arc::new(connector) as Arc<dyn ServiceConnector>),
        CoordinatorOptions {
            reconnect_backoff: Duration::from_millis(20),
            ..CoordinatorOptions::default()
        },
    );
    let mut snapshots = coordinator.subscribe();
    coordinator.initialize().await;

    let stalled = wait_for_snapshot(&mut snapshots, |s| s.error.is_some()).await;
    assert_eq!(stalled.status, SnapshotStatus::Disconnected);
    assert!(stalled.error.as_deref().unwrap_or("").contains("registration reply"));

    wait_until(|| coordinator.is_linked()).await;
    assert_eq!(coordinator.state(), CoordinatorState::Active);

    coordinator.cleanup().await;
    let _ = stop_tx.send(());
    server.await.unwrap();
}

#[tokio::test]
async fn test_no_listener_is_recoverable() {
    let dir = tempfile::tempdir().unwrap();
    let connector = UnixServiceConnector::new(dir.path().join("absent.sock"));

    let Err(err) = connector.connect().await else {
        panic!("connected without a listener");
    };
    assert!(matches!(err, ServiceError::ConnectionFailed(_)));
    assert!(err.is_recoverable());
    assert!(connector.describe().starts_with("unix:"));
}

// ============================================================================
// Coordinator over the Unix link
// ============================================================================

#[tokio::test]
async fn test_coordinator_survives_service_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, connector) = bind(dir.path());

    let (drop_first_tx, drop_first_rx) = oneshot::channel::<()>();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let first = accept_registered(&listener).await;
        let _ = drop_first_rx.await;
        drop(first);

        let mut second = accept_registered(&listener).await;
        write_frame(
            &mut second,
            &ServiceFrame::Event {
                event: ServiceEvent::NetworkChanged { network: None },
            },
        )
        .await
        .unwrap();
        let _ = stop_rx.await;
    });

    let table = RouteTable::builder()
        .rule(suffix_rule("ex", "example.com", Action::Proxy))
        .build()
        .unwrap();
    let coordinator = RoutingCoordinator::new(
        table,
        RouteLookupEngine::default(),
        Some(Arc::new(connector) as Arc<dyn ServiceConnector>),
        CoordinatorOptions {
            reconnect_backoff: Duration::from_millis(20),
            ..CoordinatorOptions::default()
        },
    );
    let mut snapshots = coordinator.subscribe();

    coordinator.initialize().await;
    wait_for_snapshot(&mut snapshots, |s| s.status == SnapshotStatus::Active).await;

    let flow = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("www.example.com");
    assert_eq!(coordinator.route(&flow).action, Action::Proxy);
    assert_eq!(coordinator.engine().cache().len(), 1);

    drop_first_tx.send(()).unwrap();

    let lost = wait_for_snapshot(&mut snapshots, |s| s.status == SnapshotStatus::Disconnected).await;
    assert!(lost.error.is_some());

    wait_for_snapshot(&mut snapshots, |s| s.status == SnapshotStatus::Active).await;
    wait_until(|| coordinator.state() == CoordinatorState::Active && coordinator.is_linked()).await;
    assert!(coordinator.engine().cache().is_empty());

    coordinator.cleanup().await;
    let _ = stop_tx.send(());
    server.await.unwrap();
}
