mod common;

use std::sync::Arc;
use std::time::Duration;

use ble_session::{ConnectionState, RadioEvent, SessionError, SessionManager};
use common::{MockCall, MockDriver};
use tokio::time::sleep;
use uuid::Uuid;

const SVC: Uuid = Uuid::from_u128(0x0000_18f0);
const CHR: Uuid = Uuid::from_u128(0x0000_2af1);

fn discovered_session(driver: &Arc<MockDriver>, id: &str) -> SessionManager {
    let session = SessionManager::with_defaults(driver.clone());
    session
        .registry()
        .record_discovered(id, Some("POS-58".to_string()), None, Some(-60), &[SVC]);
    session
}

#[tokio::test]
async fn connect_then_disconnect_tracks_connectivity() {
    let driver = MockDriver::new();
    let session = discovered_session(&driver, "printer-1");

    let snapshot = session.connect("printer-1").await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert!(session.is_peripheral_connected("printer-1", &[]));
    assert!(driver.calls().contains(&MockCall::Connect("printer-1".to_string())));

    session.disconnect("printer-1").await.unwrap();
    assert!(!session.is_peripheral_connected("printer-1", &[]));
    assert_eq!(
        session.registry().get("printer-1").unwrap().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn connect_unknown_peripheral_is_not_found() {
    let driver = MockDriver::new();
    let session = SessionManager::with_defaults(driver.clone());

    let err = session.connect("never-seen").await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn failed_connect_surfaces_connection_failed_and_allows_retry() {
    let driver = MockDriver::new();
    let session = discovered_session(&driver, "printer-1");

    driver.script_connects(vec![Err(SessionError::driver("gatt", "status 133"))]);
    let err = session.connect("printer-1").await.unwrap_err();
    assert!(matches!(err, SessionError::ConnectionFailed(_)));
    assert_eq!(
        session.registry().get("printer-1").unwrap().state,
        ConnectionState::Disconnected
    );

    // A later attempt from Disconnected is legal and succeeds.
    let snapshot = session.connect("printer-1").await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Connected);
}

#[tokio::test]
async fn connecting_an_already_connected_peripheral_is_a_no_op() {
    let driver = MockDriver::new();
    let session = discovered_session(&driver, "printer-1");

    session.connect("printer-1").await.unwrap();
    session.connect("printer-1").await.unwrap();
    let connects = driver
        .calls()
        .into_iter()
        .filter(|c| matches!(c, MockCall::Connect(_)))
        .count();
    assert_eq!(connects, 1);
}

#[tokio::test]
async fn disconnect_requires_a_live_connection() {
    let driver = MockDriver::new();
    let session = discovered_session(&driver, "printer-1");

    let err = session.disconnect("printer-1").await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected(_)));
}

#[tokio::test]
async fn no_connected_peripherals_is_an_empty_vec() {
    let driver = MockDriver::new();
    let session = SessionManager::with_defaults(driver.clone());
    assert!(session.connected_peripherals(&[]).is_empty());
}

#[tokio::test]
async fn connected_listing_filters_by_service_membership() {
    let driver = MockDriver::new();
    let session = discovered_session(&driver, "printer-1");
    session.connect("printer-1").await.unwrap();

    let other = Uuid::from_u128(0xdead_beef);
    assert_eq!(session.connected_peripherals(&[SVC]).len(), 1);
    assert!(session.connected_peripherals(&[other]).is_empty());
    assert!(session.is_peripheral_connected("printer-1", &[SVC]));
    assert!(!session.is_peripheral_connected("printer-1", &[other]));
}

#[tokio::test]
async fn disconnect_cancels_queued_but_undispatched_operations() {
    let driver = MockDriver::new();
    let session = Arc::new(discovered_session(&driver, "printer-1"));
    session.connect("printer-1").await.unwrap();

    // First read occupies the handle's queue for a while; the next two sit
    // behind it undispatched.
    driver.set_latency(Duration::from_millis(200));
    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.read("printer-1", SVC, CHR).await })
    };
    sleep(Duration::from_millis(50)).await;
    let second = {
        let session = session.clone();
        tokio::spawn(async move { session.read("printer-1", SVC, CHR).await })
    };
    let third = {
        let session = session.clone();
        tokio::spawn(async move { session.read("printer-1", SVC, CHR).await })
    };
    sleep(Duration::from_millis(20)).await;

    session.disconnect("printer-1").await.unwrap();

    assert!(matches!(
        second.await.unwrap(),
        Err(SessionError::Cancelled)
    ));
    assert!(matches!(third.await.unwrap(), Err(SessionError::Cancelled)));
    // The dispatched read was already with the driver and completes normally.
    assert!(first.await.unwrap().is_ok());

    let reads = driver
        .calls()
        .into_iter()
        .filter(|c| matches!(c, MockCall::Read(_)))
        .count();
    assert_eq!(reads, 1, "cancelled reads never reach the driver");
}

#[tokio::test]
async fn read_rssi_requires_connected_state() {
    let driver = MockDriver::new();
    let session = discovered_session(&driver, "printer-1");

    let err = session.read_rssi("printer-1").await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected(_)));

    session.connect("printer-1").await.unwrap();
    assert_eq!(session.read_rssi("printer-1").await.unwrap(), -60);
}

#[tokio::test]
async fn scan_requests_discovery_and_events_populate_the_registry() {
    let driver = MockDriver::new();
    let session = SessionManager::with_defaults(driver.clone());

    session.scan(&[SVC], 0, false).await.unwrap();
    assert!(
        driver
            .calls()
            .contains(&MockCall::Scan(vec![SVC], false))
    );

    driver.send_event(RadioEvent::PeripheralDiscovered {
        id: "printer-1".to_string(),
        name: Some("POS-58".to_string()),
        address: Some("AA:BB:CC:DD:EE:FF".to_string()),
        rssi: Some(-58),
        services: vec![SVC],
    });
    sleep(Duration::from_millis(50)).await;

    let discovered = session.discovered_peripherals();
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].id, "printer-1");
    assert_eq!(discovered[0].rssi, Some(-58));

    session.stop_scan().await.unwrap();
    assert!(driver.calls().contains(&MockCall::StopScan));
}

#[tokio::test]
async fn scan_with_defaults_uses_the_configured_policy() {
    let driver = MockDriver::new();
    let session = SessionManager::with_defaults(driver.clone());

    session.scan_with_defaults(&[SVC]).await.unwrap();
    // Default policy: no duplicate sightings.
    assert!(
        driver
            .calls()
            .contains(&MockCall::Scan(vec![SVC], false))
    );
}

#[tokio::test]
async fn scan_auto_stops_after_the_requested_duration() {
    let driver = MockDriver::new();
    let session = SessionManager::with_defaults(driver.clone());

    session.scan(&[], 1, false).await.unwrap();
    assert!(!driver.calls().contains(&MockCall::StopScan));

    sleep(Duration::from_millis(1200)).await;
    assert!(driver.calls().contains(&MockCall::StopScan));
}

#[tokio::test]
async fn unsolicited_link_loss_cancels_work_and_updates_state() {
    let driver = MockDriver::new();
    let session = Arc::new(discovered_session(&driver, "printer-1"));
    session.connect("printer-1").await.unwrap();

    driver.set_latency(Duration::from_millis(200));
    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.read("printer-1", SVC, CHR).await })
    };
    sleep(Duration::from_millis(50)).await;
    let second = {
        let session = session.clone();
        tokio::spawn(async move { session.read("printer-1", SVC, CHR).await })
    };
    sleep(Duration::from_millis(20)).await;

    driver.send_event(RadioEvent::ConnectionStateChanged {
        peripheral_id: "printer-1".to_string(),
        connected: false,
    });
    sleep(Duration::from_millis(50)).await;

    assert!(matches!(
        second.await.unwrap(),
        Err(SessionError::Cancelled)
    ));
    assert!(first.await.unwrap().is_ok());
    assert_eq!(
        session.registry().get("printer-1").unwrap().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn empty_identifiers_are_rejected_without_touching_the_queue() {
    let driver = MockDriver::new();
    let session = SessionManager::with_defaults(driver.clone());

    assert!(matches!(
        session.connect("").await,
        Err(SessionError::InvalidArgument(_))
    ));
    assert!(matches!(
        session.read("  ", SVC, CHR).await,
        Err(SessionError::InvalidArgument(_))
    ));
    assert!(matches!(
        session.write("", SVC, CHR, &[0x00], None).await,
        Err(SessionError::InvalidArgument(_))
    ));
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn enable_bluetooth_passes_through_and_power_events_are_tracked() {
    let driver = MockDriver::new();
    let session = SessionManager::with_defaults(driver.clone());

    session.enable_bluetooth().await.unwrap();
    assert!(driver.calls().contains(&MockCall::Enable));

    assert!(!session.is_powered_on());
    driver.send_event(RadioEvent::BluetoothStateChanged { powered_on: true });
    sleep(Duration::from_millis(50)).await;
    assert!(session.is_powered_on());
}

#[tokio::test]
async fn forget_peripheral_drops_idle_entries() {
    let driver = MockDriver::new();
    let session = discovered_session(&driver, "printer-1");

    session.forget_peripheral("printer-1").unwrap();
    assert!(session.discovered_peripherals().is_empty());
    assert!(matches!(
        session.forget_peripheral("printer-1"),
        Err(SessionError::NotFound(_))
    ));
}
