//! Session manager: the public face of the crate.
//!
//! Composes the peripheral registry, the per-target operation queue and the
//! notification router on top of an injected radio driver, and turns each
//! request into a pending operation with exactly one resolution.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::core::session::notification::{NotificationReceiver, NotificationRouter};
use crate::core::session::queue::OperationQueue;
use crate::core::session::registry::PeripheralRegistry;
use crate::core::session::scanner::ScanController;
use crate::core::session::types::{
    CharacteristicHandle, ConnectionState, OperationKind, OperationOutcome, PendingOperation,
    Peripheral, RadioEvent, TargetKey,
};
use crate::driver::RadioDriver;
use crate::error::{Result, SessionError};

/// Owns scan/connect/read/write/notify sequencing for every peripheral the
/// radio driver can reach.
///
/// Must be created inside a Tokio runtime; the driver event pump and the
/// per-target queue drain tasks are spawned on it.
pub struct SessionManager {
    driver: Arc<dyn RadioDriver>,
    config: SessionConfig,
    registry: Arc<PeripheralRegistry>,
    queue: OperationQueue,
    router: Arc<NotificationRouter>,
    scanner: ScanController,
    powered_on: Arc<AtomicBool>,
    pump_cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(driver: Arc<dyn RadioDriver>, config: SessionConfig) -> Self {
        let registry = Arc::new(PeripheralRegistry::new());
        let queue = OperationQueue::new(driver.clone(), config.clone());
        let router = Arc::new(NotificationRouter::new());
        let scanner = ScanController::new(driver.clone());
        let powered_on = Arc::new(AtomicBool::new(false));
        let pump_cancel = CancellationToken::new();

        tokio::spawn(event_pump(
            driver.subscribe_events(),
            registry.clone(),
            router.clone(),
            queue.clone(),
            powered_on.clone(),
            pump_cancel.clone(),
        ));

        SessionManager {
            driver,
            config,
            registry,
            queue,
            router,
            scanner,
            powered_on,
            pump_cancel,
        }
    }

    pub fn with_defaults(driver: Arc<dyn RadioDriver>) -> Self {
        Self::new(driver, SessionConfig::default())
    }

    /// The registry component, for direct inspection of tracked peripherals.
    pub fn registry(&self) -> &PeripheralRegistry {
        &self.registry
    }

    /// Last adapter power state reported by the driver.
    pub fn is_powered_on(&self) -> bool {
        self.powered_on.load(Ordering::Relaxed)
    }

    /// Starts discovery. Resolves once scanning has been requested; it does
    /// not block for the duration. Discovery auto-stops after
    /// `duration_secs` (zero = until `stop_scan`).
    pub async fn scan(
        &self,
        service_uuids: &[Uuid],
        duration_secs: u64,
        allow_duplicates: bool,
    ) -> Result<()> {
        self.scanner
            .start(
                service_uuids,
                Duration::from_secs(duration_secs),
                allow_duplicates,
            )
            .await
    }

    /// [`Self::scan`] with the configured duration and duplicate policy.
    pub async fn scan_with_defaults(&self, service_uuids: &[Uuid]) -> Result<()> {
        self.scan(
            service_uuids,
            self.config.scan_duration_secs,
            self.config.allow_duplicates,
        )
        .await
    }

    /// Cancels an in-flight scan.
    pub async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop().await
    }

    /// Pass-through to the driver's adapter power-on request.
    pub async fn enable_bluetooth(&self) -> Result<()> {
        self.driver.enable().await
    }

    /// Connects to a previously seen peripheral and returns its snapshot.
    /// Connecting to an already connected peripheral is a no-op.
    pub async fn connect(&self, peripheral_id: &str) -> Result<Peripheral> {
        validate_id(peripheral_id)?;
        let peripheral = self.registry.get(peripheral_id)?;
        if peripheral.state == ConnectionState::Connected {
            info!("{} already connected", peripheral_id);
            return Ok(peripheral);
        }

        // Rejects a second connect while one is in flight: the state machine
        // only admits Connecting from Discovered or Disconnected.
        self.registry
            .set_state(peripheral_id, ConnectionState::Connecting)?;

        let rx = self.submit(
            OperationKind::Connect,
            TargetKey::Peripheral(peripheral_id.to_string()),
        );
        match await_outcome(rx).await {
            Ok(_) => {
                self.registry
                    .set_state(peripheral_id, ConnectionState::Connected)?;
                info!("connected to {}", peripheral_id);
                self.registry.get(peripheral_id)
            }
            Err(err) => {
                if let Err(e) = self
                    .registry
                    .set_state(peripheral_id, ConnectionState::Disconnected)
                {
                    warn!("could not roll back state for {}: {}", peripheral_id, e);
                }
                match err {
                    SessionError::Cancelled => Err(SessionError::Cancelled),
                    other => Err(SessionError::ConnectionFailed(other.to_string())),
                }
            }
        }
    }

    /// Disconnects a connected peripheral. Every queued-but-undispatched
    /// operation for it resolves with `Cancelled` first; an operation the
    /// driver already holds runs to completion on its own.
    pub async fn disconnect(&self, peripheral_id: &str) -> Result<()> {
        validate_id(peripheral_id)?;
        let peripheral = self.registry.get(peripheral_id)?;
        if peripheral.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected(peripheral_id.to_string()));
        }

        self.registry
            .set_state(peripheral_id, ConnectionState::Disconnecting)?;
        self.queue.cancel_peripheral(peripheral_id);
        self.router.unsubscribe_peripheral(peripheral_id);

        let rx = self.submit(
            OperationKind::Disconnect,
            TargetKey::Peripheral(peripheral_id.to_string()),
        );
        let result = await_outcome(rx).await;

        // The link is gone from the session's point of view either way.
        if let Err(e) = self
            .registry
            .set_state(peripheral_id, ConnectionState::Disconnected)
        {
            warn!("could not finalize disconnect for {}: {}", peripheral_id, e);
        }
        result.map(|_| ())
    }

    /// Reads a characteristic and resolves with its byte payload.
    pub async fn read(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        validate_id(peripheral_id)?;
        let handle = CharacteristicHandle::new(peripheral_id, service, characteristic);
        let rx = self.submit(OperationKind::Read, TargetKey::Characteristic(handle));
        match await_outcome(rx).await? {
            OperationOutcome::Bytes(data) => Ok(data),
            other => Err(SessionError::InvalidArgument(format!(
                "read resolved with unexpected outcome {:?}",
                other
            ))),
        }
    }

    /// Writes with response. Payloads longer than the chunk size are split
    /// into ordered chunks and the operation only resolves once every chunk
    /// succeeded.
    pub async fn write(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        max_chunk_size: Option<usize>,
    ) -> Result<()> {
        self.write_inner(
            OperationKind::Write,
            peripheral_id,
            service,
            characteristic,
            data,
            max_chunk_size,
            Duration::ZERO,
        )
        .await
    }

    /// Writes without response, pausing `queue_sleep_time_ms` between chunks
    /// so a printer without flow control can keep up.
    pub async fn write_without_response(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        max_chunk_size: Option<usize>,
        queue_sleep_time_ms: Option<u64>,
    ) -> Result<()> {
        let sleep_ms = queue_sleep_time_ms.unwrap_or(self.config.queue_sleep_time_ms);
        self.write_inner(
            OperationKind::WriteWithoutResponse,
            peripheral_id,
            service,
            characteristic,
            data,
            max_chunk_size,
            Duration::from_millis(sleep_ms),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_inner(
        &self,
        kind: OperationKind,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        max_chunk_size: Option<usize>,
        queue_sleep_time: Duration,
    ) -> Result<()> {
        validate_id(peripheral_id)?;
        if data.is_empty() {
            return Err(SessionError::InvalidArgument(
                "write payload must not be empty".to_string(),
            ));
        }
        let handle = CharacteristicHandle::new(peripheral_id, service, characteristic);
        let (mut op, rx) = PendingOperation::new(kind, TargetKey::Characteristic(handle));
        op.payload = data.to_vec();
        op.max_chunk_size = max_chunk_size.unwrap_or(self.config.max_chunk_size);
        op.queue_sleep_time = queue_sleep_time;
        op.retries_remaining = self.config.max_retries;
        self.queue.enqueue(op);
        await_outcome(rx).await.map(|_| ())
    }

    /// Subscribes to notifications from a characteristic. The receiver holds
    /// at most one pending value: a consumer that falls behind sees only the
    /// latest notification.
    pub async fn start_notifications(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationReceiver> {
        validate_id(peripheral_id)?;
        let handle = CharacteristicHandle::new(peripheral_id, service, characteristic);
        let receiver = self.router.subscribe(&handle);
        let rx = self.submit(
            OperationKind::StartNotifications,
            TargetKey::Characteristic(handle.clone()),
        );
        if let Err(err) = await_outcome(rx).await {
            self.router.unsubscribe(&handle);
            return Err(err);
        }
        Ok(receiver)
    }

    /// Unsubscribes from a characteristic's notifications.
    pub async fn stop_notifications(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        validate_id(peripheral_id)?;
        let handle = CharacteristicHandle::new(peripheral_id, service, characteristic);
        self.router.unsubscribe(&handle);
        let rx = self.submit(
            OperationKind::StopNotifications,
            TargetKey::Characteristic(handle),
        );
        await_outcome(rx).await.map(|_| ())
    }

    /// Reads the signal strength of a connected peripheral.
    pub async fn read_rssi(&self, peripheral_id: &str) -> Result<i16> {
        validate_id(peripheral_id)?;
        let peripheral = self.registry.get(peripheral_id)?;
        if peripheral.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected(peripheral_id.to_string()));
        }
        let rx = self.submit(
            OperationKind::ReadRssi,
            TargetKey::Peripheral(peripheral_id.to_string()),
        );
        match await_outcome(rx).await? {
            OperationOutcome::Rssi(rssi) => Ok(rssi),
            other => Err(SessionError::InvalidArgument(format!(
                "RSSI read resolved with unexpected outcome {:?}",
                other
            ))),
        }
    }

    /// Connected peripherals, filtered by service membership when the filter
    /// is non-empty. Always a vector, never null.
    pub fn connected_peripherals(&self, service_uuids: &[Uuid]) -> Vec<Peripheral> {
        self.registry
            .list_connected()
            .into_iter()
            .filter(|p| p.matches_services(service_uuids))
            .collect()
    }

    /// All peripherals currently in the Discovered state.
    pub fn discovered_peripherals(&self) -> Vec<Peripheral> {
        self.registry.list_discovered()
    }

    /// True iff the peripheral appears among the connected peripherals
    /// matching the filter.
    pub fn is_peripheral_connected(&self, peripheral_id: &str, service_uuids: &[Uuid]) -> bool {
        self.connected_peripherals(service_uuids)
            .iter()
            .any(|p| p.id == peripheral_id)
    }

    /// Drops a peripheral from the registry. Refused while connected.
    pub fn forget_peripheral(&self, peripheral_id: &str) -> Result<()> {
        validate_id(peripheral_id)?;
        self.registry.forget(peripheral_id)
    }

    fn submit(
        &self,
        kind: OperationKind,
        target: TargetKey,
    ) -> oneshot::Receiver<Result<OperationOutcome>> {
        let (mut op, rx) = PendingOperation::new(kind, target);
        op.retries_remaining = self.config.max_retries;
        self.queue.enqueue(op);
        rx
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.pump_cancel.cancel();
    }
}

fn validate_id(peripheral_id: &str) -> Result<()> {
    if peripheral_id.trim().is_empty() {
        return Err(SessionError::InvalidArgument(
            "peripheral id must not be empty".to_string(),
        ));
    }
    Ok(())
}

async fn await_outcome(
    rx: oneshot::Receiver<Result<OperationOutcome>>,
) -> Result<OperationOutcome> {
    match rx.await {
        Ok(result) => result,
        // The sending half only disappears if the queue dropped the
        // operation wholesale (runtime shutdown).
        Err(_) => Err(SessionError::Cancelled),
    }
}

/// Consumes driver events for the lifetime of the session manager.
async fn event_pump(
    mut events: broadcast::Receiver<RadioEvent>,
    registry: Arc<PeripheralRegistry>,
    router: Arc<NotificationRouter>,
    queue: OperationQueue,
    powered_on: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(RadioEvent::PeripheralDiscovered { id, name, address, rssi, services }) => {
                    registry.record_discovered(&id, name, address, rssi, &services);
                }
                Ok(RadioEvent::NotificationReceived { handle, data }) => {
                    router.publish(&handle, data);
                }
                Ok(RadioEvent::ConnectionStateChanged { peripheral_id, connected }) => {
                    if connected {
                        debug!("driver reports {} connected", peripheral_id);
                    } else {
                        queue.cancel_peripheral(&peripheral_id);
                        router.unsubscribe_peripheral(&peripheral_id);
                        registry.mark_link_lost(&peripheral_id);
                    }
                }
                Ok(RadioEvent::BluetoothStateChanged { powered_on: on }) => {
                    info!("adapter power state changed: {}", on);
                    powered_on.store(on, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("event pump lagged, {} driver event(s) dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    error!("driver event stream closed, event pump exiting");
                    break;
                }
            }
        }
    }
}
