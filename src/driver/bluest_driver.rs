//! Production radio driver backed by the `bluest` crate.
//!
//! Keeps a map of platform device handles keyed by their stable identifier,
//! resolves characteristics through service discovery with a small cache,
//! and forwards discoveries / notifications / link changes as events.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::session::types::{CharacteristicHandle, RadioEvent};
use crate::driver::RadioDriver;
use crate::error::{Result, SessionError};

const EVENT_CHANNEL_CAPACITY: usize = 64;

fn driver_err(e: impl std::fmt::Display) -> SessionError {
    SessionError::driver("bluest", e)
}

pub struct BluestDriver {
    adapter: Adapter,
    /// Platform device handles keyed by their stable identifier.
    devices: Arc<Mutex<HashMap<String, Device>>>,
    /// Resolved characteristic handles; discovery is expensive.
    characteristics: tokio::sync::Mutex<HashMap<CharacteristicHandle, Characteristic>>,
    scan_cancel: Mutex<Option<CancellationToken>>,
    notify_cancels: Mutex<HashMap<CharacteristicHandle, CancellationToken>>,
    events: broadcast::Sender<RadioEvent>,
}

impl BluestDriver {
    /// Binds to the platform's default Bluetooth adapter.
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| SessionError::driver("bluest", "no Bluetooth adapter found"))?;
        adapter.wait_available().await.map_err(driver_err)?;
        info!("Bluetooth adapter is available.");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(BluestDriver {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            characteristics: tokio::sync::Mutex::new(HashMap::new()),
            scan_cancel: Mutex::new(None),
            notify_cancels: Mutex::new(HashMap::new()),
            events,
        })
    }

    fn device(&self, peripheral_id: &str) -> Result<Device> {
        self.devices
            .lock()
            .unwrap()
            .get(peripheral_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(peripheral_id.to_string()))
    }

    /// Resolves a characteristic via service discovery, caching the handle.
    async fn characteristic(&self, handle: &CharacteristicHandle) -> Result<Characteristic> {
        let mut cache = self.characteristics.lock().await;
        if let Some(chr) = cache.get(handle) {
            return Ok(chr.clone());
        }

        let device = self.device(&handle.peripheral_id)?;
        let services = device.services().await.map_err(driver_err)?;
        let service = services
            .iter()
            .find(|s| s.uuid() == handle.service)
            .ok_or_else(|| {
                SessionError::NotFound(format!(
                    "service {} on {}",
                    handle.service, handle.peripheral_id
                ))
            })?;

        for chr in service.characteristics().await.map_err(driver_err)? {
            if chr.uuid() == handle.characteristic {
                debug!("resolved characteristic {}", handle);
                cache.insert(handle.clone(), chr.clone());
                return Ok(chr);
            }
        }
        Err(SessionError::NotFound(format!("characteristic {}", handle)))
    }

    /// Forgets cached handles and notification pumps for a peripheral once
    /// the link is gone; they are stale after a reconnect.
    fn purge_peripheral(&self, peripheral_id: &str) {
        let mut cancels = self.notify_cancels.lock().unwrap();
        cancels.retain(|handle, token| {
            if handle.peripheral_id == peripheral_id {
                token.cancel();
                false
            } else {
                true
            }
        });
    }

    async fn purge_characteristics(&self, peripheral_id: &str) {
        self.characteristics
            .lock()
            .await
            .retain(|handle, _| handle.peripheral_id != peripheral_id);
    }

    fn extract_mac_address(device_id_str: &str) -> Option<String> {
        let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
        re.find_iter(device_id_str)
            .last()
            .map(|m| m.as_str().to_uppercase())
    }

    fn emit_discovered(
        devices: &Arc<Mutex<HashMap<String, Device>>>,
        events: &broadcast::Sender<RadioEvent>,
        device: Device,
        rssi: Option<i16>,
        services: Vec<Uuid>,
    ) {
        let id = device.id().to_string();
        let name = device.name().ok();
        let address = Self::extract_mac_address(&id);

        devices.lock().unwrap().insert(id.clone(), device);

        let _ = events.send(RadioEvent::PeripheralDiscovered {
            id,
            name,
            address,
            rssi,
            services,
        });
    }

    async fn scan_task(
        adapter: Adapter,
        service_uuids: Vec<Uuid>,
        allow_duplicates: bool,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        events: broadcast::Sender<RadioEvent>,
        cancel_token: CancellationToken,
    ) {
        // Already-connected peripherals will not advertise; report them first.
        match adapter.connected_devices().await {
            Ok(connected) => {
                for device in connected {
                    Self::emit_discovered(&devices, &events, device, None, Vec::new());
                }
            }
            Err(e) => warn!("could not enumerate connected devices: {}", e),
        }

        info!("starting bluetooth scan");
        let mut scan_stream = match adapter.scan(&service_uuids).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("failed to start scan: {}", e);
                return;
            }
        };

        let mut seen: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            let device = discovered.device;
                            let rssi = discovered.rssi;
                            let services = discovered.adv_data.services.clone();
                            let id = device.id().to_string();
                            if !allow_duplicates && !seen.insert(id.clone()) {
                                continue;
                            }
                            debug!("found device {} (rssi {:?})", id, rssi);
                            Self::emit_discovered(&devices, &events, device, rssi, services);
                        }
                        None => {
                            info!("bluetooth scan stream has ended");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
        info!("scan task finished");
    }

    async fn notification_task(
        handle: CharacteristicHandle,
        chr: Characteristic,
        events: broadcast::Sender<RadioEvent>,
        cancel_token: CancellationToken,
    ) {
        let mut stream = match chr.notify().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("failed to subscribe to notifications on {}: {}", handle, e);
                return;
            }
        };
        info!("listening for notifications on {}", handle);

        loop {
            tokio::select! {
                result = stream.next() => {
                    match result {
                        Some(Ok(value)) => {
                            let _ = events.send(RadioEvent::NotificationReceived {
                                handle: handle.clone(),
                                data: value,
                            });
                        }
                        Some(Err(e)) => {
                            error!("error in notification stream for {}: {}", handle, e);
                            break;
                        }
                        None => break,
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
        info!("notification stream for {} ended", handle);
    }
}

#[async_trait]
impl RadioDriver for BluestDriver {
    async fn scan(&self, service_uuids: &[Uuid], allow_duplicates: bool) -> Result<()> {
        // A new scan supersedes the previous one.
        if let Some(token) = self.scan_cancel.lock().unwrap().take() {
            token.cancel();
        }

        let cancel_token = CancellationToken::new();
        *self.scan_cancel.lock().unwrap() = Some(cancel_token.clone());

        tokio::spawn(Self::scan_task(
            self.adapter.clone(),
            service_uuids.to_vec(),
            allow_duplicates,
            self.devices.clone(),
            self.events.clone(),
            cancel_token,
        ));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(token) = self.scan_cancel.lock().unwrap().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn enable(&self) -> Result<()> {
        self.adapter.wait_available().await.map_err(driver_err)?;
        let _ = self
            .events
            .send(RadioEvent::BluetoothStateChanged { powered_on: true });
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<()> {
        let device = self.device(peripheral_id)?;
        if !device.is_connected().await {
            info!("initiating connection to {}", peripheral_id);
            self.adapter
                .connect_device(&device)
                .await
                .map_err(driver_err)?;
        }
        let _ = self.events.send(RadioEvent::ConnectionStateChanged {
            peripheral_id: peripheral_id.to_string(),
            connected: true,
        });
        Ok(())
    }

    async fn disconnect(&self, peripheral_id: &str) -> Result<()> {
        let device = self.device(peripheral_id)?;
        self.purge_peripheral(peripheral_id);
        self.purge_characteristics(peripheral_id).await;

        if device.is_connected().await {
            info!("disconnecting from {}", peripheral_id);
            self.adapter
                .disconnect_device(&device)
                .await
                .map_err(driver_err)?;
        }
        let _ = self.events.send(RadioEvent::ConnectionStateChanged {
            peripheral_id: peripheral_id.to_string(),
            connected: false,
        });
        Ok(())
    }

    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>> {
        let chr = self.characteristic(handle).await?;
        chr.read().await.map_err(driver_err)
    }

    async fn write(&self, handle: &CharacteristicHandle, chunk: &[u8]) -> Result<()> {
        let chr = self.characteristic(handle).await?;
        chr.write(chunk).await.map_err(driver_err)
    }

    async fn write_without_response(
        &self,
        handle: &CharacteristicHandle,
        chunk: &[u8],
    ) -> Result<()> {
        let chr = self.characteristic(handle).await?;
        chr.write_without_response(chunk).await.map_err(driver_err)
    }

    async fn start_notifications(&self, handle: &CharacteristicHandle) -> Result<()> {
        let chr = self.characteristic(handle).await?;
        let cancel_token = CancellationToken::new();
        {
            let mut cancels = self.notify_cancels.lock().unwrap();
            if let Some(previous) = cancels.insert(handle.clone(), cancel_token.clone()) {
                previous.cancel();
            }
        }
        tokio::spawn(Self::notification_task(
            handle.clone(),
            chr,
            self.events.clone(),
            cancel_token,
        ));
        Ok(())
    }

    async fn stop_notifications(&self, handle: &CharacteristicHandle) -> Result<()> {
        if let Some(token) = self.notify_cancels.lock().unwrap().remove(handle) {
            // Dropping the notify stream unsubscribes at the platform level.
            token.cancel();
        }
        Ok(())
    }

    async fn read_rssi(&self, peripheral_id: &str) -> Result<i16> {
        let device = self.device(peripheral_id)?;
        device.rssi().await.map_err(driver_err)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }
}
