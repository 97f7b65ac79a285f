//! Radio driver boundary.
//!
//! Everything below the session manager is an opaque asynchronous driver:
//! the OS Bluetooth stack, pairing UI and the physical radio live behind
//! this trait. Injecting the driver at construction time is what makes the
//! session manager testable with a scripted double.

mod bluest_driver;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::session::types::{CharacteristicHandle, RadioEvent};
use crate::error::Result;

pub use bluest_driver::BluestDriver;

/// Primitive radio operations, each asynchronous and fallible.
///
/// Write payloads arriving here are already chunked by the operation queue;
/// a driver never receives more than the configured chunk size per call.
#[async_trait]
pub trait RadioDriver: Send + Sync + 'static {
    /// Starts discovery filtered by the given service UUIDs (empty = all).
    async fn scan(&self, service_uuids: &[Uuid], allow_duplicates: bool) -> Result<()>;

    /// Stops an in-flight discovery. A no-op when nothing is scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Asks the platform to power on / make available the adapter.
    async fn enable(&self) -> Result<()>;

    async fn connect(&self, peripheral_id: &str) -> Result<()>;

    async fn disconnect(&self, peripheral_id: &str) -> Result<()>;

    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>>;

    async fn write(&self, handle: &CharacteristicHandle, chunk: &[u8]) -> Result<()>;

    async fn write_without_response(
        &self,
        handle: &CharacteristicHandle,
        chunk: &[u8],
    ) -> Result<()>;

    async fn start_notifications(&self, handle: &CharacteristicHandle) -> Result<()>;

    async fn stop_notifications(&self, handle: &CharacteristicHandle) -> Result<()>;

    /// Reads the signal strength of a connected peripheral, in dBm.
    async fn read_rssi(&self, peripheral_id: &str) -> Result<i16>;

    /// Subscribes to the driver's event stream: discoveries, notifications,
    /// link state changes and adapter power changes.
    fn subscribe_events(&self) -> broadcast::Receiver<RadioEvent>;
}
