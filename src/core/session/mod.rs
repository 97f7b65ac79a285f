//! BLE session core: scanning, connection lifecycle, queued characteristic
//! access and notification delivery.

mod manager;
mod notification;
mod queue;
mod registry;
mod scanner;
pub mod types;

// Re-export types that should be publicly accessible
pub use manager::SessionManager;
pub use notification::{NotificationReceiver, NotificationRouter};
pub use queue::OperationQueue;
pub use registry::PeripheralRegistry;
pub use scanner::ScanController;
pub use types::{
    CharacteristicHandle, ConnectionState, OperationKind, OperationOutcome, PendingOperation,
    Peripheral, RadioEvent, TargetKey,
};
