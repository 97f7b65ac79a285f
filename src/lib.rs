//! BLE peripheral session manager.
//!
//! Owns scan/connect/read/write/notify sequencing on top of an injected
//! radio driver: per-target FIFO queueing so writes never interleave,
//! transient-failure retry with doubling backoff, chunked writes for
//! printer-class peripherals, and a registry of discovered and connected
//! peripherals. The production driver is backed by `bluest`; tests inject
//! a scripted double through the same [`driver::RadioDriver`] trait.

// Module declarations
pub mod config;
pub mod core;
pub mod driver;
pub mod error;

pub use config::SessionConfig;
pub use core::session::{
    CharacteristicHandle, ConnectionState, NotificationReceiver, OperationKind, Peripheral,
    PeripheralRegistry, RadioEvent, SessionManager,
};
pub use driver::{BluestDriver, RadioDriver};
pub use error::{Result, SessionError};
