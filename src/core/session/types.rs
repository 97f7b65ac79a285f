//! Defines shared data structures for the session module.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Result, SessionError};

/// Lifecycle state of a peripheral tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Snapshot of a tracked peripheral.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Peripheral {
    /// Platform-specific stable identifier for the peripheral.
    pub id: String,
    /// The advertised name, if available
    pub name: Option<String>,
    /// The address of the device (MAC address on most platforms, may be unavailable on macOS)
    pub address: Option<String>,
    /// Last known signal strength in dBm
    pub rssi: Option<i16>,
    /// Current connection state
    pub state: ConnectionState,
    /// Service UUIDs seen in advertisements or discovered after connecting
    pub services: BTreeSet<Uuid>,
    /// When this entry last changed; listings are most-recent-first.
    pub updated_at: DateTime<Utc>,
}

impl Peripheral {
    pub fn new(id: impl Into<String>) -> Self {
        Peripheral {
            id: id.into(),
            name: None,
            address: None,
            rssi: None,
            state: ConnectionState::Discovered,
            services: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// Whether this peripheral advertises any of the given services.
    /// An empty filter matches everything.
    pub fn matches_services(&self, filter: &[Uuid]) -> bool {
        filter.is_empty() || filter.iter().any(|u| self.services.contains(u))
    }
}

/// Identifies a readable/writable/notifiable endpoint on a peripheral.
/// Pure lookup key, no lifecycle of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub peripheral_id: String,
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicHandle {
    pub fn new(peripheral_id: impl Into<String>, service: Uuid, characteristic: Uuid) -> Self {
        CharacteristicHandle {
            peripheral_id: peripheral_id.into(),
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.peripheral_id, self.service, self.characteristic
        )
    }
}

/// Serialization domain of an operation: everything queued behind the same
/// target runs strictly one at a time, unrelated targets run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetKey {
    /// Connect/disconnect/RSSI share the peripheral-level queue.
    Peripheral(String),
    /// Reads, writes and notification toggles serialize per characteristic.
    Characteristic(CharacteristicHandle),
}

impl TargetKey {
    pub fn peripheral_id(&self) -> &str {
        match self {
            TargetKey::Peripheral(id) => id,
            TargetKey::Characteristic(handle) => &handle.peripheral_id,
        }
    }
}

/// What a pending operation asks the radio driver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
    WriteWithoutResponse,
    StartNotifications,
    StopNotifications,
    ReadRssi,
    Connect,
    Disconnect,
}

/// Successful outcome of a pending operation.
#[derive(Debug, Clone)]
pub enum OperationOutcome {
    /// Bytes returned by a read.
    Bytes(Vec<u8>),
    /// Signal strength in dBm.
    Rssi(i16),
    /// Operations that return nothing on success.
    Done,
}

/// A queued unit of work. Created when a caller invokes a session operation,
/// destroyed when its completion slot resolves (exactly once).
pub struct PendingOperation {
    pub kind: OperationKind,
    pub target: TargetKey,
    /// Write payload; empty for everything else.
    pub payload: Vec<u8>,
    /// Payload split size for writes.
    pub max_chunk_size: usize,
    /// Pause between chunks of a write-without-response.
    pub queue_sleep_time: std::time::Duration,
    /// Transient-failure retries remaining.
    pub retries_remaining: u32,
    pub(crate) completion: oneshot::Sender<Result<OperationOutcome>>,
}

impl PendingOperation {
    /// Builds an operation together with the receiving half of its
    /// completion slot.
    pub fn new(
        kind: OperationKind,
        target: TargetKey,
    ) -> (Self, oneshot::Receiver<Result<OperationOutcome>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingOperation {
                kind,
                target,
                payload: Vec::new(),
                max_chunk_size: crate::config::session_config::DEFAULT_MAX_CHUNK_SIZE,
                queue_sleep_time: std::time::Duration::ZERO,
                retries_remaining: 0,
                completion: tx,
            },
            rx,
        )
    }

    pub(crate) fn resolve(self, result: Result<OperationOutcome>) {
        // The caller may have given up waiting; that must not wedge the queue.
        if self.completion.send(result).is_err() {
            log::debug!("completion slot dropped before operation resolved");
        }
    }

    pub(crate) fn cancel(self) {
        self.resolve(Err(SessionError::Cancelled));
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("payload_len", &self.payload.len())
            .field("retries_remaining", &self.retries_remaining)
            .finish()
    }
}

/// Events emitted by the radio driver and consumed by the session manager.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    PeripheralDiscovered {
        id: String,
        name: Option<String>,
        address: Option<String>,
        rssi: Option<i16>,
        services: Vec<Uuid>,
    },
    NotificationReceived {
        handle: CharacteristicHandle,
        data: Vec<u8>,
    },
    ConnectionStateChanged {
        peripheral_id: String,
        connected: bool,
    },
    BluetoothStateChanged {
        powered_on: bool,
    },
}
