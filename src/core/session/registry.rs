//! Peripheral registry: in-memory bookkeeping of every peripheral the
//! session has seen, keyed by platform identifier.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use log::{debug, warn};
use uuid::Uuid;

use crate::core::session::types::{ConnectionState, Peripheral};
use crate::error::{Result, SessionError};

/// Tracks known, discovered and connected peripherals.
///
/// Purely in-memory; every mutation goes through the single inner lock, so
/// snapshots never observe a half-applied transition.
#[derive(Default)]
pub struct PeripheralRegistry {
    inner: Mutex<HashMap<String, Peripheral>>,
}

/// Legal state transitions. The only cycle in the graph is
/// Connected <-> Disconnected through Disconnecting/Connecting.
fn transition_allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Discovered, Connecting)
            | (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connected, Disconnecting)
            | (Disconnecting, Disconnected)
    )
}

impl PeripheralRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a discovery sighting. RSSI, name, address and
    /// advertised services are updated in place, but a Connecting/Connected
    /// entry is never downgraded back to Discovered.
    pub fn record_discovered(
        &self,
        id: &str,
        name: Option<String>,
        address: Option<String>,
        rssi: Option<i16>,
        services: &[Uuid],
    ) {
        let mut map = self.inner.lock().unwrap();
        let entry = map
            .entry(id.to_string())
            .or_insert_with(|| Peripheral::new(id));

        if name.is_some() {
            entry.name = name;
        }
        if address.is_some() {
            entry.address = address;
        }
        if rssi.is_some() {
            entry.rssi = rssi;
        }
        entry.services.extend(services.iter().copied());
        match entry.state {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            _ => entry.state = ConnectionState::Discovered,
        }
        entry.updated_at = Utc::now();
        debug!("recorded discovery for {} (rssi {:?})", id, entry.rssi);
    }

    /// Applies a state transition, rejecting anything outside the allowed set.
    pub fn set_state(&self, id: &str, new_state: ConnectionState) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        let entry = map
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if !transition_allowed(entry.state, new_state) {
            return Err(SessionError::InvalidTransition {
                from: entry.state,
                to: new_state,
            });
        }
        debug!("{}: {:?} -> {:?}", id, entry.state, new_state);
        entry.state = new_state;
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Walks a peripheral to Disconnected after the link dropped underneath
    /// us. Tolerates any starting state; a no-op if already Disconnected.
    pub fn mark_link_lost(&self, id: &str) {
        let mut map = self.inner.lock().unwrap();
        let Some(entry) = map.get_mut(id) else {
            return;
        };
        match entry.state {
            ConnectionState::Disconnected | ConnectionState::Discovered => {}
            state => {
                warn!("link to {} lost while {:?}", id, state);
                entry.state = ConnectionState::Disconnected;
                entry.updated_at = Utc::now();
            }
        }
    }

    /// Returns a snapshot of the peripheral.
    pub fn get(&self, id: &str) -> Result<Peripheral> {
        self.inner
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Snapshots of all connected peripherals, most recently updated first.
    pub fn list_connected(&self) -> Vec<Peripheral> {
        self.list_in_state(ConnectionState::Connected)
    }

    /// Snapshots of all discovered peripherals, most recently updated first.
    pub fn list_discovered(&self) -> Vec<Peripheral> {
        self.list_in_state(ConnectionState::Discovered)
    }

    fn list_in_state(&self, state: ConnectionState) -> Vec<Peripheral> {
        let map = self.inner.lock().unwrap();
        let mut entries: Vec<Peripheral> =
            map.values().filter(|p| p.state == state).cloned().collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entries
    }

    /// Removes a peripheral entirely. Refused while a connection is live or
    /// being established.
    pub fn forget(&self, id: &str) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        let entry = map
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        match entry.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Disconnecting => Err(SessionError::InvalidArgument(format!(
                "cannot forget {} while {:?}",
                id, entry.state
            ))),
            _ => {
                map.remove(id);
                Ok(())
            }
        }
    }
}
