//! Notification routing for subscribed characteristics.
//!
//! One watch channel per subscribed handle: a slow consumer only ever sees
//! the latest value, so a chatty peripheral cannot grow memory without
//! bound.

use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;
use tokio::sync::watch;

use crate::core::session::types::CharacteristicHandle;

/// Receiving half of a notification subscription. `None` until the first
/// notification arrives.
pub type NotificationReceiver = watch::Receiver<Option<Vec<u8>>>;

#[derive(Default)]
pub struct NotificationRouter {
    channels: Mutex<HashMap<CharacteristicHandle, watch::Sender<Option<Vec<u8>>>>>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for the handle. Re-subscribing to a handle that
    /// already has a channel attaches to the existing one.
    pub fn subscribe(&self, handle: &CharacteristicHandle) -> NotificationReceiver {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(handle.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Delivers a notification in driver emission order, replacing any value
    /// the consumer has not picked up yet.
    pub fn publish(&self, handle: &CharacteristicHandle, data: Vec<u8>) {
        let channels = self.channels.lock().unwrap();
        match channels.get(handle) {
            Some(sender) => {
                sender.send_replace(Some(data));
            }
            None => debug!("dropping notification for unsubscribed handle {}", handle),
        }
    }

    /// Drops the handle's channel; listeners observe the sender closing.
    pub fn unsubscribe(&self, handle: &CharacteristicHandle) {
        self.channels.lock().unwrap().remove(handle);
    }

    /// Drops every channel belonging to the peripheral (disconnect path).
    pub fn unsubscribe_peripheral(&self, peripheral_id: &str) {
        self.channels
            .lock()
            .unwrap()
            .retain(|handle, _| handle.peripheral_id != peripheral_id);
    }
}
