//! Scan lifecycle handling.
//!
//! Starting a scan resolves as soon as the radio driver accepted the
//! request; discovery results arrive as driver events. A timer task stops
//! the scan after the requested duration unless the caller stops it first.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::driver::RadioDriver;
use crate::error::Result;

struct ActiveScan {
    cancel_token: CancellationToken,
    auto_stop_handle: Option<JoinHandle<()>>,
}

pub struct ScanController {
    driver: Arc<dyn RadioDriver>,
    active: Mutex<Option<ActiveScan>>,
}

impl ScanController {
    pub fn new(driver: Arc<dyn RadioDriver>) -> Self {
        ScanController {
            driver,
            active: Mutex::new(None),
        }
    }

    /// Requests discovery from the driver and arms the auto-stop timer.
    /// A duration of zero scans until `stop` is called.
    pub async fn start(
        &self,
        service_uuids: &[Uuid],
        duration: Duration,
        allow_duplicates: bool,
    ) -> Result<()> {
        // Restarting a scan supersedes the previous one.
        self.disarm();

        self.driver.scan(service_uuids, allow_duplicates).await?;

        let cancel_token = CancellationToken::new();
        let auto_stop_handle = if duration.is_zero() {
            None
        } else {
            let driver = self.driver.clone();
            let token = cancel_token.clone();
            Some(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        info!("scan duration elapsed, stopping discovery");
                        if let Err(e) = driver.stop_scan().await {
                            error!("failed to auto-stop scan: {}", e);
                        }
                    }
                    _ = token.cancelled() => {}
                }
            }))
        };

        *self.active.lock().unwrap() = Some(ActiveScan {
            cancel_token,
            auto_stop_handle,
        });
        info!("scan requested (auto-stop after {:?})", duration);
        Ok(())
    }

    /// Cancels the in-flight scan. Safe to call when nothing is scanning;
    /// the stop request still passes through to the driver.
    pub async fn stop(&self) -> Result<()> {
        self.disarm();
        self.driver.stop_scan().await
    }

    fn disarm(&self) {
        if let Some(scan) = self.active.lock().unwrap().take() {
            scan.cancel_token.cancel();
            if let Some(handle) = scan.auto_stop_handle {
                handle.abort();
            }
        }
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        if let Some(scan) = self.active.lock().unwrap().take() {
            scan.cancel_token.cancel();
        }
    }
}
