//! Per-target operation queue.
//!
//! Each target (a characteristic handle, or a peripheral for
//! connect/disconnect/RSSI) owns a FIFO of pending operations drained by a
//! dedicated task, so writes to one characteristic never interleave while
//! unrelated targets proceed concurrently. The queue also owns the retry
//! policy for transient radio failures and the chunking of oversized write
//! payloads.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::time::{sleep, timeout};

use crate::config::SessionConfig;
use crate::core::session::types::{
    OperationKind, OperationOutcome, PendingOperation, TargetKey,
};
use crate::driver::RadioDriver;
use crate::error::{Result, SessionError};

#[derive(Default)]
struct TargetState {
    queue: VecDeque<PendingOperation>,
    /// True while a drain task owns this target.
    running: bool,
}

/// Serializes competing requests per target and dispatches them to the
/// radio driver one at a time.
#[derive(Clone)]
pub struct OperationQueue {
    driver: Arc<dyn RadioDriver>,
    config: SessionConfig,
    targets: Arc<Mutex<HashMap<TargetKey, TargetState>>>,
}

impl OperationQueue {
    pub fn new(driver: Arc<dyn RadioDriver>, config: SessionConfig) -> Self {
        OperationQueue {
            driver,
            config,
            targets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Appends an operation to its target's queue. An idle target gets a
    /// drain task spawned immediately; a busy one picks the operation up
    /// once the in-flight work finishes.
    pub fn enqueue(&self, op: PendingOperation) {
        let key = op.target.clone();
        let spawn_drain = {
            let mut targets = self.targets.lock().unwrap();
            let entry = targets.entry(key.clone()).or_default();
            entry.queue.push_back(op);
            if entry.running {
                false
            } else {
                entry.running = true;
                true
            }
        };

        if spawn_drain {
            let queue = self.clone();
            tokio::spawn(async move {
                queue.drain_target(key).await;
            });
        }
    }

    /// Fails every queued-but-undispatched operation belonging to the
    /// peripheral with `Cancelled`. An operation already handed to the
    /// driver runs to completion on its own.
    pub fn cancel_peripheral(&self, peripheral_id: &str) {
        let drained: Vec<PendingOperation> = {
            let mut targets = self.targets.lock().unwrap();
            targets
                .iter_mut()
                .filter(|(key, _)| key.peripheral_id() == peripheral_id)
                .flat_map(|(_, state)| state.queue.drain(..))
                .collect()
        };
        if !drained.is_empty() {
            debug!(
                "cancelling {} queued operation(s) for {}",
                drained.len(),
                peripheral_id
            );
        }
        for op in drained {
            op.cancel();
        }
    }

    /// Drains one target's queue sequentially until it is empty.
    async fn drain_target(&self, key: TargetKey) {
        loop {
            let op = {
                let mut targets = self.targets.lock().unwrap();
                match targets.get_mut(&key) {
                    Some(state) => match state.queue.pop_front() {
                        Some(op) => op,
                        None => {
                            // Clearing the flag and removing the entry under
                            // the same lock as enqueue keeps the handoff
                            // race-free: a concurrent enqueue either lands in
                            // this queue before we look, or re-creates the
                            // entry and spawns a fresh drain task.
                            targets.remove(&key);
                            return;
                        }
                    },
                    None => return,
                }
            };

            let result = self.run_with_retry(&op).await;
            op.resolve(result);
        }
    }

    /// Runs one operation, retrying transient failures with doubling
    /// backoff until the retry budget is spent. N retries means at most
    /// N + 1 attempts.
    async fn run_with_retry(&self, op: &PendingOperation) -> Result<OperationOutcome> {
        let mut attempts_left = op.retries_remaining.saturating_add(1);
        let mut backoff = self.config.retry_backoff();
        loop {
            match self.attempt(op).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_transient() && attempts_left > 1 => {
                    attempts_left -= 1;
                    warn!(
                        "transient failure on {:?} for {:?}, retrying in {:?}: {}",
                        op.kind, op.target, backoff, err
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.retry_backoff_cap());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One full attempt at the operation. A failure on any chunk of a write
    /// aborts the remaining chunks; the retry above re-runs the whole write,
    /// never an individual chunk.
    async fn attempt(&self, op: &PendingOperation) -> Result<OperationOutcome> {
        match (op.kind, &op.target) {
            (OperationKind::Read, TargetKey::Characteristic(handle)) => {
                let data = self.bounded(self.driver.read(handle)).await?;
                Ok(OperationOutcome::Bytes(data))
            }
            (OperationKind::Write, TargetKey::Characteristic(handle)) => {
                for chunk in op.payload.chunks(op.max_chunk_size.max(1)) {
                    self.bounded(self.driver.write(handle, chunk)).await?;
                }
                Ok(OperationOutcome::Done)
            }
            (OperationKind::WriteWithoutResponse, TargetKey::Characteristic(handle)) => {
                let mut chunks = op.payload.chunks(op.max_chunk_size.max(1)).peekable();
                while let Some(chunk) = chunks.next() {
                    self.bounded(self.driver.write_without_response(handle, chunk))
                        .await?;
                    if chunks.peek().is_some() && !op.queue_sleep_time.is_zero() {
                        sleep(op.queue_sleep_time).await;
                    }
                }
                Ok(OperationOutcome::Done)
            }
            (OperationKind::StartNotifications, TargetKey::Characteristic(handle)) => {
                self.bounded(self.driver.start_notifications(handle)).await?;
                Ok(OperationOutcome::Done)
            }
            (OperationKind::StopNotifications, TargetKey::Characteristic(handle)) => {
                self.bounded(self.driver.stop_notifications(handle)).await?;
                Ok(OperationOutcome::Done)
            }
            (OperationKind::ReadRssi, TargetKey::Peripheral(id)) => {
                let rssi = self.bounded(self.driver.read_rssi(id)).await?;
                Ok(OperationOutcome::Rssi(rssi))
            }
            (OperationKind::Connect, TargetKey::Peripheral(id)) => {
                self.bounded(self.driver.connect(id)).await?;
                Ok(OperationOutcome::Done)
            }
            (OperationKind::Disconnect, TargetKey::Peripheral(id)) => {
                self.bounded(self.driver.disconnect(id)).await?;
                Ok(OperationOutcome::Done)
            }
            (kind, target) => Err(SessionError::InvalidArgument(format!(
                "operation {:?} cannot target {:?}",
                kind, target
            ))),
        }
    }

    /// Applies the per-call driver timeout.
    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match timeout(self.operation_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout),
        }
    }

    fn operation_timeout(&self) -> Duration {
        self.config.operation_timeout()
    }
}
