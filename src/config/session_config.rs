use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default maximum payload size per write dispatched to the radio driver.
/// Classic BLE printers negotiate no MTU extension, so 20 bytes is the
/// safe ATT default.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 20;

/// Default pause between chunks of a write-without-response, in milliseconds.
pub const DEFAULT_QUEUE_SLEEP_TIME_MS: u64 = 10;

/// Default number of retries for transient radio failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Initial retry backoff in milliseconds. Doubles per retry.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 10;

/// Retry backoff ceiling in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_CAP_MS: u64 = 500;

/// Timeout for a single radio driver call, in seconds.
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 30;

/// Default scan duration in seconds.
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 5;

/// Session tunables.
///
/// The defaults mirror the values printer peripherals are known to cope
/// with; their origin is the driver's ATT limits rather than anything this
/// crate requires, so every one of them stays configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum payload size per write dispatched to the radio driver.
    pub max_chunk_size: usize,
    /// Pause between chunks of a write-without-response.
    pub queue_sleep_time_ms: u64,
    /// Retries granted to an operation that fails transiently.
    pub max_retries: u32,
    /// Initial backoff before a retry. Doubles per retry.
    pub retry_backoff_ms: u64,
    /// Backoff ceiling.
    pub retry_backoff_cap_ms: u64,
    /// Timeout for a single radio driver call.
    pub operation_timeout_secs: u64,
    /// Scan auto-stop duration when the caller does not pass one.
    pub scan_duration_secs: u64,
    /// Whether a scan reports repeat sightings of the same peripheral.
    pub allow_duplicates: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            queue_sleep_time_ms: DEFAULT_QUEUE_SLEEP_TIME_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            retry_backoff_cap_ms: DEFAULT_RETRY_BACKOFF_CAP_MS,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            scan_duration_secs: DEFAULT_SCAN_DURATION_SECS,
            allow_duplicates: false,
        }
    }
}

impl SessionConfig {
    pub fn queue_sleep_time(&self) -> Duration {
        Duration::from_millis(self.queue_sleep_time_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_cap_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}
