//! Error types for BLE session operations

use thiserror::Error;

use crate::core::session::types::ConnectionState;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors that can occur during BLE session operations
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("peripheral not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("peripheral not connected: {0}")]
    NotConnected(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    /// Opaque radio driver failure, original code and message attached.
    #[error("driver error [{code}]: {message}")]
    Driver { code: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SessionError {
    /// Wraps a driver-specific failure without losing the original code.
    pub fn driver(code: impl Into<String>, message: impl ToString) -> Self {
        SessionError::Driver {
            code: code.into(),
            message: message.to_string(),
        }
    }

    /// Transient failures are worth retrying: link timeouts and a busy radio.
    /// Everything else is terminal and surfaces to the caller as-is.
    pub fn is_transient(&self) -> bool {
        match self {
            SessionError::Timeout => true,
            SessionError::Driver { code, .. } => {
                matches!(code.as_str(), "busy" | "timeout")
            }
            _ => false,
        }
    }
}
