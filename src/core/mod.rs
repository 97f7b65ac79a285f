//! Core functionality for the BLE session manager
//! This module contains the components that sequence all peripheral access

pub mod session;

// Re-export commonly used types
pub use session::SessionManager;
