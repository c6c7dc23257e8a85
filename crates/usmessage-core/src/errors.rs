//! Error types for the device-sync engine
//!
//! A single taxonomy covers the link, the state machine and the cache. Cache
//! reads absorb link errors and fall back to the last snapshot. Mutating
//! operations return them to the caller unchanged.

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors produced by the sync engine and its transports
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("No link to device: {reason}")]
    LinkUnavailable { reason: String },

    #[error("Conflicting operation in flight: {operation}")]
    Busy { operation: String },

    #[error("A device scan is already running")]
    AlreadyScanning,

    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Link to device lost")]
    LinkLost,

    #[error("Malformed transfer: {reason}")]
    MalformedTransfer { reason: String },

    #[error("Not connected to a device")]
    NotConnected,

    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("Unsupported: {what}")]
    Unsupported { what: String },

    #[error("Device rejected request: {reason}")]
    Rejected { reason: String },

    #[error("Cannot {operation} while {state}")]
    InvalidTransition {
        state: &'static str,
        operation: &'static str,
    },

    #[error("Invalid attachment {path:?}: {reason}")]
    InvalidAttachment { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl SyncError {
    /// Create a malformed-transfer error
    pub fn malformed(reason: impl Into<String>) -> Self {
        SyncError::MalformedTransfer {
            reason: reason.into(),
        }
    }

    /// Create a busy error naming the conflicting operation
    pub fn busy(operation: impl Into<String>) -> Self {
        SyncError::Busy {
            operation: operation.into(),
        }
    }

    /// Create an unsupported error naming the missing capability
    pub fn unsupported(what: impl Into<String>) -> Self {
        SyncError::Unsupported { what: what.into() }
    }

    /// Whether the error means the physical link went away
    pub fn is_link_lost(&self) -> bool {
        matches!(self, SyncError::LinkLost)
    }
}

/// Result type used throughout the sync engine
pub type Result<T> = std::result::Result<T, SyncError>;
