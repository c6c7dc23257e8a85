//! Error types for the BLE transport

use std::time::Duration;

use thiserror::Error;
use usmessage_core::SyncError;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the BLE transport
#[derive(Error, Debug)]
pub enum BleTransportError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Peripheral not found: {id}")]
    PeripheralNotFound { id: String },

    #[error("Failed to connect to peripheral: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("Peripheral not connected")]
    NotConnected,

    #[error("Companion service not found on peripheral")]
    ServiceNotFound,

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    #[error("Notification stream ended")]
    NotificationStreamClosed,

    #[error("BLE error: {0}")]
    Btleplug(#[from] btleplug::Error),
}

impl From<BleTransportError> for SyncError {
    fn from(err: BleTransportError) -> Self {
        match err {
            BleTransportError::AdapterNotAvailable => SyncError::LinkUnavailable {
                reason: err.to_string(),
            },
            BleTransportError::PeripheralNotFound { .. } => SyncError::LinkUnavailable {
                reason: err.to_string(),
            },
            BleTransportError::ConnectionFailed(reason) => SyncError::LinkUnavailable { reason },
            BleTransportError::ConnectionTimeout(duration) => SyncError::Timeout {
                duration_ms: duration.as_millis() as u64,
            },
            BleTransportError::NotConnected | BleTransportError::NotificationStreamClosed => {
                SyncError::LinkLost
            }
            BleTransportError::ServiceNotFound
            | BleTransportError::CharacteristicNotFound { .. }
            | BleTransportError::SubscriptionFailed(_) => SyncError::HandshakeFailed {
                reason: err.to_string(),
            },
            BleTransportError::Btleplug(inner) => match inner {
                btleplug::Error::NotConnected => SyncError::LinkLost,
                btleplug::Error::DeviceNotFound => SyncError::LinkUnavailable {
                    reason: "device not found".to_string(),
                },
                btleplug::Error::TimedOut(duration) => SyncError::Timeout {
                    duration_ms: duration.as_millis() as u64,
                },
                btleplug::Error::NoSuchCharacteristic => SyncError::HandshakeFailed {
                    reason: "no such characteristic".to_string(),
                },
                btleplug::Error::NotSupported(what) => SyncError::Unsupported { what },
                other => SyncError::Transport(other.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_into_sync_error() {
        assert!(matches!(
            SyncError::from(BleTransportError::NotConnected),
            SyncError::LinkLost
        ));
        assert!(matches!(
            SyncError::from(BleTransportError::AdapterNotAvailable),
            SyncError::LinkUnavailable { .. }
        ));
        assert!(matches!(
            SyncError::from(BleTransportError::CharacteristicNotFound {
                characteristic: "messages".into()
            }),
            SyncError::HandshakeFailed { .. }
        ));
        assert!(matches!(
            SyncError::from(BleTransportError::Btleplug(btleplug::Error::TimedOut(
                Duration::from_millis(1500)
            ))),
            SyncError::Timeout { duration_ms: 1500 }
        ));
        assert!(matches!(
            SyncError::from(BleTransportError::Btleplug(btleplug::Error::NotConnected)),
            SyncError::LinkLost
        ));
    }
}
