//! BLE transport configuration

use std::time::Duration;

use btleplug::api::WriteType;
use serde::{Deserialize, Serialize};

use crate::protocol::GattLayout;

// ----------------------------------------------------------------------------
// Write Mode
// ----------------------------------------------------------------------------

/// How requests are written to a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Acknowledged write; the read that follows sees the device's answer
    #[default]
    WithResponse,
    /// Unacknowledged write
    WithoutResponse,
}

impl WriteMode {
    pub(crate) fn write_type(self) -> WriteType {
        match self {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the BLE transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleTransportConfig {
    /// Service and characteristic UUIDs
    pub layout: GattLayout,
    /// Only report peripherals advertising the companion service
    pub scan_filter_by_service: bool,
    /// Maximum time to wait for the GATT connection and service discovery
    pub connection_timeout: Duration,
    /// Silence that ends the discard of chunks left by an aborted transfer
    pub stale_chunk_settle: Duration,
    pub write_mode: WriteMode,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            layout: GattLayout::default(),
            scan_filter_by_service: false,
            connection_timeout: Duration::from_secs(10),
            stale_chunk_settle: Duration::from_millis(100),
            write_mode: WriteMode::default(),
        }
    }
}

impl BleTransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layout(mut self, layout: GattLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Restrict scans to peripherals advertising the companion service
    pub fn with_scan_filter_by_service(mut self, enabled: bool) -> Self {
        self.scan_filter_by_service = enabled;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_stale_chunk_settle(mut self, settle: Duration) -> Self {
        self.stale_chunk_settle = settle;
        self
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }
}
