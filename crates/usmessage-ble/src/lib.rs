//! Bluetooth Low Energy transport for the usMessage device-sync engine
//!
//! Implements the `Transport` and `Channel` traits from `usmessage-core` on
//! top of `btleplug`, talking to the companion phone app's GATT service.
//!
//! ## Architecture
//!
//! - [`config`] - Transport configuration and settings
//! - [`error`] - Error types specific to the BLE transport
//! - [`protocol`] - Service and characteristic UUIDs
//! - [`discovery`] - Adapter initialisation and scanning
//! - [`connection`] - GATT channel, notification routing, link supervision
//! - [`transport`] - The `Transport` implementation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use usmessage_ble::{BleTransport, BleTransportConfig};
//! use usmessage_core::SyncContext;
//!
//! # async fn example() -> usmessage_core::Result<()> {
//! let config = BleTransportConfig::new().with_scan_filter_by_service(true);
//! let context = SyncContext::builder()
//!     .with_transport(Arc::new(BleTransport::with_config(config)))
//!     .build();
//!
//! for device in context.scan().await? {
//!     println!("{} ({})", device.name, device.id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod transport;

// Public API exports
pub use config::{BleTransportConfig, WriteMode};
pub use connection::BleChannel;
pub use error::BleTransportError;
pub use protocol::{
    GattLayout, ATTACHMENTS_CHARACTERISTIC_UUID, MESSAGES_CHARACTERISTIC_UUID,
    NOTIFICATIONS_CHARACTERISTIC_UUID, USMESSAGE_SERVICE_UUID,
};
pub use transport::BleTransport;
