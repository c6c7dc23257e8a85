//! Transport abstraction over a characteristic-based device link
//!
//! A [`Transport`] discovers devices of one [`TransportKind`] and opens a
//! [`Channel`] to one of them. A channel exposes named [`Endpoint`]s with a
//! write-then-read exchange and a chunked large-payload mode. Channels carry
//! no request correlation, so callers go through [`RequestPipe`], which
//! serializes exchanges per endpoint.

pub mod mock;
pub mod pipe;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::LinkMonitor;
use crate::errors::{Result, SyncError};
use crate::types::{Device, DeviceId, TransportKind};

pub use mock::{MockDevice, MockFailure, MockTransport};
pub use pipe::RequestPipe;

// ----------------------------------------------------------------------------
// Endpoints
// ----------------------------------------------------------------------------

/// Named logical channel on a device link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    /// Conversation and message request/response exchanges
    Messages,
    /// Attachment retrieval; responses arrive chunked
    Attachments,
    /// Device-initiated pushes
    Notifications,
}

impl Endpoint {
    pub const COUNT: usize = 3;

    pub const ALL: [Endpoint; Self::COUNT] =
        [Endpoint::Messages, Endpoint::Attachments, Endpoint::Notifications];

    /// Stable slot index for per-endpoint tables
    pub fn index(self) -> usize {
        match self {
            Endpoint::Messages => 0,
            Endpoint::Attachments => 1,
            Endpoint::Notifications => 2,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Endpoint::Messages => "messages",
            Endpoint::Attachments => "attachments",
            Endpoint::Notifications => "notifications",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

/// A device reported by a transport scan, before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    /// Advertised local name, if any
    pub name: Option<String>,
    pub address: Option<String>,
    pub transport: TransportKind,
    pub paired: bool,
}

impl DiscoveredDevice {
    pub fn into_device(self) -> Device {
        let name = self.name.unwrap_or_else(|| self.id.to_string());
        Device {
            id: self.id,
            name,
            address: self.address,
            transport: self.transport,
            paired: self.paired,
            connected: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Transport Traits
// ----------------------------------------------------------------------------

/// A device-link technology able to discover and open channels
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Listen for devices for up to `timeout`
    async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>>;

    /// Open a channel to `device_id`
    ///
    /// The transport reports an asynchronous disconnect through `monitor`.
    /// Fails with [`SyncError::LinkUnavailable`] when the device cannot be
    /// reached at all.
    async fn open(&self, device_id: &DeviceId, monitor: LinkMonitor) -> Result<Arc<dyn Channel>>;
}

/// One open link to a device
#[async_trait]
pub trait Channel: Send + Sync {
    /// Device this channel is connected to, with its resolved name
    fn device(&self) -> Device;

    /// Write `payload` to `endpoint` and read back its response bytes
    ///
    /// Not safe to overlap on one endpoint; see [`RequestPipe`].
    async fn request(&self, endpoint: Endpoint, payload: &[u8]) -> Result<Vec<u8>>;

    /// Write `payload` to `endpoint` and reassemble a chunked response
    ///
    /// Data frames longer than `max_chunk_payload` bytes fail the transfer.
    async fn request_large(
        &self,
        endpoint: Endpoint,
        payload: &[u8],
        max_chunk_payload: usize,
    ) -> Result<Vec<u8>>;

    /// Receive device-initiated payloads on `endpoint`
    async fn subscribe(&self, endpoint: Endpoint) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        Err(SyncError::unsupported(format!("push on {} endpoint", endpoint)))
    }

    /// Tear the link down
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_indices_are_distinct() {
        let mut seen = [false; Endpoint::COUNT];
        for endpoint in Endpoint::ALL {
            assert!(!seen[endpoint.index()]);
            seen[endpoint.index()] = true;
        }
    }

    #[test]
    fn test_discovered_device_name_fallback() {
        let device = DiscoveredDevice {
            id: DeviceId::from("AA:BB"),
            name: None,
            address: None,
            transport: TransportKind::Bluetooth,
            paired: false,
        }
        .into_device();
        assert_eq!(device.name, "AA:BB");
        assert!(!device.connected);
    }
}
