//! BLE implementation of the core [`Transport`] trait

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::Peripheral as _;
use tracing::info;
use usmessage_core::transport::{Channel, DiscoveredDevice, Transport};
use usmessage_core::{Device, DeviceId, LinkMonitor, Result, TransportKind};

use crate::config::BleTransportConfig;
use crate::connection::BleChannel;
use crate::discovery::BleDiscovery;

/// Bluetooth Low Energy transport to the companion phone app
#[derive(Debug)]
pub struct BleTransport {
    config: BleTransportConfig,
    discovery: BleDiscovery,
}

impl Default for BleTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BleTransport {
    pub fn new() -> Self {
        Self::with_config(BleTransportConfig::default())
    }

    pub fn with_config(config: BleTransportConfig) -> Self {
        Self {
            discovery: BleDiscovery::new(config.clone()),
            config,
        }
    }

    pub fn config(&self) -> &BleTransportConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        Ok(self.discovery.scan(timeout).await?)
    }

    async fn open(&self, device_id: &DeviceId, monitor: LinkMonitor) -> Result<Arc<dyn Channel>> {
        let adapter = self.discovery.adapter().await?;
        let peripheral = self.discovery.peripheral(device_id).await?;

        let properties = peripheral.properties().await.ok().flatten();
        let name = properties
            .as_ref()
            .and_then(|properties| properties.local_name.clone())
            .unwrap_or_else(|| device_id.to_string());
        let mut device = Device::new(device_id.clone(), name, TransportKind::Bluetooth);
        device.address = properties.map(|properties| properties.address.to_string());

        info!("Opening BLE channel to {}", device.name);
        let channel =
            BleChannel::connect(adapter, peripheral, device, self.config.clone(), monitor).await?;
        Ok(Arc::new(channel))
    }
}
