//! Adapter initialisation and peripheral scanning

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use usmessage_core::transport::DiscoveredDevice;
use usmessage_core::{DeviceId, TransportKind};

use crate::config::BleTransportConfig;
use crate::error::BleTransportError;

/// Stable device id for a peripheral
///
/// Platform peripheral ids have no common text form, so the debug rendering
/// is used. It is stable for the lifetime of the adapter.
pub fn device_id(peripheral: &Peripheral) -> DeviceId {
    DeviceId::new(format!("{:?}", peripheral.id()))
}

// ----------------------------------------------------------------------------
// Discovery Implementation
// ----------------------------------------------------------------------------

/// Lazily initialised adapter plus scan logic
pub struct BleDiscovery {
    config: BleTransportConfig,
    adapter: OnceCell<Adapter>,
}

impl BleDiscovery {
    pub fn new(config: BleTransportConfig) -> Self {
        Self {
            config,
            adapter: OnceCell::new(),
        }
    }

    /// First system adapter, initialised on first use
    pub async fn adapter(&self) -> Result<&Adapter, BleTransportError> {
        self.adapter
            .get_or_try_init(|| async {
                let manager = Manager::new().await?;
                let adapter = manager
                    .adapters()
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(BleTransportError::AdapterNotAvailable)?;
                info!("BLE adapter initialized");
                Ok::<_, BleTransportError>(adapter)
            })
            .await
    }

    fn scan_filter(&self) -> ScanFilter {
        if self.config.scan_filter_by_service {
            ScanFilter {
                services: vec![self.config.layout.service],
            }
        } else {
            ScanFilter::default()
        }
    }

    /// Scan for `timeout` and report every peripheral the adapter knows
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, BleTransportError> {
        let adapter = self.adapter().await?;
        adapter.start_scan(self.scan_filter()).await?;
        info!("Started BLE scan for {:?}", timeout);

        tokio::time::sleep(timeout).await;
        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }

        let mut devices = Vec::new();
        for peripheral in adapter.peripherals().await? {
            let properties = match peripheral.properties().await {
                Ok(Some(properties)) => properties,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Skipping peripheral without properties: {}", e);
                    continue;
                }
            };
            devices.push(DiscoveredDevice {
                id: device_id(&peripheral),
                name: properties.local_name,
                address: Some(properties.address.to_string()),
                transport: TransportKind::Bluetooth,
                paired: false,
            });
        }

        debug!("BLE scan saw {} peripheral(s)", devices.len());
        Ok(devices)
    }

    /// Look up a previously scanned peripheral by device id
    pub async fn peripheral(&self, id: &DeviceId) -> Result<Peripheral, BleTransportError> {
        let adapter = self.adapter().await?;
        adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|peripheral| &device_id(peripheral) == id)
            .ok_or_else(|| BleTransportError::PeripheralNotFound { id: id.to_string() })
    }
}

impl std::fmt::Debug for BleDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleDiscovery")
            .field("initialized", &self.adapter.initialized())
            .field("filter_by_service", &self.config.scan_filter_by_service)
            .finish()
    }
}
