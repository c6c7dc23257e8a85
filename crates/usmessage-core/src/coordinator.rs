//! Device discovery, classification and connection routing
//!
//! The coordinator fans a scan out over every registered transport, keeps
//! the devices that look like a companion phone, and routes connect calls to
//! the transport a device was discovered on. It holds the only "current
//! device" reference, derived from the connection state.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::connection::{ConnectionMachine, ConnectionState};
use crate::errors::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::transport::{DiscoveredDevice, Transport};
use crate::types::{Device, DeviceId, TransportKind};

// ----------------------------------------------------------------------------
// Device Classification
// ----------------------------------------------------------------------------

/// Name heuristic for companion devices
///
/// Only trims the candidate list. A match says nothing about who the device
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    keywords: Vec<String>,
}

impl DeviceFilter {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|keyword| keyword.as_ref().to_lowercase())
                .filter(|keyword| !keyword.is_empty())
                .collect(),
        }
    }

    /// Case-insensitive substring match against the keyword vocabulary
    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.keywords.iter().any(|keyword| name.contains(keyword))
    }

    pub fn is_candidate(&self, device: &DiscoveredDevice) -> bool {
        device
            .name
            .as_deref()
            .map(|name| self.matches(name))
            .unwrap_or(false)
    }
}

/// Connection summary polled by the UI at start-up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub connected: bool,
    pub device_name: Option<String>,
}

// ----------------------------------------------------------------------------
// Device Coordinator
// ----------------------------------------------------------------------------

/// Routes discovery and connection across transports
pub struct DeviceCoordinator {
    config: SyncConfig,
    filter: DeviceFilter,
    transports: Vec<Arc<dyn Transport>>,
    machine: Arc<ConnectionMachine>,
    events: EventBus,
    discovered: RwLock<BTreeMap<DeviceId, Device>>,
    current: RwLock<Option<Device>>,
}

impl DeviceCoordinator {
    pub fn new(
        config: SyncConfig,
        transports: Vec<Arc<dyn Transport>>,
        machine: Arc<ConnectionMachine>,
        events: EventBus,
    ) -> Self {
        Self {
            filter: DeviceFilter::new(&config.device_keywords),
            config,
            transports,
            machine,
            events,
            discovered: RwLock::new(BTreeMap::new()),
            current: RwLock::new(None),
        }
    }

    fn transport(&self, kind: TransportKind) -> Result<&Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|transport| transport.kind() == kind)
            .ok_or_else(|| SyncError::unsupported(format!("{} transport", kind)))
    }

    /// Scan every transport and return the classified candidates
    ///
    /// The active device, if any, stays in the discovered set even when it
    /// is out of scan range.
    pub async fn scan(&self) -> Result<Vec<Device>> {
        self.machine.begin_scan()?;
        self.events.emit(SyncEvent::ScanStarted);
        info!("Scanning for devices on {} transport(s)", self.transports.len());

        let mut found = Vec::new();
        let mut failure = None;
        for transport in &self.transports {
            match transport.scan(self.config.scan_timeout).await {
                Ok(devices) => {
                    debug!("{} transport reported {} device(s)", transport.kind(), devices.len());
                    found.extend(devices);
                }
                Err(e) => {
                    warn!("{} scan failed: {}", transport.kind(), e);
                    failure = Some(e);
                }
            }
        }
        self.machine.finish_scan();

        let candidates: Vec<Device> = found
            .into_iter()
            .filter(|device| self.filter.is_candidate(device))
            .map(DiscoveredDevice::into_device)
            .collect();

        {
            let mut discovered = self
                .discovered
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let active = self.current_device().map(|device| device.id);
            discovered.retain(|id, _| Some(id) == active.as_ref());
            for device in &candidates {
                discovered.insert(device.id.clone(), device.clone());
            }
        }

        info!("Scan complete: {} candidate device(s)", candidates.len());
        self.events.emit(SyncEvent::ScanCompleted(candidates.clone()));

        match failure {
            Some(e) if candidates.is_empty() => Err(e),
            _ => Ok(candidates),
        }
    }

    /// Connect to `device_id` over the transport it was discovered on
    ///
    /// Ids no scan has reported go to the configured default transport.
    pub async fn connect(&self, device_id: &DeviceId) -> Result<Device> {
        let kind = self
            .discovered
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .map(|device| device.transport)
            .unwrap_or(self.config.default_transport);
        self.connect_via(kind, device_id).await
    }

    /// Connect to `device_id` over an explicit transport kind
    pub async fn connect_via(&self, kind: TransportKind, device_id: &DeviceId) -> Result<Device> {
        let transport = self.transport(kind)?.clone();
        let monitor = self.machine.begin_connect(device_id)?;
        let generation = monitor.generation();
        info!("Connecting to {} over {}", device_id, kind);

        let opened = tokio::time::timeout(
            self.config.connect_timeout,
            transport.open(device_id, monitor),
        )
        .await;

        let channel = match opened {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                let reason = e.to_string();
                self.machine.fail_connect(generation, &reason);
                error!("Connect to {} failed: {}", device_id, reason);
                return Err(SyncError::HandshakeFailed { reason });
            }
            Err(_) => {
                let reason = format!(
                    "no answer within {}ms",
                    self.config.connect_timeout.as_millis()
                );
                self.machine.fail_connect(generation, &reason);
                error!("Connect to {} timed out", device_id);
                return Err(SyncError::HandshakeFailed { reason });
            }
        };

        let mut device = channel.device();
        device.transport = kind;
        match self.machine.complete_connect(generation, device, channel.clone()) {
            Ok(device) => {
                *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(device.clone());
                info!("Connected to {}", device.name);
                Ok(device)
            }
            Err(e) => {
                if let Err(close_error) = channel.close().await {
                    debug!("Closing superseded channel failed: {}", close_error);
                }
                Err(e)
            }
        }
    }

    /// Drop the active link; a no-op when nothing is connected
    pub async fn disconnect(&self) -> Result<()> {
        let channel = self.machine.disconnect();
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(channel) = channel {
            info!("Disconnecting from {}", channel.device().name);
            channel.close().await?;
        }
        Ok(())
    }

    /// Leave the Error state
    pub fn reset(&self) -> Result<()> {
        self.machine.reset()
    }

    pub fn status(&self) -> DeviceStatus {
        let device = self.current_device();
        DeviceStatus {
            connected: device.is_some(),
            device_name: device.map(|device| device.name),
        }
    }

    /// Re-derive the current device from the connection state
    pub fn refresh(&self) {
        let state = self.machine.state();
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        match state {
            ConnectionState::Connected(device) => *current = Some(device),
            _ => *current = None,
        }
    }

    pub fn discovered_devices(&self) -> Vec<Device> {
        self.discovered
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn current_device(&self) -> Option<Device> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.machine.state()
    }
}
