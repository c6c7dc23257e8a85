//! Connection State Machine
//!
//! Owns the lifecycle of the single active device connection. The transition
//! table is a pure function on [`ConnectionState`]; [`ConnectionMachine`]
//! applies it under one lock, owns the open channel while connected and
//! emits every transition on the event bus before releasing the lock, so
//! subscribers see transitions in the order they happened.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::errors::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::transport::Channel;
use crate::types::{Device, DeviceId};

// ----------------------------------------------------------------------------
// Connection State Types
// ----------------------------------------------------------------------------

/// Process-wide connection status
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No device link
    #[default]
    Disconnected,
    /// Listening for advertisements
    Scanning,
    /// Opening a link to the given device
    Connecting(DeviceId),
    /// Linked to the active device
    Connected(Device),
    /// Last connect attempt failed; cleared only by reset
    Error(String),
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Scanning => "Scanning",
            ConnectionState::Connecting(_) => "Connecting",
            ConnectionState::Connected(_) => "Connected",
            ConnectionState::Error(_) => "Error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    /// The active device, if any
    pub fn connected_device(&self) -> Option<&Device> {
        match self {
            ConnectionState::Connected(device) => Some(device),
            _ => None,
        }
    }

    /// Apply `event`, returning the next state
    pub fn transition(&self, event: &ConnectionEvent) -> Result<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            (S::Disconnected, E::StartScan) => Ok(S::Scanning),
            (S::Scanning, E::StartScan) => Err(SyncError::AlreadyScanning),
            (S::Connecting(_), E::StartScan) => Err(SyncError::busy("connect")),
            (S::Connected(_), E::StartScan) => Err(SyncError::busy("active connection")),
            (S::Scanning, E::ScanFinished) => Ok(S::Disconnected),

            (S::Disconnected, E::Connect(id)) => Ok(S::Connecting(id.clone())),
            (S::Scanning, E::Connect(_)) => Err(SyncError::busy("scan")),
            (S::Connecting(_), E::Connect(_)) => Err(SyncError::busy("connect")),
            (S::Connected(_), E::Connect(_)) => Err(SyncError::busy("active connection")),

            (S::Connecting(_), E::HandshakeSucceeded(device)) => {
                let mut device = device.clone();
                device.connected = true;
                Ok(S::Connected(device))
            }
            (S::Connecting(_), E::HandshakeFailed(reason)) => Ok(S::Error(reason.clone())),
            (S::Connecting(_), E::LinkLost(reason)) => Ok(S::Error(reason.clone())),
            (S::Connecting(_), E::Disconnect) => Ok(S::Disconnected),

            (S::Connected(_), E::Disconnect) | (S::Connected(_), E::LinkLost(_)) => {
                Ok(S::Disconnected)
            }

            (S::Error(_), E::Reset) => Ok(S::Disconnected),

            (state, event) => Err(SyncError::InvalidTransition {
                state: state.name(),
                operation: event.name(),
            }),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting(id) => write!(f, "Connecting to {}", id),
            ConnectionState::Connected(device) => write!(f, "Connected to {}", device.name),
            ConnectionState::Error(reason) => write!(f, "Error: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

// ----------------------------------------------------------------------------
// State Transition Events
// ----------------------------------------------------------------------------

/// Inputs to the transition table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StartScan,
    ScanFinished,
    Connect(DeviceId),
    HandshakeSucceeded(Device),
    HandshakeFailed(String),
    Disconnect,
    LinkLost(String),
    Reset,
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::StartScan => "scan",
            ConnectionEvent::ScanFinished => "finish scan",
            ConnectionEvent::Connect(_) => "connect",
            ConnectionEvent::HandshakeSucceeded(_) => "complete handshake",
            ConnectionEvent::HandshakeFailed(_) => "fail handshake",
            ConnectionEvent::Disconnect => "disconnect",
            ConnectionEvent::LinkLost(_) => "lose link",
            ConnectionEvent::Reset => "reset",
        }
    }
}

// ----------------------------------------------------------------------------
// Link Handles
// ----------------------------------------------------------------------------

struct ActiveLink {
    channel: Arc<dyn Channel>,
    lost: watch::Sender<bool>,
}

/// Snapshot of the open channel handed to request issuers
#[derive(Clone)]
pub struct LinkHandle {
    pub generation: u64,
    pub channel: Arc<dyn Channel>,
    /// Flips to `true` when this link goes away
    pub lost: watch::Receiver<bool>,
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkHandle")
            .field("generation", &self.generation)
            .field("lost", &*self.lost.borrow())
            .finish()
    }
}

/// Lets a transport report an asynchronous disconnect for one connect attempt
///
/// Signals from a monitor whose attempt has since been superseded are
/// ignored.
#[derive(Clone)]
pub struct LinkMonitor {
    generation: u64,
    machine: Weak<ConnectionMachine>,
}

impl LinkMonitor {
    /// A monitor not attached to any machine
    pub fn detached() -> Self {
        Self {
            generation: 0,
            machine: Weak::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report that the physical link went away
    pub fn signal_lost(&self, reason: &str) {
        if let Some(machine) = self.machine.upgrade() {
            machine.link_lost(self.generation, reason);
        }
    }
}

impl fmt::Debug for LinkMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkMonitor")
            .field("generation", &self.generation)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Connection Machine
// ----------------------------------------------------------------------------

struct MachineInner {
    state: ConnectionState,
    /// Identifies the current connect attempt
    generation: u64,
    link: Option<ActiveLink>,
}

/// Sole writer of the process-wide [`ConnectionState`]
pub struct ConnectionMachine {
    inner: Mutex<MachineInner>,
    events: EventBus,
}

impl ConnectionMachine {
    pub fn new(events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MachineInner {
                state: ConnectionState::Disconnected,
                generation: 0,
                link: None,
            }),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, MachineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().state.is_connected()
    }

    /// Move to `next` and announce it; caller holds the lock
    fn enter(&self, inner: &mut MachineInner, next: ConnectionState) {
        info!("Connection state: {} -> {}", inner.state.name(), next.name());
        inner.state = next.clone();
        self.events.emit(SyncEvent::StateChanged(next));
    }

    /// Close out the active link and announce the disconnect once
    fn drop_link(&self, inner: &mut MachineInner) -> Option<Arc<dyn Channel>> {
        let device = inner.state.connected_device().cloned();
        let link = inner.link.take();
        if let Some(link) = &link {
            link.lost.send_replace(true);
        }
        inner.generation += 1;

        self.enter(inner, ConnectionState::Disconnected);
        if let Some(mut device) = device {
            device.connected = false;
            self.events.emit(SyncEvent::DeviceDisconnected(device));
        }
        link.map(|link| link.channel)
    }

    /// Disconnected -> Scanning
    pub fn begin_scan(&self) -> Result<()> {
        let mut inner = self.lock();
        let next = inner.state.transition(&ConnectionEvent::StartScan)?;
        self.enter(&mut inner, next);
        Ok(())
    }

    /// Scanning -> Disconnected; no-op in any other state
    pub fn finish_scan(&self) {
        let mut inner = self.lock();
        if let Ok(next) = inner.state.transition(&ConnectionEvent::ScanFinished) {
            self.enter(&mut inner, next);
        }
    }

    /// Disconnected -> Connecting, returning the monitor for this attempt
    pub fn begin_connect(self: &Arc<Self>, device_id: &DeviceId) -> Result<LinkMonitor> {
        let mut inner = self.lock();
        let next = inner
            .state
            .transition(&ConnectionEvent::Connect(device_id.clone()))?;
        inner.generation += 1;
        self.enter(&mut inner, next);

        Ok(LinkMonitor {
            generation: inner.generation,
            machine: Arc::downgrade(self),
        })
    }

    /// Connecting -> Connected, taking ownership of the opened channel
    ///
    /// Fails when the attempt identified by `generation` was superseded,
    /// in which case the caller still owns the channel and must close it.
    pub fn complete_connect(
        &self,
        generation: u64,
        device: Device,
        channel: Arc<dyn Channel>,
    ) -> Result<Device> {
        let mut inner = self.lock();
        if inner.generation != generation {
            return Err(SyncError::HandshakeFailed {
                reason: "connect attempt was superseded".to_string(),
            });
        }

        let next = inner
            .state
            .transition(&ConnectionEvent::HandshakeSucceeded(device))?;
        let device = match next.connected_device() {
            Some(device) => device.clone(),
            None => {
                return Err(SyncError::InvalidTransition {
                    state: inner.state.name(),
                    operation: "complete handshake",
                })
            }
        };

        let (lost, _) = watch::channel(false);
        inner.link = Some(ActiveLink { channel, lost });
        self.enter(&mut inner, next);
        self.events.emit(SyncEvent::DeviceConnected(device.clone()));
        Ok(device)
    }

    /// Connecting -> Error for the attempt identified by `generation`
    pub fn fail_connect(&self, generation: u64, reason: &str) {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!("Ignoring failure of superseded connect attempt {}", generation);
            return;
        }
        if let Ok(next) = inner
            .state
            .transition(&ConnectionEvent::HandshakeFailed(reason.to_string()))
        {
            warn!("Connect attempt failed: {}", reason);
            self.enter(&mut inner, next);
        }
    }

    /// User-initiated disconnect
    ///
    /// Returns the channel to close if a link was active. A no-op while
    /// Disconnected, Scanning or in Error.
    pub fn disconnect(&self) -> Option<Arc<dyn Channel>> {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Connected(_) => self.drop_link(&mut inner),
            ConnectionState::Connecting(_) => {
                inner.generation += 1;
                self.enter(&mut inner, ConnectionState::Disconnected);
                None
            }
            _ => None,
        }
    }

    /// Asynchronous link loss reported for the attempt `generation`
    pub fn link_lost(&self, generation: u64, reason: &str) {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!("Ignoring link loss from stale link {}", generation);
            return;
        }

        match inner.state {
            ConnectionState::Connected(_) => {
                warn!("Link to device lost: {}", reason);
                self.drop_link(&mut inner);
            }
            ConnectionState::Connecting(_) => {
                warn!("Link lost during connect: {}", reason);
                inner.generation += 1;
                self.enter(&mut inner, ConnectionState::Error(reason.to_string()));
            }
            _ => {}
        }
    }

    /// Error -> Disconnected; a no-op when already Disconnected
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Disconnected {
            return Ok(());
        }
        let next = inner.state.transition(&ConnectionEvent::Reset)?;
        self.enter(&mut inner, next);
        Ok(())
    }

    /// Handle to the open channel while Connected
    pub fn active_link(&self) -> Option<LinkHandle> {
        let inner = self.lock();
        match (&inner.state, &inner.link) {
            (ConnectionState::Connected(_), Some(link)) => Some(LinkHandle {
                generation: inner.generation,
                channel: link.channel.clone(),
                lost: link.lost.subscribe(),
            }),
            _ => None,
        }
    }
}

impl fmt::Debug for ConnectionMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMachine")
            .field("state", &self.state())
            .finish()
    }
}
