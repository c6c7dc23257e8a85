//! Sync context
//!
//! Builds the event bus, connection machine, coordinator and cache once and
//! wires them together. Callers hold a [`SyncContext`] and pass it by
//! reference; nothing in the engine is reachable through globals.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{Snapshot, SyncCache};
use crate::config::SyncConfig;
use crate::connection::{ConnectionMachine, ConnectionState};
use crate::coordinator::{DeviceCoordinator, DeviceStatus};
use crate::errors::Result;
use crate::events::{EventBus, EventKind, ListenerHandle, Subscription, SyncEvent};
use crate::transport::Transport;
use crate::types::{AttachmentId, Conversation, ConversationId, Device, DeviceId, Message};

// ----------------------------------------------------------------------------
// Context Builder
// ----------------------------------------------------------------------------

/// Builder for a [`SyncContext`]
#[derive(Default)]
pub struct SyncContextBuilder {
    config: SyncConfig,
    transports: Vec<Arc<dyn Transport>>,
}

impl SyncContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine configuration
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a transport; one per [`TransportKind`](crate::types::TransportKind)
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.retain(|existing| existing.kind() != transport.kind());
        self.transports.push(transport);
        self
    }

    /// Assemble the engine and start its supervisor task
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> SyncContext {
        let events = EventBus::new();
        let machine = ConnectionMachine::new(events.clone());
        let coordinator = Arc::new(DeviceCoordinator::new(
            self.config.clone(),
            self.transports,
            machine.clone(),
            events.clone(),
        ));
        let cache = Arc::new(SyncCache::new(self.config.clone(), machine.clone(), events.clone()));

        let mut connectivity = events.subscribe([
            EventKind::StateChanged,
            EventKind::DeviceDisconnected,
        ]);
        let supervised_coordinator = coordinator.clone();
        let supervised_cache = Arc::downgrade(&cache);
        let supervisor = tokio::spawn(async move {
            while let Some(event) = connectivity.recv().await {
                match event {
                    SyncEvent::StateChanged(_) => supervised_coordinator.refresh(),
                    SyncEvent::DeviceDisconnected(device) => {
                        debug!("Device {} gone, stopping push listener", device.id);
                        if let Some(cache) = supervised_cache.upgrade() {
                            cache.on_disconnected();
                        }
                    }
                    _ => {}
                }
            }
        });

        info!("Sync context ready");
        SyncContext {
            config: self.config,
            events,
            machine,
            coordinator,
            cache,
            supervisor,
        }
    }
}

// ----------------------------------------------------------------------------
// Sync Context
// ----------------------------------------------------------------------------

/// The device-sync engine as seen by the UI/IPC layer
pub struct SyncContext {
    config: SyncConfig,
    events: EventBus,
    machine: Arc<ConnectionMachine>,
    coordinator: Arc<DeviceCoordinator>,
    cache: Arc<SyncCache>,
    supervisor: JoinHandle<()>,
}

impl SyncContext {
    pub fn builder() -> SyncContextBuilder {
        SyncContextBuilder::new()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &DeviceCoordinator {
        &self.coordinator
    }

    pub fn cache(&self) -> &SyncCache {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    pub async fn scan(&self) -> Result<Vec<Device>> {
        self.coordinator.scan().await
    }

    /// Connect and start listening for device pushes
    pub async fn connect(&self, device_id: &DeviceId) -> Result<Device> {
        let device = self.coordinator.connect(device_id).await?;
        self.cache.on_connected().await;
        Ok(device)
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.cache.on_disconnected();
        self.coordinator.disconnect().await
    }

    pub fn reset(&self) -> Result<()> {
        self.coordinator.reset()
    }

    pub fn status(&self) -> DeviceStatus {
        self.coordinator.status()
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    // ------------------------------------------------------------------------
    // Conversations and Messages
    // ------------------------------------------------------------------------

    pub async fn fetch_conversations(&self) -> Snapshot<Conversation> {
        self.cache.fetch_conversations().await
    }

    pub async fn fetch_messages(&self, conversation: &ConversationId) -> Snapshot<Message> {
        self.cache.fetch_messages(conversation).await
    }

    pub async fn send_message(
        &self,
        conversation: &ConversationId,
        text: &str,
        attachment_paths: &[PathBuf],
    ) -> Result<Message> {
        self.cache
            .send_message(conversation, text, attachment_paths)
            .await
    }

    pub async fn download_attachment(&self, attachment: &AttachmentId) -> Result<PathBuf> {
        self.cache.download_attachment(attachment).await
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub fn subscribe(&self, kinds: impl IntoIterator<Item = EventKind>) -> Subscription {
        self.events.subscribe(kinds)
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.events.subscribe_all()
    }

    /// Run `handler` for each matching event until the handle is dropped
    pub fn listen<F>(&self, kinds: impl IntoIterator<Item = EventKind>, handler: F) -> ListenerHandle
    where
        F: FnMut(SyncEvent) + Send + 'static,
    {
        self.events.listen(kinds, handler)
    }

    /// Disconnect and stop background work
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down sync context");
        self.disconnect().await
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("state", &self.machine.state())
            .field("cache", &self.cache)
            .finish()
    }
}
