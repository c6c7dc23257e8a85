//! Sync Cache
//!
//! In-memory mirror of the device's conversations and messages. Reads fall
//! back to the last snapshot whenever the device cannot answer; sends are
//! optimistic and stay visible whatever the outcome; attachments are
//! downloaded once into an on-disk cache.

pub mod attachments;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::connection::ConnectionMachine;
use crate::errors::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::protocol::{
    AttachmentDescriptor, ConversationsPayload, MessagesPayload, Push, Request, SendReceipt,
    WireMessage,
};
use crate::transport::{Endpoint, RequestPipe};
use crate::types::{
    Attachment, AttachmentId, AttachmentKind, Conversation, ConversationId, DeliveryStatus,
    Message, MessageId, Timestamp,
};

pub use attachments::AttachmentStore;
pub use store::{ConversationStore, MessageArena};

// ----------------------------------------------------------------------------
// Snapshots
// ----------------------------------------------------------------------------

/// Where the items of a [`Snapshot`] came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSource {
    /// Fresh from the connected device
    Device,
    /// Local copy; no device was connected
    Cache,
    /// Local copy after the device failed to answer
    StaleCache { error: String },
}

/// Result of a cache read
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    pub items: Vec<T>,
    pub source: SnapshotSource,
}

impl<T> Snapshot<T> {
    fn new(items: Vec<T>, source: SnapshotSource) -> Self {
        Self { items, source }
    }

    /// Whether the device was asked and failed to answer
    pub fn is_stale(&self) -> bool {
        matches!(self.source, SnapshotSource::StaleCache { .. })
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

// ----------------------------------------------------------------------------
// Sync Cache
// ----------------------------------------------------------------------------

#[derive(Default)]
struct CacheState {
    conversations: ConversationStore,
    messages: MessageArena,
}

/// Owner of all conversation, message and attachment data
pub struct SyncCache {
    config: SyncConfig,
    machine: Arc<ConnectionMachine>,
    pipe: RequestPipe,
    events: EventBus,
    state: Mutex<CacheState>,
    attachments: AttachmentStore,
    push_listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCache {
    pub fn new(config: SyncConfig, machine: Arc<ConnectionMachine>, events: EventBus) -> Self {
        Self {
            pipe: RequestPipe::new(machine.clone(), config.request_timeout)
                .with_max_chunk_payload(config.max_chunk_payload),
            attachments: AttachmentStore::new(config.attachment_dir.clone()),
            config,
            machine,
            events,
            state: Mutex::new(CacheState::default()),
            push_listener: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Local conversation list without touching the device
    pub fn conversations(&self) -> Vec<Conversation> {
        self.lock().conversations.list()
    }

    /// Local messages of one conversation without touching the device
    pub fn messages(&self, conversation: &ConversationId) -> Vec<Message> {
        self.lock().messages.thread(conversation)
    }

    pub fn message(&self, id: &MessageId) -> Option<Message> {
        self.lock().messages.get(id).cloned()
    }

    pub fn attachment_store(&self) -> &AttachmentStore {
        &self.attachments
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Sync the conversation list, degrading to the local snapshot
    pub async fn fetch_conversations(&self) -> Snapshot<Conversation> {
        if !self.machine.is_connected() {
            return Snapshot::new(self.conversations(), SnapshotSource::Cache);
        }

        let fetched = self
            .pipe
            .request(Endpoint::Messages, &Request::get_conversations())
            .await
            .and_then(|response| response.into_data::<ConversationsPayload>());

        match fetched {
            Ok(payload) => {
                let self_sender = &self.config.self_sender_id;
                let mut state = self.lock();
                state.conversations.merge(
                    payload
                        .conversations
                        .into_iter()
                        .map(|conversation| conversation.into_conversation(self_sender)),
                );
                let list = state.conversations.list();
                info!("Synced {} conversation(s)", list.len());
                self.events.emit(SyncEvent::ConversationsUpdated(list.clone()));
                Snapshot::new(list, SnapshotSource::Device)
            }
            Err(e) => {
                warn!("Conversation sync failed, serving cached copy: {}", e);
                Snapshot::new(
                    self.conversations(),
                    SnapshotSource::StaleCache {
                        error: e.to_string(),
                    },
                )
            }
        }
    }

    /// Sync one conversation's messages, degrading to the local snapshot
    pub async fn fetch_messages(&self, conversation: &ConversationId) -> Snapshot<Message> {
        if !self.machine.is_connected() {
            return Snapshot::new(self.messages(conversation), SnapshotSource::Cache);
        }

        let fetched = self
            .pipe
            .request(Endpoint::Messages, &Request::get_messages(conversation))
            .await
            .and_then(|response| response.into_data::<MessagesPayload>());

        match fetched {
            Ok(payload) => {
                let self_sender = &self.config.self_sender_id;
                let snapshot = payload
                    .messages
                    .into_iter()
                    .map(|message| message.into_message(conversation, self_sender))
                    .collect();

                let mut state = self.lock();
                let messages = state.messages.replace_thread(conversation, snapshot);
                debug!("Synced {} message(s) in {}", messages.len(), conversation);
                self.events.emit(SyncEvent::MessagesUpdated {
                    conversation_id: conversation.clone(),
                    messages: messages.clone(),
                });
                Snapshot::new(messages, SnapshotSource::Device)
            }
            Err(e) => {
                warn!("Message sync for {} failed, serving cached copy: {}", conversation, e);
                Snapshot::new(
                    self.messages(conversation),
                    SnapshotSource::StaleCache {
                        error: e.to_string(),
                    },
                )
            }
        }
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    async fn read_attachments(
        &self,
        message_id: &MessageId,
        paths: &[PathBuf],
    ) -> Result<(Vec<AttachmentDescriptor>, Vec<Attachment>)> {
        let mut descriptors = Vec::with_capacity(paths.len());
        let mut attachments = Vec::with_capacity(paths.len());

        for (index, path) in paths.iter().enumerate() {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| SyncError::InvalidAttachment {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            let descriptor = AttachmentDescriptor::from_bytes(path, &bytes);

            attachments.push(Attachment {
                id: AttachmentId::new(format!("{}-att-{}", message_id, index)),
                kind: AttachmentKind::from_path(path),
                filename: descriptor.filename.clone(),
                mime_type: descriptor.mime_type.clone(),
                size: descriptor.size,
                local_path: Some(path.clone()),
                thumbnail: None,
            });
            descriptors.push(descriptor);
        }
        Ok((descriptors, attachments))
    }

    /// Send a message optimistically
    ///
    /// The message is visible with status `Sending` before the device is
    /// asked, then moves in place to `Sent` or `Failed`. A failed send stays
    /// in the cache and its error is returned.
    pub async fn send_message(
        &self,
        conversation: &ConversationId,
        text: &str,
        attachment_paths: &[PathBuf],
    ) -> Result<Message> {
        if !self.machine.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let id = MessageId::temporary();
        let (descriptors, attachments) = self.read_attachments(&id, attachment_paths).await?;

        let message = Message {
            id: id.clone(),
            conversation_id: conversation.clone(),
            sender: self.config.self_sender_id.clone(),
            text: (!text.is_empty()).then(|| text.to_string()),
            attachments,
            timestamp: Timestamp::now(),
            is_from_me: true,
            status: DeliveryStatus::Sending,
            remote_id: None,
        };
        {
            let mut state = self.lock();
            state.messages.append(message.clone());
            self.events.emit(SyncEvent::MessageAdded(message.clone()));
        }

        let request = Request::send_message(conversation, &id, text, descriptors);
        let outcome = self
            .pipe
            .request(Endpoint::Messages, &request)
            .await
            .and_then(|response| response.into_optional_data::<SendReceipt>());

        let mut state = self.lock();
        let mut current = state.messages.get(&id).cloned().unwrap_or(message);
        match outcome {
            Ok(receipt) => {
                current.status = DeliveryStatus::Sent;
                current.remote_id = receipt
                    .and_then(|receipt| receipt.message_id)
                    .filter(|remote| remote != id.as_str());
                if !state.messages.update(current.clone()) {
                    state.messages.append(current.clone());
                }
                if let Some(entry) = state.conversations.get_mut(conversation) {
                    entry.last_message = Some(Box::new(current.clone()));
                }
                info!("Message {} sent to {}", id, conversation);
                self.events.emit(SyncEvent::MessageUpdated(current.clone()));
                Ok(current)
            }
            Err(e) => {
                current.status = DeliveryStatus::Failed;
                if !state.messages.update(current.clone()) {
                    state.messages.append(current.clone());
                }
                error!("Message {} to {} failed: {}", id, conversation, e);
                self.events.emit(SyncEvent::MessageUpdated(current));
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Attachments
    // ------------------------------------------------------------------------

    /// Download an attachment into the cache directory
    ///
    /// Idempotent: a cached file is returned without touching the device,
    /// and concurrent calls for one id share a single transfer.
    pub async fn download_attachment(&self, id: &AttachmentId) -> Result<PathBuf> {
        let path = self
            .attachments
            .get_or_fetch(id, || async {
                if !self.machine.is_connected() {
                    return Err(SyncError::NotConnected);
                }
                info!("Downloading attachment {}", id);
                self.pipe
                    .request_large(Endpoint::Attachments, &Request::get_attachment(id))
                    .await
            })
            .await?;

        self.record_local_path(id, &path);
        Ok(path)
    }

    fn record_local_path(&self, id: &AttachmentId, path: &Path) {
        let mut state = self.lock();
        state.conversations.set_attachment_path(id, path);
        for message in state.messages.set_attachment_path(id, path) {
            self.events.emit(SyncEvent::MessageUpdated(message));
        }
    }

    // ------------------------------------------------------------------------
    // Device Pushes
    // ------------------------------------------------------------------------

    /// Start consuming device pushes for the current link
    ///
    /// The subscription is in place when this returns.
    pub async fn on_connected(self: &Arc<Self>) {
        let Some(link) = self.machine.active_link() else {
            return;
        };
        let mut pushes = match link.channel.subscribe(Endpoint::Notifications).await {
            Ok(pushes) => pushes,
            Err(SyncError::Unsupported { what }) => {
                debug!("Device pushes unavailable: {}", what);
                return;
            }
            Err(e) => {
                warn!("Subscribing to device pushes failed: {}", e);
                return;
            }
        };

        let cache = Arc::downgrade(self);
        let listener = tokio::spawn(async move {
            while let Some(bytes) = pushes.recv().await {
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                match Push::decode(&bytes) {
                    Ok(push) => cache.apply_push(push),
                    Err(e) => warn!("Dropping malformed push: {}", e),
                }
            }
            debug!("Push listener stopped");
        });

        let previous = self
            .push_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(listener);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop consuming device pushes
    pub fn on_disconnected(&self) {
        let listener = self
            .push_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
    }

    /// Apply one decoded device push
    pub fn apply_push(&self, push: Push) {
        match push {
            Push::MessageReceived { message } => self.receive_message(message),
            Push::MessageStatus { message_id, status } => {
                let mut state = self.lock();
                let local_id = state.messages.resolve(&message_id).map(|m| m.id.clone());
                match local_id.and_then(|id| state.messages.set_status(&id, status)) {
                    Some(message) => self.events.emit(SyncEvent::MessageUpdated(message)),
                    None => debug!("Status push for unknown message {}", message_id),
                }
            }
        }
    }

    fn receive_message(&self, wire: WireMessage) {
        let Some(conversation) = wire.conversation_id.clone() else {
            warn!("Dropping pushed message {} without a conversation", wire.id);
            return;
        };
        let message = wire.into_message(&conversation, &self.config.self_sender_id);

        let mut state = self.lock();
        if let Some(updated) = state.messages.reconcile(message.clone()) {
            debug!("Push for known message {} merged", updated.id);
            self.events.emit(SyncEvent::MessageUpdated(updated));
            return;
        }

        state.messages.append(message.clone());
        self.events.emit(SyncEvent::MessageAdded(message.clone()));

        if let Some(entry) = state.conversations.get_mut(&conversation) {
            if !message.is_from_me {
                entry.unread_count += 1;
            }
            entry.last_message = Some(Box::new(message));
            let list = state.conversations.list();
            self.events.emit(SyncEvent::ConversationsUpdated(list));
        }
    }
}

impl Drop for SyncCache {
    fn drop(&mut self) {
        self.on_disconnected();
    }
}

impl std::fmt::Debug for SyncCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SyncCache")
            .field("conversations", &state.conversations.len())
            .field("messages", &state.messages.len())
            .finish()
    }
}
